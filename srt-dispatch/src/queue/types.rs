//! Queue message types.
//!
//! This module defines the message formats for:
//! - the work queue: `ConversionMessage`, a self-contained job carrying the raw file
//! - the reply queues: `LambdaResponse`, an HTTP-status-shaped result

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STATUS_OK: u16 = 200;
pub const STATUS_ACCEPTED: u16 = 202;
pub const STATUS_FAILED: u16 = 500;

/// Message returned while a slow job keeps running after the caller stopped waiting.
pub const ACCEPTED_MESSAGE: &str =
    "Your request is being processed. You will be notified by email when it's completed.";

/// Message handed to synchronous callers instead of the worker's error detail.
pub const RETRY_LATER_MESSAGE: &str =
    "An error occurred. Please try again later or contact support.";

// =============================================================================
// Job Envelope (work queue)
// =============================================================================

/// Options that shape the generated subtitles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionParams {
    pub words_per_line: u32,
    pub punctuation: bool,
    pub consider_punctuation: bool,
}

/// A conversion job as stored in the work queue.
///
/// The file bytes travel inside the message so a job can be replayed without
/// any external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionMessage {
    /// Owner of the job
    pub user_id: String,
    pub words_per_line: u32,
    pub punctuation: bool,
    pub consider_punctuation: bool,
    /// Original upload name
    pub file_name: String,
    /// Generated job identifier, also used as the correlation id
    pub file_id: String,
    /// Raw media bytes, base64 on the wire
    #[serde(with = "base64_bytes")]
    pub file_content: Vec<u8>,
    pub file_size: u64,
    /// Duration hint in seconds
    pub file_duration: f64,
    /// Where the completion notification goes
    pub email: String,
}

impl ConversionMessage {
    /// Build a job with a freshly generated identifier.
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        file_name: impl Into<String>,
        file_content: Vec<u8>,
        file_duration: f64,
        params: ConversionParams,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            words_per_line: params.words_per_line,
            punctuation: params.punctuation,
            consider_punctuation: params.consider_punctuation,
            file_name: file_name.into(),
            file_id: Uuid::new_v4().to_string(),
            file_size: file_content.len() as u64,
            file_content,
            file_duration,
            email: email.into(),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    // `null` is how an empty byte slice used to be encoded by older producers.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => STANDARD.decode(raw).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

// =============================================================================
// Result Envelope (reply queues)
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LambdaBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub srt_url: String,
    #[serde(default)]
    pub duration: f64,
}

/// Result of a conversion, shared by the synchronous and background paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaResponse {
    pub status_code: u16,
    pub body: LambdaBody,
}

impl LambdaResponse {
    pub fn success(srt_url: impl Into<String>, duration: f64) -> Self {
        Self {
            status_code: STATUS_OK,
            body: LambdaBody {
                message: String::new(),
                srt_url: srt_url.into(),
                duration,
            },
        }
    }

    /// Reply sent by a worker when processing failed.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status_code: STATUS_FAILED,
            body: LambdaBody {
                message: message.into(),
                ..Default::default()
            },
        }
    }

    /// Synthetic result for a caller whose wait timed out.
    pub fn accepted() -> Self {
        Self {
            status_code: STATUS_ACCEPTED,
            body: LambdaBody {
                message: ACCEPTED_MESSAGE.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_OK
    }

    /// Replace error detail with a generic message before it reaches a caller.
    pub fn redacted(mut self) -> Self {
        if !self.is_success() {
            self.body.message = RETRY_LATER_MESSAGE.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConversionParams {
        ConversionParams {
            words_per_line: 3,
            punctuation: true,
            consider_punctuation: false,
        }
    }

    #[test]
    fn test_new_message_fills_identity_and_size() {
        let a = ConversionMessage::new("u1", "a@example.com", "talk.mp3", vec![1, 2, 3], 2.0, params());
        let b = ConversionMessage::new("u1", "a@example.com", "talk.mp3", vec![], 2.0, params());

        assert_eq!(a.file_size, 3);
        assert_eq!(b.file_size, 0);
        assert_ne!(a.file_id, b.file_id);
        assert!(Uuid::parse_str(&a.file_id).is_ok());
        assert_eq!(a.words_per_line, 3);
        assert!(a.punctuation && !a.consider_punctuation);
    }

    #[test]
    fn test_file_content_is_base64_on_the_wire() {
        let mut msg = ConversionMessage::new("u1", "a@example.com", "talk.mp3", b"abc".to_vec(), 2.0, params());
        msg.file_id = "f1".to_string();

        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["file_content"], "YWJj");
        assert_eq!(json["file_id"], "f1");
        assert_eq!(json["words_per_line"], 3);

        let parsed: ConversionMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.file_content, b"abc");
    }

    #[test]
    fn test_null_file_content_decodes_empty() {
        let json = r#"{
            "user_id": "65f0c0ffee",
            "words_per_line": 2,
            "punctuation": false,
            "consider_punctuation": false,
            "file_name": "a.wav",
            "file_id": "f1",
            "file_content": null,
            "file_size": 0,
            "file_duration": 1.5,
            "email": "a@example.com"
        }"#;

        let msg: ConversionMessage = serde_json::from_str(json).unwrap();
        assert!(msg.file_content.is_empty());
        assert_eq!(msg.file_duration, 1.5);
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let json = r#"{"user_id":"u","words_per_line":1,"punctuation":false,"consider_punctuation":false,
            "file_name":"a","file_id":"f","file_content":"***","file_size":0,"file_duration":0,"email":"e"}"#;
        assert!(serde_json::from_str::<ConversionMessage>(json).is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        let json = r#"{"status_code":200,"body":{"message":"","srt_url":"https://cdn/x.srt","duration":12.5}}"#;
        let resp: LambdaResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp, LambdaResponse::success("https://cdn/x.srt", 12.5));

        let minimal: LambdaResponse =
            serde_json::from_str(r#"{"status_code":500,"body":{"message":"boom"}}"#).unwrap();
        assert_eq!(minimal, LambdaResponse::failure("boom"));
    }

    #[test]
    fn test_redacted_hides_error_detail() {
        let failed = LambdaResponse::failure("lambda: quota exceeded for user 42").redacted();
        assert_eq!(failed.status_code, STATUS_FAILED);
        assert_eq!(failed.body.message, RETRY_LATER_MESSAGE);

        let ok = LambdaResponse::success("https://cdn/x.srt", 1.0).redacted();
        assert_eq!(ok.body.srt_url, "https://cdn/x.srt");
        assert!(ok.body.message.is_empty());
    }

    #[test]
    fn test_accepted() {
        let resp = LambdaResponse::accepted();
        assert_eq!(resp.status_code, STATUS_ACCEPTED);
        assert_eq!(resp.body.message, ACCEPTED_MESSAGE);
        assert!(!resp.is_success());
    }
}
