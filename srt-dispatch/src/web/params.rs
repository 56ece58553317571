//! Validation of conversion request parameters.

use std::path::Path;

use serde::Deserialize;

use crate::queue::ConversionParams;

const MEDIA_EXTENSIONS: [&str; 3] = ["mp4", "mp3", "wav"];

/// Query string of `POST /convert`; the request body is the raw media file.
#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub file_name: String,
    pub words_per_line: Option<String>,
    pub punctuation: Option<String>,
    pub consider_punctuation: Option<String>,
    /// Duration of the media in seconds
    pub duration: Option<f64>,
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidConvert {
    pub user_id: String,
    pub email: String,
    pub file_name: String,
    pub duration: f64,
    pub params: ConversionParams,
}

/// Check the query and return a message suitable for a 400 response on failure.
pub fn validate(query: &ConvertQuery) -> Result<ValidConvert, String> {
    if query.user_id.trim().is_empty() {
        return Err("user_id is required".to_string());
    }
    if query.email.trim().is_empty() {
        return Err("email is required".to_string());
    }
    if query.file_name.trim().is_empty() {
        return Err("File is required. Please try again.".to_string());
    }
    if !is_media_file(&query.file_name) {
        return Err("Invalid file format. Only mp4, mp3 and wav files are accepted.".to_string());
    }

    let words_per_line = match query.words_per_line.as_deref().map(str::trim) {
        None | Some("") => return Err("words per line is required".to_string()),
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) if (1..=5).contains(&v) => v,
            _ => return Err("words per line must be between 1 and 5".to_string()),
        },
    };

    let punctuation = parse_flag("punctuation", query.punctuation.as_deref())?;
    let consider_punctuation =
        parse_flag("consider_punctuation", query.consider_punctuation.as_deref())?;

    if !punctuation && consider_punctuation {
        return Err("consider_punctuation cannot be true when punctuation is false".to_string());
    }

    let duration = match query.duration {
        Some(d) if d.is_finite() && d > 0.0 => d,
        _ => return Err("duration must be a positive number of seconds".to_string()),
    };

    Ok(ValidConvert {
        user_id: query.user_id.trim().to_string(),
        email: query.email.trim().to_string(),
        file_name: query.file_name.trim().to_string(),
        duration,
        params: ConversionParams {
            words_per_line,
            punctuation,
            consider_punctuation,
        },
    })
}

fn parse_flag(field: &str, raw: Option<&str>) -> Result<bool, String> {
    match raw.map(str::trim) {
        None | Some("") => Err(format!("{field} is required")),
        Some("1" | "t" | "T" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "f" | "F" | "false" | "FALSE" | "False") => Ok(false),
        Some(_) => Err(format!("invalid {field} value")),
    }
}

pub fn is_media_file(file_name: &str) -> bool {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
