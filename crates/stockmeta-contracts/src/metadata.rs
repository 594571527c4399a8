use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const REQUIRED_FIELDS: [&str; 3] = ["title", "description", "keywords"];

/// Validated result of one generation cycle.
///
/// All three fields are non-empty. `keywords` stays a single comma-delimited
/// field because that is how the form-filling step consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub title: String,
    pub description: String,
    pub keywords: String,
}

impl MetadataRecord {
    pub fn keyword_list(&self) -> Vec<String> {
        self.keywords
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("no JSON object found in generated text")]
    NoJsonFound,
    #[error("generated JSON could not be parsed: {details}")]
    InvalidJson { details: String },
    #[error("generated JSON is missing required fields: {}", .missing.join(", "))]
    MissingFields { missing: Vec<String> },
}

/// Recovers a [`MetadataRecord`] from free-form generated text.
///
/// The outermost `{ ... }` span is taken as the payload, so prose or code
/// fences around the object are tolerated. An unrelated brace block after the
/// real object would widen the span and surface as `InvalidJson`.
pub fn extract(raw: &str) -> Result<MetadataRecord, ExtractError> {
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(ExtractError::NoJsonFound);
    };
    if end < start {
        return Err(ExtractError::NoJsonFound);
    }

    let cleaned = clean_candidate(&raw[start..=end]);
    let parsed: Value =
        serde_json::from_str(&cleaned).map_err(|err| ExtractError::InvalidJson {
            details: err.to_string(),
        })?;
    let Value::Object(object) = parsed else {
        return Err(ExtractError::InvalidJson {
            details: "expected a JSON object".to_string(),
        });
    };
    record_from_object(&object)
}

fn clean_candidate(candidate: &str) -> String {
    let without_fences = strip_fence_markers(candidate);
    without_fences
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

fn strip_fence_markers(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest;
        if body
            .get(..4)
            .map(|head| head.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
        {
            body = &body[4..];
        }
        body = body.trim_start();
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest.trim_end();
    }
    body
}

fn record_from_object(object: &Map<String, Value>) -> Result<MetadataRecord, ExtractError> {
    let missing = REQUIRED_FIELDS
        .iter()
        .filter(|key| field_text(object, key).is_none())
        .map(|key| (*key).to_string())
        .collect::<Vec<String>>();
    if !missing.is_empty() {
        return Err(ExtractError::MissingFields { missing });
    }

    Ok(MetadataRecord {
        title: field_text(object, "title").unwrap_or_default(),
        description: field_text(object, "description").unwrap_or_default(),
        keywords: field_text(object, "keywords").unwrap_or_default(),
    })
}

fn field_text(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
