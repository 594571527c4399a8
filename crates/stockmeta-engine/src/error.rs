use stockmeta_contracts::credentials::PoolError;
use stockmeta_contracts::metadata::ExtractError;
use stockmeta_contracts::settings::SettingsError;
use thiserror::Error;

/// Every condition that ends an automation session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutomationError {
    #[error("credential pool is empty")]
    EmptyPool,
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("no qualifying target page")]
    NoQualifyingTarget,
    #[error("no image found on the page within the wait window")]
    AssetNotFound,
    #[error("image download failed{}: {message}", status_suffix(.status))]
    AssetFetchError { status: Option<u16>, message: String },
    /// `status` 0 means the request never got a response.
    #[error("generation service returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("unexpected response shape from generation service: {0}")]
    MalformedResponse(String),
    #[error("no JSON object found in generated text")]
    NoJsonFound,
    #[error("generated JSON could not be parsed: {details}")]
    InvalidJson { details: String },
    #[error("generated metadata is missing: {}", .missing.join(", "))]
    MissingFields { missing: Vec<String> },
    #[error("form could not be filled: {0}")]
    FillFailed(String),
    #[error("submit could not be dispatched")]
    SubmitFailed,
    #[error("target page was closed")]
    TargetRemoved,
    #[error("target navigated outside the workflow: {0}")]
    UnexpectedNavigation(String),
    #[error("settings storage failed: {0}")]
    Settings(String),
}

impl AutomationError {
    /// Stable tag used in the event log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyPool => "empty_pool",
            Self::MissingConfig(_) => "missing_config",
            Self::NoQualifyingTarget => "no_qualifying_target",
            Self::AssetNotFound => "asset_not_found",
            Self::AssetFetchError { .. } => "asset_fetch_error",
            Self::ApiError { .. } => "api_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::NoJsonFound => "no_json_found",
            Self::InvalidJson { .. } => "invalid_json",
            Self::MissingFields { .. } => "missing_fields",
            Self::FillFailed(_) => "fill_failed",
            Self::SubmitFailed => "submit_failed",
            Self::TargetRemoved => "target_removed",
            Self::UnexpectedNavigation(_) => "unexpected_navigation",
            Self::Settings(_) => "settings",
        }
    }

    /// One user-facing sentence naming the cause category.
    pub fn status_message(&self) -> String {
        match self {
            Self::EmptyPool | Self::MissingConfig(_) | Self::Settings(_) => {
                "Error: API keys or model are not configured. Automation stopped.".to_string()
            }
            Self::NoQualifyingTarget => {
                "Error: No active upload page found. Automation stopped.".to_string()
            }
            Self::AssetNotFound => {
                "Error: Image not found on the page. Automation stopped.".to_string()
            }
            Self::AssetFetchError { status, .. } => format!(
                "Error: Failed to download the image{}. Automation stopped.",
                status_suffix(status)
            ),
            Self::ApiError { status: 0, .. } => {
                "Error: Could not reach the generation API. Automation stopped.".to_string()
            }
            Self::ApiError { status, .. } => {
                format!("Error: Generation API request failed ({status}). Automation stopped.")
            }
            Self::MalformedResponse(_)
            | Self::NoJsonFound
            | Self::InvalidJson { .. }
            | Self::MissingFields { .. } => {
                "Error: Failed to process the AI response. Automation stopped.".to_string()
            }
            Self::FillFailed(_) => "Error: Failed to fill the form. Automation stopped.".to_string(),
            Self::SubmitFailed => "Error: Submit failed. Automation stopped.".to_string(),
            Self::TargetRemoved => "Processing tab was closed. Automation stopped.".to_string(),
            Self::UnexpectedNavigation(_) => {
                "Navigated to an unknown page. Automation stopped.".to_string()
            }
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl From<PoolError> for AutomationError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::EmptyPool => Self::EmptyPool,
        }
    }
}

impl From<ExtractError> for AutomationError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::NoJsonFound => Self::NoJsonFound,
            ExtractError::InvalidJson { details } => Self::InvalidJson { details },
            ExtractError::MissingFields { missing } => Self::MissingFields { missing },
        }
    }
}

impl From<SettingsError> for AutomationError {
    fn from(err: SettingsError) -> Self {
        Self::MissingConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use stockmeta_contracts::metadata::ExtractError;

    use super::AutomationError;

    #[test]
    fn extractor_failures_keep_their_category() {
        let err: AutomationError = ExtractError::MissingFields {
            missing: vec!["keywords".to_string()],
        }
        .into();
        assert_eq!(err.kind(), "missing_fields");
        assert_eq!(err.to_string(), "generated metadata is missing: keywords");
    }

    #[test]
    fn status_message_names_category_without_internal_detail() {
        let err = AutomationError::ApiError {
            status: 429,
            body: "{\"error\":{\"message\":\"quota exceeded for key abc\"}}".to_string(),
        };
        let status = err.status_message();
        assert!(status.contains("429"));
        assert!(!status.contains("quota"));

        let fetch = AutomationError::AssetFetchError {
            status: None,
            message: "dns failure".to_string(),
        };
        assert_eq!(
            fetch.status_message(),
            "Error: Failed to download the image. Automation stopped."
        );
        assert_eq!(
            fetch.to_string(),
            "image download failed: dns failure"
        );
    }
}
