use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use stockmeta_contracts::credentials::fingerprint;
use stockmeta_contracts::target::AssetReference;

use crate::config::EngineConfig;
use crate::error::AutomationError;

pub const GENERATION_PROMPT: &str = "Generate a suitable title, a detailed description (around 50-100 words), and 15-25 relevant keywords (comma-separated) for this image, suitable for a stock photo platform like Dreamstime. IMPORTANT: Ignore any watermarks present on the image itself and focus only on the main subject and scene. Describe the visual elements, concepts, and potential uses. Provide the output as a JSON object with keys 'title', 'description', and 'keywords'.";

const DEFAULT_MIME: &str = "image/jpeg";
const ERROR_BODY_LIMIT: usize = 512;

/// Produces the raw generated text for one image.
pub trait Generator: Send + Sync {
    fn generate(
        &self,
        asset: &AssetReference,
        credential: &str,
        model: &str,
    ) -> Result<String, AutomationError>;
}

/// Image bytes ready to be inlined into a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

/// `generateContent` client. One request per call, no retries.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    http: HttpClient,
    request_timeout: Duration,
    fetch_timeout: Duration,
}

impl GeminiClient {
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_http_client(config, HttpClient::new())
    }

    pub fn with_http_client(config: &EngineConfig, http: HttpClient) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            http,
            request_timeout: config.request_timeout,
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn fetch_asset(&self, asset: &AssetReference) -> Result<InlineImage, AutomationError> {
        let url = asset.as_str().trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AutomationError::AssetFetchError {
                status: None,
                message: "image reference is not an http(s) URL".to_string(),
            });
        }

        let response = self
            .http
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .map_err(|err| AutomationError::AssetFetchError {
                status: None,
                message: err.without_url().to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AutomationError::AssetFetchError {
                status: Some(status.as_u16()),
                message: format!("image request returned {status}"),
            });
        }
        let declared = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| AutomationError::AssetFetchError {
                status: Some(status.as_u16()),
                message: err.without_url().to_string(),
            })?;

        let mime_type = resolve_mime(declared.as_deref(), &bytes, url).ok_or_else(|| {
            AutomationError::AssetFetchError {
                status: Some(status.as_u16()),
                message: format!(
                    "unrecognised image content type {}",
                    declared.as_deref().unwrap_or_default()
                ),
            }
        })?;
        tracing::debug!(mime_type = %mime_type, bytes = bytes.len(), "image downloaded");
        Ok(InlineImage {
            mime_type,
            data: BASE64.encode(&bytes),
        })
    }

    fn post(
        &self,
        endpoint: &str,
        credential: &str,
        payload: &Value,
    ) -> Result<Value, AutomationError> {
        let response = self
            .http
            .post(endpoint)
            .query(&[("key", credential)])
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .map_err(|err| AutomationError::ApiError {
                status: 0,
                body: err.without_url().to_string(),
            })?;
        let status = response.status();
        let body = response.text().map_err(|err| AutomationError::ApiError {
            status: status.as_u16(),
            body: err.without_url().to_string(),
        })?;
        if !status.is_success() {
            return Err(AutomationError::ApiError {
                status: status.as_u16(),
                body: truncate_text(&body, ERROR_BODY_LIMIT),
            });
        }
        serde_json::from_str(&body).map_err(|err| {
            AutomationError::MalformedResponse(format!("response body is not JSON: {err}"))
        })
    }
}

impl Generator for GeminiClient {
    fn generate(
        &self,
        asset: &AssetReference,
        credential: &str,
        model: &str,
    ) -> Result<String, AutomationError> {
        let image = self.fetch_asset(asset)?;
        let endpoint = self.endpoint_for_model(model);
        tracing::info!(
            model,
            key = %fingerprint(credential),
            mime_type = %image.mime_type,
            "calling generation service"
        );
        let payload = build_request(&image);
        let response = self.post(&endpoint, credential, &payload)?;
        extract_generated_text(&response)
    }
}

/// Fixed request body: the prompt, one inline image, and the pinned
/// generation and safety parameters.
pub fn build_request(image: &InlineImage) -> Value {
    json!({
        "contents": [{
            "parts": [
                { "text": GENERATION_PROMPT },
                {
                    "inline_data": {
                        "mime_type": image.mime_type,
                        "data": image.data,
                    }
                }
            ]
        }],
        "generationConfig": {
            "temperature": 0.4,
            "topK": 32,
            "topP": 1,
            "maxOutputTokens": 8192,
            "stopSequences": [],
        },
        "safetySettings": safety_settings(),
    })
}

fn safety_settings() -> Vec<Value> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| {
        json!({
            "category": category,
            "threshold": "BLOCK_MEDIUM_AND_ABOVE",
        })
    })
    .collect()
}

/// First candidate's first text part.
pub fn extract_generated_text(payload: &Value) -> Result<String, AutomationError> {
    let text = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty());
    if let Some(text) = text {
        return Ok(text.to_string());
    }

    let reason = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
        .map(|reason| format!("prompt blocked ({reason})"))
        .unwrap_or_else(|| "no generated text in first candidate".to_string());
    Err(AutomationError::MalformedResponse(reason))
}

/// Declared `image/*` wins, then byte sniffing, then the URL suffix. Without
/// any declared type the image is assumed to be JPEG.
pub fn resolve_mime(declared: Option<&str>, bytes: &[u8], url: &str) -> Option<String> {
    let declared = declared
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());
    if let Some(value) = declared.as_deref() {
        if value.starts_with("image/") {
            return Some(value.to_string());
        }
    }
    if let Ok(format) = image::guess_format(bytes) {
        return Some(format.to_mime_type().to_string());
    }
    if let Some(mime) = mime_for_url(url) {
        return Some(mime.to_string());
    }
    if declared.is_none() {
        return Some(DEFAULT_MIME.to_string());
    }
    None
}

fn mime_for_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
