#![forbid(unsafe_code)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

pub const IMAGE_MIME_TYPE: &str = "image/jpeg";
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Fixed instruction sent alongside every receipt image.
pub const EXTRACTION_INSTRUCTION: &str = "\
You are a helpful assistant. Extract the following details from the receipt image and return them as a JSON object.
Do not include any extra text before or after the JSON.

Fields to extract:
- \"transaction_id\": A unique identifier for the receipt.
- \"merchant_details\":
  - \"name\": The name of the store or service.
- \"transaction_details\":
  - \"date_and_time\": The date and time of the transaction in ISO 8601 format (e.g., \"2023-10-01T12:00:00Z\").
  - \"payment_method\": The payment method used (e.g., \"Credit Card\", \"Cash\", \"Debit Card\").
  - \"total_amount\": The total amount spent, as a number.
  - \"currency\": The currency of the total amount (e.g., \"USD\", \"EUR\").
- \"items\": An array of objects, where each object has:
  - \"item_name\": The name of the product or service.
  - \"price\": The item's price as a number.
  - \"quantity\": The number of units purchased, as an integer.
  - \"category\": A classification of the item (e.g., \"Groceries\", \"Household\", \"Dining\").
- \"spending_category\": A top-level classification for the entire receipt (e.g., \"Groceries\", \"Dining Out\", \"Utilities\").

If some data is missing from the receipt, leave it empty.
Return only the JSON object.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("extraction service unavailable ({kind})")]
    Unavailable {
        kind: &'static str,
        http_status: Option<u16>,
    },
    #[error("extraction service returned no text")]
    Empty,
}

impl ExtractionError {
    fn unavailable(kind: &'static str, http_status: Option<u16>) -> Self {
        Self::Unavailable { kind, http_status }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub image: &'a [u8],
    pub instruction: &'a str,
    pub mime_type: &'a str,
    /// Upper bound for the whole exchange, derived from the caller's deadline.
    pub timeout: Duration,
}

impl<'a> ExtractionRequest<'a> {
    pub fn receipt(image: &'a [u8], timeout: Duration) -> Self {
        Self {
            image,
            instruction: EXTRACTION_INSTRUCTION,
            mime_type: IMAGE_MIME_TYPE,
            timeout,
        }
    }
}

/// One blocking request/response exchange with an inference service. No retries.
pub trait ExtractionClient: Send + Sync {
    fn extract(&self, req: &ExtractionRequest<'_>) -> Result<String, ExtractionError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub user_agent: String,
    pub timeout_ms: u32,
}

impl GeminiConfig {
    pub fn mvp_v1(api_key: String) -> Self {
        Self {
            endpoint: DEFAULT_GEMINI_ENDPOINT.to_string(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            api_key,
            user_agent: concat!("expenses/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_ms: 60_000,
        }
    }

    fn generate_content_url(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GeminiExtractionClient {
    config: GeminiConfig,
}

impl GeminiExtractionClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn build_agent(&self, request_timeout: Duration) -> ureq::Agent {
        let configured = Duration::from_millis(u64::from(self.config.timeout_ms).max(100));
        let timeout = configured.min(request_timeout).max(Duration::from_millis(100));
        ureq::AgentBuilder::new()
            .timeout(timeout)
            .timeout_connect(timeout)
            .user_agent(&self.config.user_agent)
            .build()
    }
}

impl ExtractionClient for GeminiExtractionClient {
    fn extract(&self, req: &ExtractionRequest<'_>) -> Result<String, ExtractionError> {
        let payload = generate_content_payload(req);
        let response = self
            .build_agent(req.timeout)
            .post(&self.config.generate_content_url())
            .set("Content-Type", "application/json")
            .set("Accept", "application/json")
            .set("x-goog-api-key", &self.config.api_key)
            .send_json(payload)
            .map_err(extraction_error_from_ureq)?;
        let body: Value = serde_json::from_reader(response.into_reader())
            .map_err(|_| ExtractionError::unavailable("json_parse", None))?;
        let text = candidate_text(&body).ok_or(ExtractionError::Empty)?;
        tracing::debug!(
            model = %self.config.model,
            image_bytes = req.image.len(),
            text_chars = text.chars().count(),
            "extraction service returned text"
        );
        Ok(text)
    }
}

fn generate_content_payload(req: &ExtractionRequest<'_>) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": req.instruction.trim() },
                {
                    "inline_data": {
                        "mime_type": req.mime_type,
                        "data": BASE64.encode(req.image),
                    }
                }
            ]
        }]
    })
}

/// Concatenated text parts of the first candidate; `None` when there is no text.
fn candidate_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .as_array()?
        .first()?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn extraction_error_from_ureq(err: ureq::Error) -> ExtractionError {
    match err {
        ureq::Error::Status(status, _) => {
            let kind = match status {
                401 | 403 => "auth_rejected",
                429 => "rate_limited",
                _ => "http_non_200",
            };
            ExtractionError::unavailable(kind, Some(status))
        }
        ureq::Error::Transport(transport) => {
            let combined = format!("{:?} {}", transport.kind(), transport);
            ExtractionError::unavailable(classify_transport_error_kind(&combined), None)
        }
    }
}

fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}
