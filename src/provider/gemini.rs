//! Gemini generateContent client (text only).

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ProviderError, classify_send_error, classify_status};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiClient {
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// The key goes in a header so it never appears in a URL.
    fn request(&self, api_key: &str, model: &str, body: &GenerateRequest) -> reqwest::RequestBuilder {
        let url = format!("{}/{}:generateContent", GEMINI_API_BASE, urlencoding::encode(model));
        self.client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(body)
    }

    pub async fn generate(
        &self,
        api_key: &str,
        model: &str,
        prompt: &str,
        system: &str,
    ) -> Result<String, ProviderError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            system_instruction: (!system.is_empty()).then(|| Content {
                parts: vec![Part {
                    text: system.to_string(),
                }],
            }),
        };

        let response = self
            .request(api_key, model, &request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(classify_send_error)?;

        debug!("Gemini response status: {status}");

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Unknown(format!("failed to parse response: {e}")))?;

        if let Some(error) = parsed.error {
            let detail = format!("{} ({})", error.message, error.status.unwrap_or_default());
            return Err(if detail.contains("RESOURCE_EXHAUSTED") {
                ProviderError::Quota(detail)
            } else {
                ProviderError::Unknown(detail)
            });
        }

        let text: String = parsed
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(ProviderError::Unknown("no text in response".to_string()));
        }
        Ok(text)
    }
}
