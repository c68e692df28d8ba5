use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::body::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use url::Url;

// Longest slice of an error body echoed back to the caller
const ERROR_BODY_LIMIT: usize = 512;

/// Client for the hosted classification model. One request per call, no retries.
#[derive(Clone)]
pub(crate) struct InferenceClient {
    http: reqwest::Client,
    url: Url,
    token: String,
}

impl InferenceClient {
    pub(crate) fn new(url: Url, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build inference HTTP client")?;
        Ok(Self {
            http,
            url,
            token: token.into(),
        })
    }

    #[tracing::instrument(level = "info", skip(self, image), fields(url = %self.url, bytes = image.len()))]
    pub(crate) async fn classify(&self, image: Bytes) -> Result<Value> {
        let response = self
            .http
            .post(self.url.clone())
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .context("Request to inference endpoint failed")?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("Failed to read inference response")?;
        if !status.is_success() {
            let text: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_BODY_LIMIT)
                .collect();
            bail!("Inference endpoint returned {}: {}", status, text.trim());
        }

        decode_body(&body)
    }
}

/// JSON when possible, otherwise the text itself so the interpreter can still look at it.
fn decode_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    if let Ok(value) = serde_json::from_slice(body) {
        return Ok(value);
    }
    let text = std::str::from_utf8(body).context("Inference response is neither JSON nor text")?;
    Ok(Value::String(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer, timeout: Duration) -> InferenceClient {
        let url = Url::parse(&format!("{}/models/detector", server.uri())).unwrap();
        InferenceClient::new(url, "hf_test", timeout).unwrap()
    }

    #[test]
    fn decodes_bodies() {
        assert_eq!(decode_body(b"").unwrap(), Value::Null);
        assert_eq!(decode_body(b" \n").unwrap(), Value::Null);
        assert_eq!(
            decode_body(br#"{"label": "nsfw", "score": 0.9}"#).unwrap(),
            json!({"label": "nsfw", "score": 0.9})
        );
        assert_eq!(decode_body(b"model loading\n").unwrap(), json!("model loading"));
        assert!(decode_body(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[tokio::test]
    async fn posts_raw_bytes_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/detector"))
            .and(header("Authorization", "Bearer hf_test"))
            .and(header("Content-Type", "application/octet-stream"))
            .and(body_bytes(b"\x89PNG".to_vec()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"label": "neutral", "score": 0.99}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let value = client(&server, Duration::from_secs(5))
            .classify(Bytes::from_static(b"\x89PNG"))
            .await
            .unwrap();
        assert_eq!(value, json!([{"label": "neutral", "score": 0.99}]));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string(r#"{"error": "Model is loading"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, Duration::from_secs(5))
            .classify(Bytes::from_static(b"image"))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("503"), "{message}");
        assert!(message.contains("Model is loading"), "{message}");
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let result = client(&server, Duration::from_millis(100))
            .classify(Bytes::from_static(b"image"))
            .await;
        assert!(result.is_err());
    }
}
