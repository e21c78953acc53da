use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::llm::error::LlmError;
use crate::llm::{CompletionBackend, CompletionRequest};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamFrame {
    Text(String),
    Stop,
    Ignore,
}

/// Messages API client. Only the streaming path is used.
pub struct AnthropicBackend {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn build_headers(&self) -> Result<HeaderMap, LlmError> {
        if self.api_key.trim().is_empty() {
            return Err(LlmError::AuthenticationError(String::from(
                "ANTHROPIC_API_KEY is not configured",
            )));
        }
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(self.api_key.as_str())
                .map_err(|e| LlmError::InvalidRequest(e.to_string()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_payload(&self, request: &CompletionRequest) -> Value {
        serde_json::json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "system": request.system,
            "messages": [{ "role": "user", "content": request.user }],
            "stream": true,
        })
    }

    pub(crate) fn parse_stream_frame(data: &str) -> Result<StreamFrame, LlmError> {
        let value: Value =
            serde_json::from_str(data).map_err(|e| LlmError::SerializationError(e.to_string()))?;
        match value.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "content_block_delta" => Ok(value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(|v| v.as_str())
                .map(|text| StreamFrame::Text(text.to_string()))
                .unwrap_or(StreamFrame::Ignore)),
            "message_stop" => Ok(StreamFrame::Stop),
            "error" => {
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown upstream error");
                Err(LlmError::StreamError(message.to_string()))
            }
            _ => Ok(StreamFrame::Ignore),
        }
    }

    fn map_error(status: u16, body: &str) -> LlmError {
        if status == 401 || status == 403 {
            return LlmError::AuthenticationError(body.to_string());
        }
        if status == 429 {
            return LlmError::RateLimitExceeded;
        }
        LlmError::ApiError {
            status,
            message: body.to_string(),
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    async fn stream(
        &self,
        request: CompletionRequest,
        delta_tx: mpsc::Sender<String>,
    ) -> Result<(), LlmError> {
        let headers = self.build_headers()?;
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let payload = self.build_payload(&request);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .map_err(|e| LlmError::NetworkError(e.to_string()))?;
            return Err(Self::map_error(status.as_u16(), &text));
        }

        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| LlmError::StreamError(e.to_string()))?;
            match Self::parse_stream_frame(&event.data)? {
                StreamFrame::Text(text) => {
                    if delta_tx.send(text).await.is_err() {
                        debug!("delta receiver dropped; stopping upstream stream");
                        return Ok(());
                    }
                }
                StreamFrame::Stop => return Ok(()),
                StreamFrame::Ignore => {}
            }
        }
        warn!("upstream stream ended without message_stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            api_key: "test-key".into(),
            base_url,
            ..LlmConfig::default()
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "system".into(),
            user: "segment nuclei".into(),
            max_tokens: 64,
            temperature: 0.2,
        }
    }

    #[test]
    fn parse_stream_frame_handles_delta_stop_and_error() {
        assert_eq!(
            AnthropicBackend::parse_stream_frame(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#
            )
            .unwrap(),
            StreamFrame::Text("Hi".into())
        );
        assert_eq!(
            AnthropicBackend::parse_stream_frame(r#"{"type":"ping"}"#).unwrap(),
            StreamFrame::Ignore
        );
        assert_eq!(
            AnthropicBackend::parse_stream_frame(r#"{"type":"message_stop"}"#).unwrap(),
            StreamFrame::Stop
        );
        let err = AnthropicBackend::parse_stream_frame(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::StreamError(message) if message == "Overloaded"));
    }

    #[tokio::test]
    async fn stream_forwards_text_deltas_until_message_stop() {
        let mut server = Server::new_async().await;
        let body = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
        event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"[DESC\"}}\n\n\
        event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"RIPTION]\"}}\n\n\
        event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n\
        event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"late\"}}\n\n";

        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .create_async()
            .await;

        let backend = AnthropicBackend::new(&config(server.url()));
        let (tx, mut rx) = mpsc::channel(8);
        backend.stream(request(), tx).await.unwrap();

        let mut deltas = Vec::new();
        while let Some(delta) = rx.recv().await {
            deltas.push(delta);
        }
        assert_eq!(deltas, vec!["[DESC".to_string(), "RIPTION]".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn stream_maps_http_failures() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let backend = AnthropicBackend::new(&config(server.url()));
        let (tx, _rx) = mpsc::channel(8);
        let err = backend.stream(request(), tx).await.unwrap_err();

        assert!(matches!(err, LlmError::AuthenticationError(body) if body == "bad key"));
    }

    #[tokio::test]
    async fn missing_api_key_fails_before_any_request() {
        let backend = AnthropicBackend::new(&LlmConfig::default());
        let (tx, _rx) = mpsc::channel(8);

        let err = backend.stream(request(), tx).await.unwrap_err();

        assert!(matches!(err, LlmError::AuthenticationError(_)));
    }
}
