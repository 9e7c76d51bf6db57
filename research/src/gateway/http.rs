//! HTTP agent backend for an OpenCode-style server
//!
//! A call creates a remote session, subscribes to the server's event
//! stream, posts the prompt asynchronously and forwards events until the
//! remote session reports idle.

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::decoder::SseDecoder;
use super::dialects::{decode_opencode, OpencodeSignal};
use super::types::{Call, GatewayError, MessageSink, StreamMessage};
use super::Backend;
use crate::config::HttpConfig;
use crate::model::truncate_chars;

pub struct HttpBackend {
    name: String,
    config: HttpConfig,
    /// Pooled connections to the server; `None` once closed
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, config: HttpConfig) -> Self {
        Self {
            name: name.into(),
            config,
            client: RwLock::new(Some(reqwest::Client::new())),
        }
    }

    /// A handle on the connection pool; calls already holding one finish normally
    fn client(&self) -> Result<reqwest::Client, GatewayError> {
        self.client
            .read()
            .clone()
            .ok_or_else(|| GatewayError::Unavailable(format!("{} backend is closed", self.name)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Split `provider/model` into its ids
    fn model_ids<'a>(&'a self, model: &'a str) -> (&'a str, &'a str) {
        match model.split_once('/') {
            Some((provider, model)) => (provider, model),
            None => (self.config.default_provider_id.as_str(), model),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_connect() {
            GatewayError::Unavailable(format!(
                "cannot reach {} at {}: {}",
                self.name, self.config.base_url, e
            ))
        } else {
            GatewayError::Request(e)
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Http {
            status: status.as_u16(),
            body: truncate_chars(&body, 500),
        })
    }

    async fn create_session(&self) -> Result<String, GatewayError> {
        let response = self
            .client()?
            .post(self.url("/session"))
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body: Value = self.check(response).await?.json().await?;

        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Provider("session response has no id".to_string()))
    }

    async fn post_prompt(&self, session_id: &str, call: &Call) -> Result<(), GatewayError> {
        let (provider_id, model_id) = self.model_ids(&call.model);
        let mut body = json!({
            "model": {"providerID": provider_id, "modelID": model_id},
            "parts": [{"type": "text", "text": call.prompt}],
        });
        if let Some(system) = &call.system_prompt {
            body["system"] = Value::String(system.clone());
        }

        let response = self
            .client()?
            .post(self.url(&format!("/session/{}/prompt_async", session_id)))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, call: Call, sink: MessageSink) -> Result<(), GatewayError> {
        let session_id = self.create_session().await?;
        tracing::info!(
            provider = %self.name,
            remote_session = %session_id,
            model = %call.model,
            "Created remote session"
        );

        // Subscribe before posting so no event is missed
        let events = self
            .client()?
            .get(self.url("/event"))
            .query(&[("session", session_id.as_str())])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let events = self.check(events).await?;

        self.post_prompt(&session_id, &call).await?;

        let mut decoder = SseDecoder::new();
        let mut final_texts: Vec<String> = Vec::new();
        let mut stream = events.bytes_stream();
        let mut idle = false;

        'stream: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                let event: Value = match serde_json::from_str(&frame.data) {
                    Ok(event) => event,
                    Err(_) => {
                        sink.record_malformed();
                        tracing::debug!(
                            provider = %self.name,
                            "Non-JSON event: {}",
                            truncate_chars(&frame.data, 50)
                        );
                        continue;
                    }
                };

                for signal in decode_opencode(&event, &session_id) {
                    match signal {
                        OpencodeSignal::Message(message) => {
                            if !sink.send(message).await {
                                return Ok(());
                            }
                        }
                        OpencodeSignal::FinalText(text) => {
                            if !final_texts.contains(&text) {
                                final_texts.push(text);
                            }
                        }
                        OpencodeSignal::Idle => {
                            idle = true;
                            break 'stream;
                        }
                        OpencodeSignal::Failed(message) => {
                            sink.send(StreamMessage::error(message)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }

        if !idle {
            return Err(GatewayError::Provider(
                "event stream ended before the session became idle".to_string(),
            ));
        }

        if !final_texts.is_empty() {
            sink.send(StreamMessage::result(final_texts.concat())).await;
        }
        Ok(())
    }

    /// Drop the connection pool; new calls fail as unavailable
    async fn close(&self) {
        if self.client.write().take().is_some() {
            tracing::debug!(provider = %self.name, "Closed HTTP client");
        }
    }
}
