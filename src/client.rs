use crate::encoder::decode;
use crate::protocol::{Channel, Message, Role, ThinkMode, WireEvent};
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::json;
use std::error::Error;
use std::future::Future;

pub struct ClientConfig {
    pub base_url: String,
    pub user_id: Option<i64>,
    pub session_token: Option<String>,
}

pub struct RelayClient {
    base_url: String,
    user_id: Option<i64>,
    session_token: Option<String>,
    http: HttpClient,
}

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

impl RelayClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            user_id: config.user_id,
            session_token: config.session_token,
            http: HttpClient::new(),
        }
    }

    /// Posts one prompt and feeds every decoded event to `on_event`, up to
    /// and including the terminal one. Returns that terminal event, or `None`
    /// if the server closed the stream without one.
    pub async fn stream_chat<F, Fut>(
        &self,
        prompt: String,
        think: ThinkMode,
        mut on_event: F,
    ) -> ClientResult<Option<WireEvent>>
    where
        F: FnMut(WireEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let body = json!({
            "userId": self.user_id,
            "messages": [Message::new(Role::User, prompt)],
            "thinking": {"type": think},
        });

        let mut request = self
            .http
            .post(format!("{}/chat/stream/flux", self.base_url))
            .header("accept", "text/event-stream")
            .json(&body);
        if let Some(token) = &self.session_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Failed to open stream: {} - {}", status, body).into());
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut pending: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);
            // Hold back an incomplete trailing UTF-8 sequence for the next chunk.
            let valid = match std::str::from_utf8(&pending) {
                Ok(text) => text.len(),
                Err(err) if err.error_len().is_none() => err.valid_up_to(),
                Err(_) => pending.len(),
            };
            let text = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);

            if text.contains('\r') {
                buffer.push_str(&text.replace("\r\n", "\n"));
            } else {
                buffer.push_str(&text);
            }

            while let Some(idx) = buffer.find("\n\n") {
                let raw_event = buffer[..idx].to_string();
                buffer = buffer[idx + 2..].to_string();

                if let Some(event) = decode(&raw_event) {
                    let terminal = event.channel.is_terminal().then(|| event.clone());
                    on_event(event).await;
                    if terminal.is_some() {
                        return Ok(terminal);
                    }
                }
            }
        }

        Ok(None)
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

/// Exit status for a finished stream: success only on `done`.
pub fn terminal_succeeded(terminal: Option<&WireEvent>) -> bool {
    matches!(terminal, Some(event) if event.channel == Channel::Done)
}
