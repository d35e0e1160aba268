use crate::ai_sdk::{CompletionRequest, SseLine, parse_sse_line};
use crate::bridge::ChunkSink;
use crate::error::UpstreamError;
use crate::protocol::{Message, StreamChunk, ThinkMode, Thinking, UserId};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Client;
use tracing::debug;

/// Longest upstream line accepted before the call is abandoned.
const MAX_LINE_BYTES: usize = 1 << 20;

/// A fully normalized request, ready to go upstream.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub user_id: UserId,
    pub session_id: Option<String>,
    pub messages: Vec<Message>,
    pub think: ThinkMode,
}

/// The model-serving collaborator.
///
/// Implementations call [`ChunkSink::deliver`] once per produced chunk, never
/// concurrently, and exactly once with `finished = true` as the last call.
/// A `Break` from the sink means nobody is listening any more and the call
/// should stop as soon as it can.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn invoke(&self, request: &Dispatch, sink: &mut ChunkSink) -> Result<(), UpstreamError>;
}

pub struct HttpCompletionClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpCompletionClient {
    pub fn new(base_url: &str, api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn invoke(&self, request: &Dispatch, sink: &mut ChunkSink) -> Result<(), UpstreamError> {
        let body = CompletionRequest {
            model: &self.model,
            messages: &request.messages,
            stream: true,
            thinking: Thinking {
                mode: request.think,
            },
            user: request.user_id.to_string(),
        };

        debug!(
            user_id = request.user_id,
            session_id = request.session_id.as_deref().unwrap_or(""),
            messages = request.messages.len(),
            "dispatching upstream completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new(MAX_LINE_BYTES);

        while let Some(bytes) = stream.next().await {
            lines.push(&bytes?);
            while let Some(line) = lines.next_line()? {
                if pump_line(&line, sink).await? {
                    return Ok(());
                }
            }
        }

        if let Some(line) = lines.remainder() {
            if pump_line(&line, sink).await? {
                return Ok(());
            }
        }

        Err(UpstreamError::Truncated)
    }
}

/// Splits a byte stream into `\n`-terminated lines. Bytes already searched
/// are not searched again, and a partial line may not grow past `max_line`.
struct LineBuffer {
    pending: BytesMut,
    scanned: usize,
    max_line: usize,
}

impl LineBuffer {
    fn new(max_line: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Result<Option<String>, UpstreamError> {
        match self.pending[self.scanned..].iter().position(|byte| *byte == b'\n') {
            Some(offset) => {
                let line = self.pending.split_to(self.scanned + offset + 1);
                self.scanned = 0;
                Ok(Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned()))
            }
            None if self.pending.len() > self.max_line => Err(UpstreamError::LineTooLong {
                limit: self.max_line,
            }),
            None => {
                self.scanned = self.pending.len();
                Ok(None)
            }
        }
    }

    fn remainder(self) -> Option<String> {
        (!self.pending.is_empty()).then(|| String::from_utf8_lossy(&self.pending).into_owned())
    }
}

/// Feeds one upstream line to the sink. Returns `true` once the call should
/// end, either because the stream is finished or because the sink stopped.
async fn pump_line(line: &str, sink: &mut ChunkSink) -> Result<bool, UpstreamError> {
    match parse_sse_line(line)? {
        SseLine::Skip => Ok(false),
        SseLine::Done => {
            let _ = sink.deliver(StreamChunk::default().finished()).await;
            Ok(true)
        }
        SseLine::Chunk(chunk) => {
            let finished = chunk.finished;
            let flow = sink.deliver(chunk).await;
            Ok(finished || flow.is_break())
        }
    }
}
