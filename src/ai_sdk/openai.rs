use crate::protocol::{Message, StreamChunk, Thinking};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct CompletionRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) messages: &'a [Message],
    pub(crate) stream: bool,
    pub(crate) thinking: Thinking,
    pub(crate) user: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionChunk {
    #[serde(default)]
    pub(crate) choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkChoice {
    #[serde(default)]
    pub(crate) delta: ChunkDelta,
    #[serde(default)]
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub(crate) content: Option<String>,
    #[serde(default)]
    pub(crate) reasoning_content: Option<String>,
}

pub(crate) const DONE_SENTINEL: &str = "[DONE]";

/// What one upstream SSE line means for the relay.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// Interprets a single line of the upstream event stream. Only `data:` lines
/// carry anything; comments, `event:` and blank lines are skipped.
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine, serde_json::Error> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == DONE_SENTINEL {
        return Ok(SseLine::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)?;
    Ok(SseLine::Chunk(chunk_from_response(chunk)))
}

pub(crate) fn chunk_from_response(response: CompletionChunk) -> StreamChunk {
    let Some(choice) = response.choices.into_iter().next() else {
        return StreamChunk::default();
    };

    StreamChunk {
        delta: choice.delta.content.unwrap_or_default(),
        reasoning: choice.delta.reasoning_content.filter(|text| !text.is_empty()),
        finished: choice.finish_reason.is_some(),
    }
}
