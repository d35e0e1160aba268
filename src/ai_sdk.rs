mod openai;

pub(crate) use openai::{CompletionRequest, SseLine, parse_sse_line};
