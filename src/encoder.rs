//! Text-frame SSE encoding for relay events.
//!
//! Payloads are escaped so that a frame is always exactly one `event:` line,
//! one `data:` line and a blank line, whatever the model emits.

use crate::protocol::{Channel, WireEvent};
use axum::response::sse::Event;
#[cfg(test)]
use bytes::Bytes;

pub const SPACE_ESCAPE: &str = "&#32;";
pub const NEWLINE_ESCAPE: &str = "&#92n";
pub const CARRIAGE_RETURN_ESCAPE: &str = "&#13;";

/// Comment text sent on idle connections.
pub const KEEP_ALIVE_TEXT: &str = "keep-alive";

/// Spaces first, then newlines, then carriage returns.
pub fn escape(payload: &str) -> String {
    payload
        .replace(' ', SPACE_ESCAPE)
        .replace('\n', NEWLINE_ESCAPE)
        .replace('\r', CARRIAGE_RETURN_ESCAPE)
}

pub fn unescape(payload: &str) -> String {
    payload
        .replace(CARRIAGE_RETURN_ESCAPE, "\r")
        .replace(NEWLINE_ESCAPE, "\n")
        .replace(SPACE_ESCAPE, " ")
}

/// One relay event as an SSE event: the channel names the event and the
/// escaped payload is its single data line.
pub fn sse_event(event: &WireEvent) -> Event {
    Event::default()
        .event(event.channel.as_str())
        .data(escape(&event.payload))
}

/// The exact bytes [`sse_event`] puts on the wire.
#[cfg(test)]
pub fn encode(event: &WireEvent) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event.channel.as_str(),
        escape(&event.payload)
    ))
}

/// Decodes one raw frame (without its trailing blank line).
///
/// Comment-only frames and frames on unknown channels yield `None`. A frame
/// without an `event:` line is treated as `message`, which is what an
/// EventSource would dispatch it as.
pub fn decode(raw: &str) -> Option<WireEvent> {
    let mut channel = None;
    let mut data_lines = Vec::new();

    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(name) = line.strip_prefix("event:") {
            channel = Some(Channel::parse(name.trim())?);
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(WireEvent {
        channel: channel.unwrap_or(Channel::Message),
        payload: unescape(&data_lines.join("\n")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_text(event: &WireEvent) -> String {
        String::from_utf8(encode(event).to_vec()).unwrap()
    }

    #[test]
    fn leading_space_is_escaped_in_message_frame() {
        assert_eq!(
            frame_text(&WireEvent::message(" there")),
            "event: message\ndata: &#32;there\n\n"
        );
    }

    #[test]
    fn done_frame_carries_sentinel() {
        assert_eq!(frame_text(&WireEvent::done()), "event: done\ndata: [DONE]\n\n");
    }

    #[test]
    fn newlines_never_break_framing() {
        let text = frame_text(&WireEvent::thinking("step one\nstep two\r\n"));
        assert_eq!(text.matches('\n').count(), 3);
        assert!(text.starts_with("event: thinking\ndata: step&#32;one&#92nstep"));
    }

    #[test]
    fn escape_then_unescape_restores_payload() {
        for payload in [
            "",
            " ",
            "hello world",
            "\n\nlines\nand  spaces \n",
            "tab\tstays",
            "windows\r\nline",
            "中文 内容\n第二行",
        ] {
            assert_eq!(unescape(&escape(payload)), payload, "payload: {payload:?}");
        }
    }

    #[test]
    fn decode_reverses_encode() {
        let event = WireEvent::message(" multi\nline text ");
        let text = frame_text(&event);
        let raw = text.strip_suffix("\n\n").unwrap();
        assert_eq!(decode(raw), Some(event));
    }

    #[test]
    fn decode_skips_keep_alive_and_unknown_channels() {
        assert_eq!(decode(": keep-alive"), None);
        assert_eq!(decode("event: ping\ndata: x"), None);
    }

    #[tokio::test]
    async fn sse_event_matches_encoded_frame() {
        use axum::response::IntoResponse;
        use axum::response::sse::Sse;
        use http_body_util::BodyExt;
        use std::convert::Infallible;

        let events = vec![
            WireEvent::thinking("a b\nc\r"),
            WireEvent::message(""),
            WireEvent::error("bad thing"),
            WireEvent::done(),
        ];
        let expected: Vec<u8> = events.iter().flat_map(|event| encode(event).to_vec()).collect();

        let frames: Vec<Result<Event, Infallible>> = events.iter().map(|event| Ok(sse_event(event))).collect();
        let response = Sse::new(futures::stream::iter(frames)).into_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        assert_eq!(body.to_vec(), expected);
    }

    #[test]
    fn decode_defaults_to_message_channel() {
        assert_eq!(decode("data: hi"), Some(WireEvent::message("hi")));
    }
}
