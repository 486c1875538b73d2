//! Event-stream framing for review runs.
//!
//! ```text
//! event: issues
//! data: [{"id":"...","doc_id":"d1",...}]
//!
//! event: complete
//!
//! event: error
//! data: Inference backend unavailable: model is loading. Try again later.
//!
//! ```
//!
//! An issues frame for an empty batch has no `data:` line. Multi-line error
//! messages are split over several `data:` lines; `\r\n`, `\r` and `\n` all
//! end a line.

use futures::{Stream, StreamExt};

use super::orchestrator::ReviewEvent;

pub const CONTENT_TYPE: &str = "text/event-stream";

const UNEXPECTED_END: &str = "review stream ended unexpectedly";

pub fn encode_event(event: &ReviewEvent) -> String {
    match event {
        ReviewEvent::Issues(issues) if issues.is_empty() => "event: issues\n\n".to_string(),
        ReviewEvent::Issues(issues) => match serde_json::to_string(issues) {
            Ok(json) => format!("event: issues\ndata: {json}\n\n"),
            Err(e) => error_frame(&format!("failed to encode issues: {e}")),
        },
        ReviewEvent::Complete => "event: complete\n\n".to_string(),
        ReviewEvent::Error(message) => error_frame(message),
    }
}

fn error_frame(message: &str) -> String {
    let mut frame = String::from("event: error\n");
    let message = message.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines = message.lines().peekable();
    if lines.peek().is_none() {
        frame.push_str("data: \n");
    }
    for line in lines {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Encode events into frames in order, stopping after the first terminal
/// event. If the source ends without one, a final error frame is added.
pub fn encode_stream<S>(events: S) -> impl Stream<Item = String> + Send + 'static
where
    S: Stream<Item = ReviewEvent> + Send + 'static,
{
    futures::stream::unfold(Some(Box::pin(events)), |state| async move {
        let mut events = state?;
        match events.next().await {
            Some(event) => {
                let frame = encode_event(&event);
                let next = if event.is_terminal() { None } else { Some(events) };
                Some((frame, next))
            }
            None => {
                tracing::warn!("Review event source ended without a terminal event");
                Some((error_frame(UNEXPECTED_END), None))
            }
        }
    })
}
