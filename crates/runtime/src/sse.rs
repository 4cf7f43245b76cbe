//! SSE framing for the client-facing streaming protocol.
//!
//! The wire format is a sequence of `event:`/`data:` frames, each `data:` a
//! JSON-encoded StreamEvent, terminated by a literal `data: [DONE]` frame
//! before connection close.

use convoke_core::StreamEvent;

/// Final frame on every stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Encode one event as an SSE frame.
pub fn encode_frame(event: &StreamEvent) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {}\n\n", event.event_name(), data))
}
