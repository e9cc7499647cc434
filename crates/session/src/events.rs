//! Decodes out-of-band data-channel packets into semantic events.
//!
//! Wire format: a UTF-8 JSON object with a required `type` and optional
//! `message` plus, for tool events, `tool` or `name`. Anything that fails
//! to decode is dropped with a non-fatal [`SessionError::Decode`].

use crate::error::SessionError;
use serde::Deserialize;
use std::time::Duration;

/// How long a transient memory indicator stays visible.
pub const MEMORY_INDICATOR_TTL: Duration = Duration::from_secs(3);
/// How long a transient tool indicator stays visible.
pub const TOOL_INDICATOR_TTL: Duration = Duration::from_secs(2);

/// Label used when a tool event names nothing at all.
const GENERIC_TOOL_LABEL: &str = "tool activity";

/// A decoded data-channel event. `Unknown` keeps forward compatibility:
/// new server-side event types flow through without breaking the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Any `memory-*` event except the sticky fallback.
    Memory {
        kind: String,
        message: Option<String>,
    },
    /// Any `tool-*` event, reduced to a display label.
    Tool { label: String },
    /// Exact type `memory-fallback`: sticky, never expires.
    MemoryFallback,
    Unknown { kind: String },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    message: Option<String>,
    tool: Option<String>,
    name: Option<String>,
}

/// Decodes one packet. Arrival order is the caller's responsibility; this
/// function is pure.
pub fn decode(payload: &[u8]) -> Result<InboundEvent, SessionError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| SessionError::Decode(format!("invalid utf-8: {e}")))?;
    let raw: RawEvent = serde_json::from_str(text)
        .map_err(|e| SessionError::Decode(format!("invalid event json: {e}")))?;

    Ok(match raw.kind.as_str() {
        "memory-fallback" => InboundEvent::MemoryFallback,
        kind if kind.starts_with("memory-") => InboundEvent::Memory {
            kind: raw.kind,
            message: raw.message,
        },
        kind if kind.starts_with("tool-") => InboundEvent::Tool {
            label: raw
                .tool
                .or(raw.name)
                .or(raw.message)
                .unwrap_or_else(|| GENERIC_TOOL_LABEL.to_string()),
        },
        _ => InboundEvent::Unknown { kind: raw.kind },
    })
}
