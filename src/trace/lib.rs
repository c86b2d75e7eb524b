//! W3C trace-context propagation over broker headers.
//!
//! Only the `traceparent` format matters here; span export is someone else's
//! problem. A context carried on a message lets a worker correlate status
//! records with the publish that caused them.

use std::fmt;
use std::str::FromStr;

use async_nats::{HeaderMap, HeaderValue};
use uuid::Uuid;

pub const TRACEPARENT_HEADER: &str = "traceparent";

const SUPPORTED_VERSION: &str = "00";

/// A parsed `traceparent` value: 32 hex chars of trace id, 16 of span id,
/// and the sampled flag byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub flags: u8,
}

impl TraceContext {
    /// Fresh sampled context with random ids.
    pub fn new() -> TraceContext {
        let trace_id = Uuid::new_v4().simple().to_string();
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        TraceContext {
            trace_id,
            span_id,
            flags: 0x01,
        }
    }

    /// Same trace, new span. Used when re-publishing work derived from a
    /// received message.
    pub fn child(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            span_id: Uuid::new_v4().simple().to_string()[..16].to_string(),
            flags: self.flags,
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "{SUPPORTED_VERSION}-{}-{}-{:02x}",
            self.trace_id, self.span_id, self.flags
        )
    }

    /// Write this context into a broker header map.
    pub fn inject(&self, headers: &mut HeaderMap) {
        headers.insert(
            TRACEPARENT_HEADER,
            HeaderValue::from(self.to_traceparent().as_str()),
        );
    }

    /// Read a context out of a broker header map, if one was propagated.
    pub fn extract(headers: &HeaderMap) -> Option<TraceContext> {
        // Senders disagree on header casing.
        let value = headers
            .get(TRACEPARENT_HEADER)
            .or_else(|| headers.get("Traceparent"))?;
        value.as_str().parse().ok()
    }
}

impl Default for TraceContext {
    fn default() -> Self {
        TraceContext::new()
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_traceparent())
    }
}

impl FromStr for TraceContext {
    type Err = ParseTraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let version = parts.next().ok_or(ParseTraceError)?;
        let trace_id = parts.next().ok_or(ParseTraceError)?;
        let span_id = parts.next().ok_or(ParseTraceError)?;
        let flags = parts.next().ok_or(ParseTraceError)?;

        if version != SUPPORTED_VERSION || parts.next().is_some() {
            return Err(ParseTraceError);
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || trace_id.chars().all(|c| c == '0') {
            return Err(ParseTraceError);
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || span_id.chars().all(|c| c == '0') {
            return Err(ParseTraceError);
        }
        let flags = u8::from_str_radix(flags, 16).map_err(|_| ParseTraceError)?;

        Ok(TraceContext {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            flags,
        })
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseTraceError;

impl fmt::Display for ParseTraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed traceparent value")
    }
}

impl std::error::Error for ParseTraceError {}
