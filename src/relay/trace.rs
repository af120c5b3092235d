//! Trace context carried across the stream boundary.
//!
//! A run event is published in one task and handled in another, possibly in
//! another process. The publisher writes a W3C `traceparent` into the event's
//! carrier (and into the message headers); the subscriber reads it back and
//! runs the callback inside that context, so anything the callback publishes
//! continues the same trace.

use std::future::Future;

use crate::types::Carrier;

/// Carrier and header key for the W3C trace context.
pub const TRACEPARENT: &str = "traceparent";

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// A trace id and the id of the span that handed work on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

impl TraceContext {
    /// Starts a new trace.
    pub fn new_root() -> Self {
        TraceContext {
            trace_id: nonzero(rand::random::<u128>()),
            span_id: nonzero(rand::random::<u64>()),
            sampled: true,
        }
    }

    /// A new span in the same trace.
    pub fn child(&self) -> Self {
        TraceContext {
            span_id: nonzero(rand::random::<u64>()),
            ..*self
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }

    /// Parses a `traceparent` value. Returns `None` for anything malformed.
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() && version == "00" {
            return None;
        }
        if version.len() != 2 || version == "ff" || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let span_id = u64::from_str_radix(span_id, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        u8::from_str_radix(version, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(TraceContext {
            trace_id,
            span_id,
            sampled: flags & 1 == 1,
        })
    }

    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }
}

fn nonzero<T: PartialEq + From<u8>>(value: T) -> T {
    if value == T::from(0) { T::from(1) } else { value }
}

/// The context of the task currently running, if one was scoped.
pub fn current() -> Option<TraceContext> {
    CURRENT.try_with(|ctx| *ctx).ok()
}

/// Runs `fut` with `ctx` as the current context.
pub async fn scope<F: Future>(ctx: TraceContext, fut: F) -> F::Output {
    CURRENT.scope(ctx, fut).await
}

/// Writes a child of the current context (or a new root) into `carrier`.
pub fn inject(carrier: &mut Carrier) -> TraceContext {
    let ctx = current().map(|c| c.child()).unwrap_or_else(TraceContext::new_root);
    carrier.insert(TRACEPARENT.to_string(), ctx.to_traceparent());
    ctx
}

/// Reads the context from `carrier`.
pub fn extract(carrier: &Carrier) -> Option<TraceContext> {
    carrier
        .get(TRACEPARENT)
        .and_then(|v| TraceContext::from_traceparent(v))
}
