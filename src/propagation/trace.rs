//! W3C Trace Context propagation over RPC metadata

use uuid::Uuid;

use crate::rpc::Metadata;

pub const TRACEPARENT: &str = "traceparent";
pub const TRACESTATE: &str = "tracestate";

const SUPPORTED_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

/// Identity of the span an outbound call belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// Start a new sampled trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().as_u128(),
            span_id: random_span_id(),
            sampled: true,
            trace_state: None,
        }
    }

    /// Same trace, fresh span id.
    pub fn child(&self) -> Self {
        Self {
            span_id: random_span_id(),
            ..self.clone()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id != 0 && self.span_id != 0
    }

    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{SUPPORTED_VERSION}-{:032x}-{:016x}-{:02x}",
            self.trace_id, self.span_id, flags
        )
    }

    pub fn from_traceparent(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != SUPPORTED_VERSION || parts.next().is_some() {
            return None;
        }

        let context = Self {
            trace_id: parse_hex(trace_id, 32).and_then(|v| u128::from_str_radix(v, 16).ok())?,
            span_id: parse_hex(span_id, 16).and_then(|v| u64::from_str_radix(v, 16).ok())?,
            sampled: parse_hex(flags, 2).and_then(|v| u8::from_str_radix(v, 16).ok())? & FLAG_SAMPLED != 0,
            trace_state: None,
        };

        context.is_valid().then_some(context)
    }
}

fn parse_hex(value: &str, len: usize) -> Option<&str> {
    (value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())).then_some(value)
}

fn random_span_id() -> u64 {
    loop {
        let id = Uuid::new_v4().as_u128() as u64;
        if id != 0 {
            return id;
        }
    }
}

/// Write side of a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Read side of a carrier.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
    fn keys(&self) -> Vec<&str>;
}

/// Serializes trace context into, and out of, a key/value carrier.
pub trait TextMapPropagator: Send + Sync {
    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector);
    fn extract(&self, extractor: &dyn Extractor) -> Option<TraceContext>;
    fn fields(&self) -> &'static [&'static str];
}

/// `traceparent` / `tracestate` propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceContextPropagator;

impl TraceContextPropagator {
    pub fn new() -> Self {
        Self
    }
}

impl TextMapPropagator for TraceContextPropagator {
    fn inject(&self, context: &TraceContext, injector: &mut dyn Injector) {
        if !context.is_valid() {
            return;
        }
        injector.set(TRACEPARENT, context.to_traceparent());
        if let Some(state) = context.trace_state.as_deref().filter(|s| !s.is_empty()) {
            injector.set(TRACESTATE, state.to_string());
        }
    }

    fn extract(&self, extractor: &dyn Extractor) -> Option<TraceContext> {
        let mut context = TraceContext::from_traceparent(extractor.get(TRACEPARENT)?)?;
        context.trace_state = extractor
            .get(TRACESTATE)
            .map(str::to_string)
            .filter(|s| !s.is_empty());
        Some(context)
    }

    fn fields(&self) -> &'static [&'static str] {
        &[TRACEPARENT, TRACESTATE]
    }
}

/// Carrier adapter over request [`Metadata`].
pub struct MetadataCarrier<M> {
    metadata: M,
}

impl<M> MetadataCarrier<M> {
    pub fn new(metadata: M) -> Self {
        Self { metadata }
    }
}

impl Injector for MetadataCarrier<&mut Metadata> {
    fn set(&mut self, key: &str, value: String) {
        self.metadata.insert(key, value);
    }
}

impl Extractor for MetadataCarrier<&Metadata> {
    fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.metadata.keys().collect()
    }
}

impl Extractor for MetadataCarrier<&mut Metadata> {
    fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.metadata.keys().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traceparent_format() {
        let ctx = TraceContext {
            trace_id: 0x4bf92f3577b34da6a3ce929d0e0e4736,
            span_id: 0x00f067aa0ba902b7,
            sampled: true,
            trace_state: None,
        };
        assert_eq!(
            ctx.to_traceparent(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert_eq!(TraceContext::from_traceparent(&ctx.to_traceparent()), Some(ctx));
    }

    #[test]
    fn test_rejects_malformed_traceparent() {
        for bad in [
            "",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-+bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ] {
            assert!(TraceContext::from_traceparent(bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_inject_and_extract_through_metadata() {
        let propagator = TraceContextPropagator::new();
        let mut ctx = TraceContext::new_root();
        ctx.trace_state = Some("vendor=1".into());

        let mut metadata = Metadata::new();
        propagator.inject(&ctx, &mut MetadataCarrier::new(&mut metadata));

        assert_eq!(metadata.get(TRACEPARENT), Some(ctx.to_traceparent().as_str()));
        assert_eq!(metadata.get(TRACESTATE), Some("vendor=1"));
        assert_eq!(propagator.extract(&MetadataCarrier::new(&metadata)), Some(ctx));
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(root.trace_id, child.trace_id);
        assert!(child.is_valid());
    }

    #[test]
    fn test_unsampled_flag() {
        let ctx = TraceContext::from_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00",
        )
        .unwrap();
        assert!(!ctx.sampled);
    }
}
