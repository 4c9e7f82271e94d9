//! Cross-process context propagation
//!
//! Every outbound plugin call passes through the configured [`Interceptor`]s, which
//! may only add metadata. The standard interceptor carries the caller's trace context
//! and an allow-list of inbound request headers.

use std::sync::Arc;

use crate::rpc::{CallContext, Metadata};

pub mod headers;
pub mod trace;

pub use headers::HeaderForwardingPolicy;
pub use trace::{
    Extractor, Injector, MetadataCarrier, TextMapPropagator, TraceContext, TraceContextPropagator,
};

/// Hook run on the outbound metadata of every plugin call.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, ctx: &CallContext, metadata: &mut Metadata);
}

pub struct ContextPropagationInterceptor {
    propagator: Arc<dyn TextMapPropagator>,
    policy: HeaderForwardingPolicy,
}

impl ContextPropagationInterceptor {
    pub fn new(propagator: Arc<dyn TextMapPropagator>, policy: HeaderForwardingPolicy) -> Self {
        Self { propagator, policy }
    }

    /// W3C trace context plus the given header allow-list.
    pub fn with_policy(policy: HeaderForwardingPolicy) -> Self {
        Self::new(Arc::new(TraceContextPropagator::new()), policy)
    }
}

impl Interceptor for ContextPropagationInterceptor {
    fn intercept(&self, ctx: &CallContext, metadata: &mut Metadata) {
        if let Some(trace) = &ctx.trace {
            self.propagator
                .inject(trace, &mut MetadataCarrier::new(&mut *metadata));
        }
        self.policy.forward(&ctx.headers, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn test_injects_trace_and_forwarded_headers() {
        let interceptor = ContextPropagationInterceptor::with_policy(HeaderForwardingPolicy::new(["X-Tenant"]));
        let trace = TraceContext::new_root();
        let mut headers = HeaderMap::new();
        headers.append("x-tenant", HeaderValue::from_static("acme"));
        headers.append("cookie", HeaderValue::from_static("session=1"));
        let ctx = CallContext::new().with_trace(trace.clone()).with_headers(headers);

        let mut metadata = Metadata::new();
        interceptor.intercept(&ctx, &mut metadata);

        assert_eq!(metadata.get(trace::TRACEPARENT), Some(trace.to_traceparent().as_str()));
        assert_eq!(metadata.get_all("x-tenant"), ["acme".to_string()]);
        assert!(!metadata.contains_key("cookie"));
    }

    #[test]
    fn test_no_trace_means_no_traceparent() {
        let interceptor = ContextPropagationInterceptor::with_policy(HeaderForwardingPolicy::default());
        let mut metadata = Metadata::new();
        interceptor.intercept(&CallContext::new(), &mut metadata);
        assert!(metadata.is_empty());
    }
}
