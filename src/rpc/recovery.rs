//! Panic isolation for inbound plugin handlers
//!
//! A panic inside plugin business logic is caught at the handler boundary, logged with
//! the panic-site backtrace and answered with a fixed `Internal` status. Nothing about
//! the panic (message, file, line) reaches the caller.

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use tracing::error;

use super::server::{RequestContext, ServiceHandler};
use super::Status;

/// Message returned to callers for any recovered panic.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Install a panic hook that records the backtrace of the panicking thread so
/// [`recover`] can log where the panic happened rather than where it was caught.
/// The previously installed hook still runs.
pub fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            previous(info);
        }));
    });
}

/// Run a handler future, converting a panic into an `Internal` status.
pub async fn recover<F>(method: &str, handler: F) -> Result<Bytes, Status>
where
    F: Future<Output = Result<Bytes, Status>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let backtrace = PANIC_BACKTRACE
                .with(|slot| slot.borrow_mut().take())
                .unwrap_or_else(|| Backtrace::force_capture().to_string());

            error!(
                method,
                panic = %panic_message(&*panic),
                backtrace = %backtrace,
                "recovered from panic in plugin handler"
            );

            Err(Status::internal(INTERNAL_ERROR_MESSAGE))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handler wrapper that applies [`recover`] to every call.
pub struct Recovered<H> {
    inner: H,
}

impl<H> Recovered<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<H: ServiceHandler> ServiceHandler for Recovered<H> {
    async fn call(&self, ctx: RequestContext, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        recover(method, self.inner.call(ctx, method, payload)).await
    }
}
