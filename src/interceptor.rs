//! Interceptors - cross-cutting wrappers around handler logic.
//!
//! An interceptor is a pair of higher-order transforms: one over the
//! unary function shape and one over the generic streaming
//! implementation. A single interceptor can therefore observe every
//! RPC of a handler regardless of stream shape. Typed constructors
//! apply the configured interceptor once, at handler construction
//! time.

use std::sync::Arc;

use crate::conn::{BoxFuture, StreamingHandlerConn};
use crate::context::CallContext;
use crate::envelope::{AnyRequest, AnyResponse};
use crate::error::Result;

/// The type-erased unary function shape wrapped by
/// [`Interceptor::wrap_unary`].
pub type UnaryFn = Arc<
    dyn Fn(CallContext, Box<dyn AnyRequest>) -> BoxFuture<'static, Result<Box<dyn AnyResponse>>>
        + Send
        + Sync,
>;

/// The generic streaming implementation shape wrapped by
/// [`Interceptor::wrap_streaming_handler`] and invoked by the
/// dispatcher for every stream type.
pub type StreamingHandlerFn = Arc<
    dyn for<'a> Fn(CallContext, &'a mut dyn StreamingHandlerConn) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// A cross-cutting transform over handler functions.
///
/// Both methods default to passing `next` through unchanged, so an
/// interceptor may implement only the shape it cares about.
pub trait Interceptor: Send + Sync {
    /// Wrap the unary function shape.
    fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
        next
    }

    /// Wrap the streaming implementation shape.
    fn wrap_streaming_handler(&self, next: StreamingHandlerFn) -> StreamingHandlerFn {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Request, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Interceptor for Counting {
        fn wrap_unary(&self, next: UnaryFn) -> UnaryFn {
            let calls = self.calls.clone();
            Arc::new(move |ctx, request| {
                calls.fetch_add(1, Ordering::SeqCst);
                (*next)(ctx, request)
            })
        }
    }

    #[tokio::test]
    async fn test_wrap_unary_observes_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let interceptor = Counting {
            calls: calls.clone(),
        };

        let inner: UnaryFn = Arc::new(|_ctx, _request| {
            Box::pin(async {
                Ok(Box::new(Response::new(1u8)) as Box<dyn AnyResponse>)
            })
        });
        let wrapped = interceptor.wrap_unary(inner);

        let ctx = CallContext::background();
        (*wrapped)(ctx.clone(), Box::new(Request::new(0u8)))
            .await
            .unwrap();
        (*wrapped)(ctx, Box::new(Request::new(0u8))).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_passthrough() {
        struct Noop;
        impl Interceptor for Noop {}

        let inner: StreamingHandlerFn = Arc::new(|_ctx, _conn| Box::pin(async { Ok(()) }));
        // Default impl returns the same Arc.
        let wrapped = Noop.wrap_streaming_handler(inner.clone());
        assert!(Arc::ptr_eq(&inner, &wrapped));
    }
}
