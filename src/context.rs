// THEORY:
// The engine context is the one object that owns the image-processing backend.
// It is built once by the host, cloned into every component constructor, and
// never reached through global state.
//
// Acquiring a backend may be asynchronous (a native library warming up, a model
// being fetched). The context holds that acquisition as a shared one-shot
// future:
// 1.  `ready().await` drives it to completion. A capture session awaits it
//     exactly once, when it starts.
// 2.  `backend()` only peeks. Before the future resolves every component call
//     fails with `EngineError::NotReady`; a failed load is reported as the
//     stored `Unavailable` error on every call after that.

use crate::core_modules::imaging::{ImageprocBackend, ImagingBackend};
use crate::error::{EngineError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

type Readiness = Shared<BoxFuture<'static, Result<Arc<dyn ImagingBackend>>>>;

#[derive(Clone)]
pub struct EngineContext {
    readiness: Readiness,
}

impl EngineContext {
    /// A context whose backend becomes available when `loader` completes.
    pub fn new<F>(loader: F) -> Self
    where
        F: Future<Output = Result<Arc<dyn ImagingBackend>>> + Send + 'static,
    {
        let readiness = async move {
            let result = loader.await;
            match &result {
                Ok(backend) => info!(backend = backend.name(), "imaging backend ready"),
                Err(err) => warn!(error = %err, "imaging backend failed to load"),
            }
            result
        }
        .boxed()
        .shared();
        Self { readiness }
    }

    /// An already-resolved context.
    pub fn with_backend(backend: Arc<dyn ImagingBackend>) -> Self {
        let ctx = Self::new(futures::future::ready(Ok::<_, EngineError>(backend)));
        // The loader is immediately ready, so one poll stores the result.
        let _ = ctx.readiness.clone().now_or_never();
        ctx
    }

    /// An already-resolved context over the `imageproc` backend.
    pub fn imageproc() -> Self {
        Self::with_backend(Arc::new(ImageprocBackend))
    }

    /// Waits for the backend to load.
    pub async fn ready(&self) -> Result<Arc<dyn ImagingBackend>> {
        self.readiness.clone().await
    }

    /// The backend, if loading has finished. Never waits.
    pub fn backend(&self) -> Result<Arc<dyn ImagingBackend>> {
        match self.readiness.peek() {
            Some(result) => result.clone(),
            None => Err(EngineError::NotReady),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.readiness.peek(), Some(Ok(_)))
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.readiness.peek() {
            None => "pending",
            Some(Ok(_)) => "ready",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("EngineContext").field("backend", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn rejects_calls_until_loaded() {
        let (tx, rx) = oneshot::channel::<Arc<dyn ImagingBackend>>();
        let ctx = EngineContext::new(async move {
            rx.await
                .map_err(|_| EngineError::Unavailable("loader dropped".into()))
        });

        assert_eq!(ctx.backend().err(), Some(EngineError::NotReady));
        assert!(!ctx.is_ready());

        tx.send(Arc::new(ImageprocBackend)).ok();
        let backend = ctx.ready().await.unwrap();
        assert_eq!(backend.name(), "imageproc");
        assert!(ctx.backend().is_ok());
        assert!(ctx.clone().is_ready());
    }

    #[tokio::test]
    async fn failed_load_is_reported_on_every_call() {
        let ctx = EngineContext::new(async {
            Err::<Arc<dyn ImagingBackend>, _>(EngineError::Unavailable("no wasm".into()))
        });
        assert!(ctx.ready().await.is_err());
        let err = ctx.backend().err().unwrap();
        assert_eq!(err, EngineError::Unavailable("no wasm".into()));
        assert!(err.is_retryable());
    }

    #[test]
    fn prebuilt_context_is_ready_without_awaiting() {
        let ctx = EngineContext::imageproc();
        assert!(ctx.is_ready());
        assert_eq!(format!("{ctx:?}"), "EngineContext { backend: \"ready\" }");
    }
}
