//! Detached continuations and completion callbacks.
//!
//! Public create operations return as soon as the PENDING record is
//! registered. The remaining work runs on a spawned task which carries the
//! caller context and a tracing span naming the resource. When that work
//! ends, successfully or not, it fires a [`Callback`] so whoever is waiting
//! on the resource can re-evaluate.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{info_span, warn, Instrument};

use crate::context::CallerContext;
use crate::error::{FactoryError, FactoryResult};
use crate::types::ResourceId;

type Continuation = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

/// Completion callback invoked once a detached step has finished.
#[derive(Default)]
pub struct Callback(Option<Continuation>);

impl Callback {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Some(Box::new(move || f().boxed())))
    }

    /// A callback that does nothing.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// True if firing this callback does something.
    #[must_use]
    pub fn is_some(&self) -> bool {
        self.0.is_some()
    }

    /// Run the callback.
    pub async fn fire(self) {
        if let Some(continuation) = self.0 {
            continuation().await;
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Callback")
            .field(&if self.is_some() { "set" } else { "none" })
            .finish()
    }
}

/// A callback shared between several events of which only the first to call
/// [`OnceCallback::fire`] runs it.
#[derive(Debug, Clone, Default)]
pub struct OnceCallback(Arc<Mutex<Option<Callback>>>);

impl OnceCallback {
    /// Share `callback`.
    #[must_use]
    pub fn new(callback: Callback) -> Self {
        Self(Arc::new(Mutex::new(Some(callback))))
    }

    /// Fire the callback unless it already fired.
    pub async fn fire(&self) {
        let callback = self.0.lock().ok().and_then(|mut slot| slot.take());
        if let Some(callback) = callback {
            callback.fire().await;
        }
    }

    /// True once the callback has fired.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.0.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }
}

/// A newly registered resource and the task finishing its provisioning.
#[derive(Debug)]
pub struct Provisioning<T> {
    /// The PENDING record as registered.
    pub resource: T,
    /// Detached continuation.
    pub task: JoinHandle<()>,
}

impl<T> Provisioning<T> {
    /// Drop the task handle and keep the record. The task keeps running.
    pub fn into_resource(self) -> T {
        self.resource
    }

    /// Wait for the detached continuation to finish.
    ///
    /// Work it hands off to further tasks (for example a build poll loop)
    /// may still be running afterwards.
    pub async fn join(self) -> FactoryResult<T> {
        self.task
            .await
            .map_err(|e| FactoryError::internal(format!("provisioning task failed: {e}")))?;
        Ok(self.resource)
    }
}

/// Spawn `fut` as a detached step of `operation` on `resource_id`.
pub fn detach<F>(
    ctx: &CallerContext,
    operation: &'static str,
    resource_id: &ResourceId,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let span = info_span!(
        "detached",
        operation,
        principal = %ctx.principal(),
        resource_id = %resource_id,
    );
    tokio::spawn(fut.instrument(span))
}

/// Run all `futures` to completion, then return the first error seen.
pub async fn settle_all<I, F>(futures: I) -> FactoryResult<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = FactoryResult<()>>,
{
    let mut first = None;
    for result in join_all(futures).await {
        if let Err(err) = result {
            if first.is_none() {
                first = Some(err);
            } else {
                warn!(error = %err, "additional failure during cascade");
            }
        }
    }
    first.map_or(Ok(()), Err)
}
