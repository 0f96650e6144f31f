//! The pluggable main handler and its execution context.
//!
//! # Responsibilities
//! - Define the `MainHandler` seam the proxying business logic plugs into
//! - Dispatch each decoded request onto the handler executor, away from the
//!   connection task that drives socket I/O
//!
//! # Design Decisions
//! - One handler instance is shared by all connections; it must tolerate
//!   concurrent calls
//! - Handler errors and panics both surface as stage errors, which close the
//!   connection

use std::future::Future;
use std::io;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::Response;
use tokio::runtime::{self, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::http::request::DecodedRequest;
use crate::http::response::{BoxError, ProxyBody};
use crate::pipeline::stage::StageError;

/// Business logic consuming fully decoded requests.
///
/// Never runs on the connection's I/O task.
pub trait MainHandler: Send + Sync + 'static {
    fn handle(&self, request: DecodedRequest) -> BoxFuture<'static, Result<Response<ProxyBody>, BoxError>>;
}

impl<F, Fut> MainHandler for F
where
    F: Fn(DecodedRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ProxyBody>, BoxError>> + Send + 'static,
{
    fn handle(&self, request: DecodedRequest) -> BoxFuture<'static, Result<Response<ProxyBody>, BoxError>> {
        self(request).boxed()
    }
}

/// Pool the main handler runs on.
///
/// Defaults to the runtime the server was started on; a dedicated runtime
/// keeps slow handlers from competing with connection I/O.
#[derive(Debug, Clone)]
pub struct HandlerExecutor {
    handle: Handle,
}

impl HandlerExecutor {
    /// Executor backed by the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

/// Name of the worker threads of a [`HandlerPool`].
pub const HANDLER_THREAD_NAME: &str = "proxy-handler";

/// Dedicated multi-thread runtime the main handler runs on.
///
/// Dropping the pool stops its workers without blocking, so it may be
/// dropped from async code.
#[derive(Debug)]
pub struct HandlerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl HandlerPool {
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(HANDLER_THREAD_NAME)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn executor(&self) -> HandlerExecutor {
        HandlerExecutor::from_handle(self.handle.clone())
    }
}

impl Drop for HandlerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// The main-handler stage: last request stage of the chain.
#[derive(Clone)]
pub struct MainHandlerStage {
    handler: Arc<dyn MainHandler>,
    executor: HandlerExecutor,
}

impl MainHandlerStage {
    pub fn new(handler: Arc<dyn MainHandler>, executor: HandlerExecutor) -> Self {
        Self { handler, executor }
    }

    pub async fn dispatch(&self, request: DecodedRequest) -> Result<Response<ProxyBody>, StageError> {
        let task = self.executor.spawn(self.handler.handle(request));
        task.await?.map_err(StageError::Handler)
    }
}

impl std::fmt::Debug for MainHandlerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainHandlerStage")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread_name() -> String {
        std::thread::current().name().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn pool_runs_tasks_on_its_own_threads() {
        let pool = HandlerPool::new(2).unwrap();
        let name = pool.executor().spawn(async { thread_name() }).await.unwrap();
        assert_eq!(name, HANDLER_THREAD_NAME);
        assert_ne!(thread_name(), HANDLER_THREAD_NAME);
    }

    #[tokio::test]
    async fn current_executor_stays_on_the_calling_runtime() {
        let name = HandlerExecutor::current()
            .spawn(async { thread_name() })
            .await
            .unwrap();
        assert_ne!(name, HANDLER_THREAD_NAME);
    }
}
