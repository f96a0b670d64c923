//! Middleware chain for request processing.
//!
//! Middleware observe every routed request: `before` sees the method and
//! params, `after` sees the outcome and how long the service took. They run
//! in registration order.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use seb_protocol::HandlerResult;
use serde_json::Value;
use tracing::{debug, warn};

/// Trait for request middleware.
pub trait Middleware: Send + Sync {
    /// Called before the request reaches its service.
    fn before(&self, _method: &str, _params: Option<&Value>) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called with the service's result.
    fn after(&self, method: &str, result: &HandlerResult, elapsed: Duration) -> impl Future<Output = ()> + Send;

    /// Middleware name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of Middleware trait — all refs share lifetime `'a`.
trait MiddlewareDyn: Send + Sync {
    fn before_dyn<'a>(&'a self, method: &'a str, params: Option<&'a Value>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn after_dyn<'a>(
        &'a self,
        method: &'a str,
        result: &'a HandlerResult,
        elapsed: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn name_dyn(&self) -> &str;
}

impl<T: Middleware> MiddlewareDyn for T {
    fn before_dyn<'a>(&'a self, method: &'a str, params: Option<&'a Value>) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.before(method, params))
    }

    fn after_dyn<'a>(
        &'a self,
        method: &'a str,
        result: &'a HandlerResult,
        elapsed: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(self.after(method, result, elapsed))
    }

    fn name_dyn(&self) -> &str {
        self.name()
    }
}

/// Middleware executed in registration order.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Box<dyn MiddlewareDyn>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(Box::new(middleware));
    }

    pub async fn run_before(&self, method: &str, params: Option<&Value>) {
        for mw in &self.middlewares {
            mw.before_dyn(method, params).await;
        }
    }

    pub async fn run_after(&self, method: &str, result: &HandlerResult, elapsed: Duration) {
        for mw in &self.middlewares {
            mw.after_dyn(method, result, elapsed).await;
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name_dyn()).collect()
    }
}

/// Logs every request at debug level, and retryable failures as warnings.
/// Pings are left out; clients send them every few seconds.
pub struct RequestLogMiddleware;

impl RequestLogMiddleware {
    fn is_noisy(method: &str) -> bool {
        method == seb_protocol::Methods::SEB_PING
    }
}

impl Middleware for RequestLogMiddleware {
    async fn before(&self, method: &str, _params: Option<&Value>) {
        if !Self::is_noisy(method) {
            debug!("Request: {}", method);
        }
    }

    async fn after(&self, method: &str, result: &HandlerResult, elapsed: Duration) {
        match result {
            Err(e) if e.data.is_some() => warn!("{} failed (retryable): {}", method, e.message),
            Err(e) => debug!("{} failed: {}", method, e.message),
            Ok(_) if Self::is_noisy(method) => {}
            Ok(value) => debug!("Completed: {} ({} bytes, {:?})", method, value.to_string().len(), elapsed),
        }
    }

    fn name(&self) -> &str {
        "request-log"
    }
}
