//! Session server router — dispatches JSON-RPC requests to services.

use std::sync::Arc;
use std::time::Instant;

use seb_protocol::{HandlerResult, MonitoringEvent, RpcError, RpcNotification};
use seb_services::rpc::{
    ClientService, ConnectionService, InstructionService, MonitoringService, NotificationService,
    ProctoringService,
};
use seb_services::{Service, SessionManager};
use seb_transport::server::RequestHandler;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::middleware::{Middleware, MiddlewareChain, RequestLogMiddleware};

/// The session server — owns services and routes requests.
pub struct SessionServer {
    /// Registered services (boxed for object safety)
    services: Vec<Box<dyn ServiceDyn>>,
    /// Middleware chain
    middleware: MiddlewareChain,
    /// Server state
    state: ServerState,
    /// Notification sender (for broadcasting to subscribers)
    notification_tx: Option<broadcast::Sender<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Uninitialized,
    Running,
    Shutdown,
}

/// Object-safe wrapper for the Service trait.
trait ServiceDyn: Send + Sync {
    fn namespace_dyn(&self) -> &str;
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>>;
    fn init_dyn(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + '_>>;
    fn shutdown_dyn(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>>;
}

impl<T: Service> ServiceDyn for T {
    fn namespace_dyn(&self) -> &str {
        self.namespace()
    }
    fn handle_dyn<'a>(
        &'a self,
        method: &'a str,
        params: Option<Value>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = HandlerResult> + Send + 'a>> {
        Box::pin(self.handle(method, params))
    }
    fn init_dyn(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send + '_>> {
        Box::pin(self.init())
    }
    fn shutdown_dyn(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.shutdown())
    }
}

impl SessionServer {
    pub fn new() -> Self {
        let mut middleware = MiddlewareChain::new();
        middleware.add(RequestLogMiddleware);

        Self {
            services: Vec::new(),
            middleware,
            state: ServerState::Uninitialized,
            notification_tx: None,
        }
    }

    /// A server with every session service registered against `manager`.
    pub fn with_session_services(manager: Arc<SessionManager>) -> Self {
        let mut server = Self::new();
        server.register_service(ConnectionService::new(manager.clone()));
        server.register_service(ClientService::new(manager.clone()));
        server.register_service(InstructionService::new(manager.clone()));
        server.register_service(NotificationService::new(manager.clone()));
        server.register_service(ProctoringService::new(manager.clone()));
        server.register_service(MonitoringService::new(manager));
        server
    }

    /// Register a service with the server.
    pub fn register_service<S: Service + 'static>(&mut self, service: S) {
        info!("Registering service: {}", service.namespace());
        self.services.push(Box::new(service));
    }

    /// Append a middleware; it runs after the ones already registered.
    pub fn add_middleware<M: Middleware + 'static>(&mut self, middleware: M) {
        info!("Registering middleware: {}", middleware.name());
        self.middleware.add(middleware);
    }

    pub fn middleware_names(&self) -> Vec<&str> {
        self.middleware.names()
    }

    /// Set the notification sender for broadcasting.
    pub fn set_notification_sender(&mut self, tx: broadcast::Sender<String>) {
        self.notification_tx = Some(tx);
    }

    /// Initialize all services.
    pub async fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for service in &self.services {
            service.init_dyn().await?;
        }

        self.state = ServerState::Running;
        info!("Session server initialized ({} services)", self.services.len());
        Ok(())
    }

    /// Shutdown all services.
    pub async fn shutdown(&mut self) {
        if self.state == ServerState::Shutdown {
            return;
        }

        info!("Shutting down session server...");
        self.state = ServerState::Shutdown;

        for service in &self.services {
            service.shutdown_dyn().await;
        }

        info!("Session server shutdown complete");
    }

    /// Broadcast a notification to all subscribers.
    pub fn emit_notification(&self, method: &str, params: Option<Value>) {
        if let Some(tx) = &self.notification_tx {
            let notification = RpcNotification::new(method, params);
            if let Ok(json) = serde_json::to_string(&notification) {
                let _ = tx.send(json);
            }
        }
    }

    /// Broadcast a monitoring event as a notification.
    pub fn emit_monitoring(&self, event: &MonitoringEvent) {
        let notification = event.to_notification();
        self.emit_notification(&notification.method, notification.params);
    }

    /// Route a request to the appropriate service.
    async fn route_request(&self, method: &str, params: Option<Value>) -> HandlerResult {
        let namespace = method.split('/').next().unwrap_or("");
        match self.services.iter().find(|s| s.namespace_dyn() == namespace) {
            Some(service) => service.handle_dyn(method, params).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }
}

impl Default for SessionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandler for SessionServer {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> HandlerResult {
        // Check server state
        match self.state {
            ServerState::Shutdown => return Err(RpcError::shutting_down()),
            ServerState::Uninitialized => return Err(RpcError::not_initialized()),
            ServerState::Running => {}
        }

        self.middleware.run_before(method, params.as_ref()).await;
        let started = Instant::now();
        let result = self.route_request(method, params).await;
        self.middleware.run_after(method, &result, started.elapsed()).await;
        result
    }
}
