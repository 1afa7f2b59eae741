//! Orchestrator-side services callable from sandboxed workers.
//!
//! A worker reaches these through `service:call` envelopes, or through
//! `rpc:forward` traffic addressed to `"main"` with a `"<service>.<method>"`
//! method string. Either way, dispatch resolves the service by name and the
//! handler produces exactly one result or error; handler failures become
//! error responses on the wire, never panics or dropped correlations.
//!
//! The built-ins `fs` and `network` are registered at construction and
//! cannot be replaced. Applications may register their own handlers.

pub mod fs;
pub mod network;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use warren_core::scoped_fs::{ScopedFs, ScopedFsError};

/// Ceiling on registered services.
pub const MAX_SERVICES: usize = 64;

/// Service names reserved for the built-in handlers.
pub const BUILTIN_SERVICES: &[&str] = &["fs", "network"];

/// Per-call context handed to a service handler.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    /// Id of the calling worker, as reported by the host.
    pub worker_id: String,
    /// The caller's scoped filesystem, when its record still has one.
    pub fs: Option<ScopedFs>,
}

impl ServiceContext {
    /// Context for a worker with a filesystem.
    #[must_use]
    pub fn new(worker_id: impl Into<String>, fs: Option<ScopedFs>) -> Self {
        Self {
            worker_id: worker_id.into(),
            fs,
        }
    }

    /// The caller's filesystem, or the error every fs-touching handler
    /// reports for an already-cleaned-up worker.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NoFilesystem`] when the record has no root.
    pub fn require_fs(&self) -> Result<&ScopedFs, ServiceError> {
        self.fs.as_ref().ok_or_else(|| ServiceError::NoFilesystem {
            worker_id: self.worker_id.clone(),
        })
    }
}

/// One orchestrator-side service.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Handle one method call from a worker.
    ///
    /// # Errors
    ///
    /// Any [`ServiceError`]; the router converts it into an error response
    /// carrying the original correlation id.
    async fn call(
        &self,
        ctx: &ServiceContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ServiceError>;
}

/// Name-to-handler map with protected built-ins.
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceRegistry {
    /// Registry with the `fs` and `network` built-ins installed.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Internal`] when the HTTP client cannot be built.
    pub fn with_builtins() -> Result<Self, ServiceError> {
        let registry = Self::empty();
        {
            let mut handlers = registry.handlers.write().expect("lock poisoned");
            handlers.insert("fs".to_string(), Arc::new(fs::FsService));
            handlers.insert(
                "network".to_string(),
                Arc::new(network::NetworkService::new()?),
            );
        }
        Ok(registry)
    }

    /// Registry with no services at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) an application service.
    ///
    /// # Errors
    ///
    /// Rejects built-in names, empty names, and registration beyond
    /// [`MAX_SERVICES`].
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Result<(), ServiceError> {
        if name.is_empty() {
            return Err(ServiceError::internal("service name must not be empty"));
        }
        if BUILTIN_SERVICES.contains(&name) {
            return Err(ServiceError::BuiltinService {
                name: name.to_string(),
            });
        }
        let mut handlers = self.handlers.write().expect("lock poisoned");
        if !handlers.contains_key(name) && handlers.len() >= MAX_SERVICES {
            return Err(ServiceError::RegistryFull { max: MAX_SERVICES });
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Remove an application service. Built-ins stay.
    ///
    /// Returns whether a service was removed.
    pub fn unregister(&self, name: &str) -> bool {
        if BUILTIN_SERVICES.contains(&name) {
            return false;
        }
        self.handlers
            .write()
            .expect("lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Whether a service is registered under the name.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .expect("lock poisoned")
            .contains_key(name)
    }

    /// Resolve and run one call.
    ///
    /// # Errors
    ///
    /// `Unknown service: <name>` for an unregistered name, or whatever the
    /// handler reports.
    pub async fn dispatch(
        &self,
        ctx: &ServiceContext,
        service: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value, ServiceError> {
        let handler = {
            let handlers = self.handlers.read().expect("lock poisoned");
            handlers.get(service).cloned()
        };
        let Some(handler) = handler else {
            return Err(ServiceError::UnknownService {
                name: service.to_string(),
            });
        };
        debug!(worker = %ctx.worker_id, service, method, "dispatching service call");
        handler.call(ctx, method, args).await
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().expect("lock poisoned");
        let mut names: Vec<&String> = handlers.keys().collect();
        names.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &names)
            .finish()
    }
}

/// Service dispatch failure.
///
/// Every variant renders to a message suitable for the wire `error` field.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No service is registered under the name. The message shape is part
    /// of the protocol contract with sandboxed callers.
    #[error("Unknown service: {name}")]
    UnknownService {
        /// The requested service name.
        name: String,
    },

    /// The service exists but has no such method.
    #[error("unknown method `{method}` on service `{service}`")]
    UnknownMethod {
        /// Service name.
        service: String,
        /// Requested method.
        method: String,
    },

    /// Arguments did not match the method's signature.
    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArgs {
        /// Method the arguments were for.
        method: String,
        /// What was wrong.
        reason: String,
    },

    /// The calling worker no longer has a scoped filesystem.
    #[error("worker `{worker_id}` has no scoped filesystem")]
    NoFilesystem {
        /// The calling worker.
        worker_id: String,
    },

    /// A scoped filesystem operation failed.
    #[error(transparent)]
    Fs(#[from] ScopedFsError),

    /// An outbound HTTP request failed.
    #[error("fetch failed: {reason}")]
    Fetch {
        /// What failed.
        reason: String,
    },

    /// The name collides with a protected built-in.
    #[error("service `{name}` is built-in and cannot be replaced")]
    BuiltinService {
        /// The contested name.
        name: String,
    },

    /// No room for another service.
    #[error("service registry is full ({max} services)")]
    RegistryFull {
        /// The registry bound.
        max: usize,
    },

    /// Anything else a handler wants to report.
    #[error("{message}")]
    Internal {
        /// Failure description.
        message: String,
    },
}

impl ServiceError {
    /// Internal error from a message.
    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal {
            message: message.into(),
        }
    }

    /// Invalid-arguments error for a method.
    pub fn invalid_args(method: impl Into<String>, reason: impl Into<String>) -> Self {
        ServiceError::InvalidArgs {
            method: method.into(),
            reason: reason.into(),
        }
    }
}
