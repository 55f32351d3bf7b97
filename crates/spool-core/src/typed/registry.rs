//! Service definitions and the registry the engine dispatches from.
//!
//! ```ignore
//! let account = ServiceDefinition::virtual_object("account")
//!     .exclusive("withdraw", handler_fn(withdraw))
//!     .exclusive("deposit", handler_fn(deposit))
//!     .shared("balance", handler_fn(balance));
//!
//! let mut registry = ServiceRegistry::new();
//! registry.register(account)?;
//! ```
//!
//! Definitions are validated on `register`: handler kinds must fit the
//! service kind and a workflow needs exactly one `run` handler.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use crate::domain::{HandlerKind, InvocationTarget, ServiceKind};
use crate::error::SpoolError;

/// Name of a workflow's body handler.
pub const WORKFLOW_RUN: &str = "run";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("handler '{handler}' is defined twice on service '{service}'")]
    DuplicateHandler { service: String, handler: String },

    #[error("handler '{handler}' on service '{service}' cannot be {kind:?}")]
    InvalidHandlerKind {
        service: String,
        handler: String,
        kind: HandlerKind,
    },

    #[error("workflow '{0}' has no run handler")]
    MissingRun(String),
}

#[derive(Clone)]
pub struct RegisteredHandler {
    pub kind: HandlerKind,
    pub handler: Arc<dyn DynHandler>,
}

/// Builder for one service and its handlers.
pub struct ServiceDefinition {
    name: String,
    kind: ServiceKind,
    handlers: Vec<(String, RegisteredHandler)>,
}

impl ServiceDefinition {
    /// Stateless service; handlers take no key.
    pub fn service(name: impl Into<String>) -> Self {
        Self::new(name, ServiceKind::Service)
    }

    /// Keyed entity with exclusive and shared handlers.
    pub fn virtual_object(name: impl Into<String>) -> Self {
        Self::new(name, ServiceKind::VirtualObject)
    }

    /// Keyed workflow: a `run` body plus shared handlers.
    pub fn workflow(name: impl Into<String>) -> Self {
        Self::new(name, ServiceKind::Workflow)
    }

    fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a handler with the service kind's default admission class:
    /// stateless on services, exclusive on virtual objects, shared on workflows.
    pub fn handler<H: Handler>(self, name: impl Into<String>, handler: H) -> Self {
        let kind = match self.kind {
            ServiceKind::Service => HandlerKind::Stateless,
            ServiceKind::VirtualObject => HandlerKind::Exclusive,
            ServiceKind::Workflow => HandlerKind::Shared,
        };
        self.with_kind(name, kind, handler)
    }

    pub fn exclusive<H: Handler>(self, name: impl Into<String>, handler: H) -> Self {
        self.with_kind(name, HandlerKind::Exclusive, handler)
    }

    pub fn shared<H: Handler>(self, name: impl Into<String>, handler: H) -> Self {
        self.with_kind(name, HandlerKind::Shared, handler)
    }

    /// The workflow body, registered under `run`.
    pub fn run<H: Handler>(self, handler: H) -> Self {
        self.with_kind(WORKFLOW_RUN, HandlerKind::WorkflowRun, handler)
    }

    fn with_kind<H: Handler>(mut self, name: impl Into<String>, kind: HandlerKind, handler: H) -> Self {
        self.handlers.push((
            name.into(),
            RegisteredHandler {
                kind,
                handler: Arc::new(TypedHandler::new(handler)),
            },
        ));
        self
    }

    fn allows(&self, kind: HandlerKind) -> bool {
        match self.kind {
            ServiceKind::Service => kind == HandlerKind::Stateless,
            ServiceKind::VirtualObject => {
                matches!(kind, HandlerKind::Exclusive | HandlerKind::Shared)
            }
            ServiceKind::Workflow => matches!(kind, HandlerKind::WorkflowRun | HandlerKind::Shared),
        }
    }
}

struct RegisteredService {
    kind: ServiceKind,
    handlers: HashMap<String, RegisteredHandler>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, RegisteredService>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ServiceDefinition) -> Result<(), RegistryError> {
        if self.services.contains_key(&definition.name) {
            return Err(RegistryError::AlreadyRegistered(definition.name));
        }

        let mut handlers = HashMap::new();
        for (name, registered) in &definition.handlers {
            if !definition.allows(registered.kind) {
                return Err(RegistryError::InvalidHandlerKind {
                    service: definition.name.clone(),
                    handler: name.clone(),
                    kind: registered.kind,
                });
            }
            if handlers.insert(name.clone(), registered.clone()).is_some() {
                return Err(RegistryError::DuplicateHandler {
                    service: definition.name.clone(),
                    handler: name.clone(),
                });
            }
        }
        if definition.kind == ServiceKind::Workflow
            && !handlers
                .values()
                .any(|h| h.kind == HandlerKind::WorkflowRun)
        {
            return Err(RegistryError::MissingRun(definition.name));
        }

        self.services.insert(
            definition.name,
            RegisteredService {
                kind: definition.kind,
                handlers,
            },
        );
        Ok(())
    }

    /// Resolve a target, checking that the key matches the service kind.
    pub fn lookup(&self, target: &InvocationTarget) -> Result<RegisteredHandler, SpoolError> {
        let service = self
            .services
            .get(&target.service)
            .ok_or_else(|| SpoolError::ServiceNotFound(target.service.clone()))?;
        let handler = service
            .handlers
            .get(&target.handler)
            .ok_or_else(|| SpoolError::HandlerNotFound {
                service: target.service.clone(),
                handler: target.handler.clone(),
            })?;

        match (service.kind, &target.key) {
            (ServiceKind::Service, Some(_)) => Err(SpoolError::UnexpectedKey(target.to_string())),
            (ServiceKind::VirtualObject | ServiceKind::Workflow, None) => {
                Err(SpoolError::MissingKey(target.to_string()))
            }
            _ => Ok(handler.clone()),
        }
    }

    pub fn contains_service(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// All handlers as `service/handler`.
    pub fn registered_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .flat_map(|(service, s)| s.handlers.keys().map(move |h| format!("{service}/{h}")))
            .collect();
        names.sort();
        names
    }
}
