//! Handler registration
//!
//! Hosts describe each consumer group they serve with a [`HandlerDescriptor`]
//! and collect them in a [`HandlerRegistry`] before bootstrapping. The
//! registry is read-only once the workers are running.
//!
//! # Example
//!
//! ```rust,ignore
//! use stream_groups::{HandlerDescriptor, HandlerRegistry};
//!
//! let registry = HandlerRegistry::new()
//!     .with(HandlerDescriptor::new("orders", "orders", 2, Arc::new(OrderHandler)))?
//!     .with(HandlerDescriptor::new("audit", "audit", 1, Arc::new(AuditHandler)))?;
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::dispatcher::StreamHandler;
use crate::error::StreamError;

/// One handler bound to a group, with the key its configuration lives under.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub config_key: String,
    pub group: String,
    /// Workers started when the configuration does not override the count.
    pub default_threads: usize,
    pub handler: Arc<dyn StreamHandler>,
}

impl HandlerDescriptor {
    pub fn new(
        config_key: impl Into<String>,
        group: impl Into<String>,
        default_threads: usize,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Self {
            config_key: config_key.into(),
            group: group.into(),
            default_threads,
            handler,
        }
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("config_key", &self.config_key)
            .field("group", &self.group)
            .field("default_threads", &self.default_threads)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// Registered handlers, in registration order.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    descriptors: Vec<HandlerDescriptor>,
    keys: HashSet<(String, String)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. Each `(group, config_key)` pair may be registered once.
    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<(), StreamError> {
        if descriptor.group.trim().is_empty() {
            return Err(StreamError::validation("handler group must not be blank"));
        }
        if descriptor.config_key.trim().is_empty() {
            return Err(StreamError::validation(format!(
                "handler for group '{}' has a blank config key",
                descriptor.group
            )));
        }

        let key = (descriptor.group.clone(), descriptor.config_key.clone());
        if !self.keys.insert(key) {
            return Err(StreamError::config(format!(
                "handler already registered for group '{}' with config key '{}'",
                descriptor.group, descriptor.config_key
            )));
        }

        debug!(
            group = %descriptor.group,
            config_key = %descriptor.config_key,
            handler = descriptor.handler.name(),
            "Registered stream handler"
        );
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, descriptor: HandlerDescriptor) -> Result<Self, StreamError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn descriptors(&self) -> &[HandlerDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
