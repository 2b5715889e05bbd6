//! Domain event registry.
//!
//! Maps a wire event name to the Rust type its payload deserializes into and to
//! the key under which its handler is stored. The registry is filled once at
//! startup and only read afterwards.
//!
//! # Example
//!
//! ```
//! use event_puller_core::event::DomainEvent;
//! use event_puller_core::registry::EventRegistry;
//! # use serde::Deserialize;
//! # #[derive(Deserialize)]
//! # struct OrderPlaced;
//! # impl DomainEvent for OrderPlaced {
//! #     const EVENT_NAME: &'static str = "OrderPlaced.v1";
//! # }
//!
//! let mut registry = EventRegistry::new();
//! registry.register::<OrderPlaced>().unwrap();
//!
//! let entry = registry.lookup("OrderPlaced.v1").unwrap();
//! assert!(entry.target.is::<OrderPlaced>());
//! ```

use crate::event::DomainEvent;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors from registry operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The event name is already bound to another type
    #[error("Event '{event_name}' is already registered as {existing}, cannot register it as {requested}")]
    Conflict {
        /// The contested event name
        event_name: String,
        /// Type already registered
        existing: &'static str,
        /// Type that was being registered
        requested: &'static str,
    },
}

/// Descriptor of a deserialization target type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TargetType {
    id: TypeId,
    name: &'static str,
}

impl TargetType {
    /// Descriptor for `T`.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Rust type name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if this descriptor is for `T`.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Key under which a handler is stored in a
/// [`HandlerSet`](crate::handler::HandlerSet).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerKey(TypeId);

impl HandlerKey {
    /// Key of the handler for event type `E`.
    #[must_use]
    pub fn of<E: 'static>() -> Self {
        Self(TypeId::of::<E>())
    }
}

/// Binding of one event name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Wire event name.
    pub event_name: String,
    /// Payload target type.
    pub target: TargetType,
    /// Handler lookup key.
    pub handler_key: HandlerKey,
}

/// Event name → target type + handler key.
#[derive(Clone, Debug, Default)]
pub struct EventRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl EventRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under its own [`DomainEvent::EVENT_NAME`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the name is bound to another type.
    pub fn register<E: DomainEvent>(&mut self) -> Result<&RegistryEntry, RegistryError> {
        self.register_as::<E>(E::EVENT_NAME)
    }

    /// Register `E` under an explicit event name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the name is bound to another type.
    pub fn register_as<E: 'static>(
        &mut self,
        event_name: impl Into<String>,
    ) -> Result<&RegistryEntry, RegistryError> {
        self.register_with(event_name, TargetType::of::<E>(), HandlerKey::of::<E>())
    }

    /// Bind an event name to a target type and handler key.
    ///
    /// Registering the same name to the same target again is a no-op that
    /// returns the existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Conflict`] if the name is bound to another type.
    pub fn register_with(
        &mut self,
        event_name: impl Into<String>,
        target: TargetType,
        handler_key: HandlerKey,
    ) -> Result<&RegistryEntry, RegistryError> {
        let event_name = event_name.into();

        if let Some(existing) = self.entries.get(&event_name) {
            if existing.target != target {
                return Err(RegistryError::Conflict {
                    event_name,
                    existing: existing.target.name(),
                    requested: target.name(),
                });
            }
        }

        tracing::debug!(event_name = %event_name, target = %target, "Registered event type");

        Ok(self
            .entries
            .entry(event_name.clone())
            .or_insert(RegistryEntry {
                event_name,
                target,
                handler_key,
            }))
    }

    /// Look up the binding of an event name.
    #[must_use]
    pub fn lookup(&self, event_name: &str) -> Option<&RegistryEntry> {
        self.entries.get(event_name)
    }

    /// Number of registered event names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered event names, unordered.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
