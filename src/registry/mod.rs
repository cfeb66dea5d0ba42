//! The Type Registry.
//!
//! The only place that knows the mapping from wire identifiers — a
//! [`GroupKind`] — to a constructible, typed [`Payload`]. Decoders consult
//! it; encoders only need it to round-trip a `dyn Payload` back through
//! `serde_json`, since the concrete type is already known to the caller
//! at encode time.
//!
//! Registration happens once at startup; after that the registry is
//! read-mostly and safe to share behind an `Arc` across every worker.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::envelope::{GroupKind, Payload, RegisteredPayload};

/// Errors raised by registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unregistered kind: {0}")]
    UnregisteredKind(GroupKind),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

struct Entry {
    make: Box<dyn Fn() -> Box<dyn Payload> + Send + Sync>,
    decode: Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Payload>, RegistryError> + Send + Sync>,
    encode: Box<dyn Fn(&dyn Payload) -> Result<serde_json::Value, RegistryError> + Send + Sync>,
}

/// Maps `(group, kind)` to a factory that yields a fresh payload value.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    entries: Arc<std::sync::RwLock<HashMap<GroupKind, Entry>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `group`, deriving its `Kind` from the type's own
    /// metadata (`T::type_group_kind().kind`). Re-registering the same
    /// `(group, kind)` is idempotent: the later registration simply
    /// replaces the factory for the same key.
    pub fn register<T: RegisteredPayload>(&self, group: impl Into<String>) {
        let group = group.into();
        let key = GroupKind::new(group, T::type_group_kind().kind);

        let make = Box::new(|| Box::new(T::default()) as Box<dyn Payload>);
        let decode = Box::new(|value: &serde_json::Value| {
            serde_json::from_value::<T>(value.clone())
                .map(|v| Box::new(v) as Box<dyn Payload>)
                .map_err(|e| RegistryError::MalformedEnvelope(e.to_string()))
        });
        let encode = Box::new(|payload: &dyn Payload| {
            let concrete = payload
                .as_any()
                .downcast_ref::<T>()
                .expect("encode called with mismatched concrete type for this GroupKind");
            serde_json::to_value(concrete)
                .map_err(|e| RegistryError::MalformedEnvelope(e.to_string()))
        });

        self.entries.write().unwrap().insert(
            key,
            Entry {
                make,
                decode,
                encode,
            },
        );
    }

    /// Returns a freshly constructed, zeroed payload for `key`.
    pub fn load(&self, key: &GroupKind) -> Result<Box<dyn Payload>, RegistryError> {
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        Ok((entry.make)())
    }

    /// Decodes a wire body into a fresh, typed payload for `key`.
    ///
    /// Fails with [`RegistryError::UnregisteredKind`] if `key` is
    /// unregistered, or [`RegistryError::MalformedEnvelope`] if the body
    /// doesn't deserialize into the registered type.
    pub fn decode(
        &self,
        key: &GroupKind,
        body: &serde_json::Value,
    ) -> Result<Box<dyn Payload>, RegistryError> {
        if key.is_empty_kind() {
            return Err(RegistryError::UnregisteredKind(key.clone()));
        }
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        (entry.decode)(body)
    }

    /// Encodes a payload back to a wire body using its own `group_kind`.
    pub fn encode(&self, payload: &dyn Payload) -> Result<serde_json::Value, RegistryError> {
        let key = payload.group_kind();
        let entries = self.entries.read().unwrap();
        let entry = entries
            .get(&key)
            .ok_or_else(|| RegistryError::UnregisteredKind(key.clone()))?;
        (entry.encode)(payload)
    }

    /// Returns the `(group, kind)` of a value; payloads embed their own
    /// metadata so encoders can stamp it before serialization.
    pub fn metadata(&self, payload: &dyn Payload) -> GroupKind {
        payload.group_kind()
    }

    pub fn is_registered(&self, key: &GroupKind) -> bool {
        self.entries.read().unwrap().contains_key(key)
    }
}

/// Convenience downcast for callers that know the concrete type they asked
/// the registry to decode.
pub fn downcast<T: Payload>(payload: &dyn Payload) -> Option<&T> {
    (payload as &dyn Any).downcast_ref::<T>()
}
