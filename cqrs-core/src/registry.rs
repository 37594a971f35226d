//! Process-wide registry mapping a message type name to the function that
//! decodes its wire bytes back into a concrete, type-erased value.
//!
//! The durable queue and the event store both move messages as `(type name,
//! bytes)` pairs rather than concrete Rust types — a consumer only knows it
//! received `"OrderPlaced.v1"`, and needs somewhere to look up how to turn
//! those bytes back into an `OrderPlaced` it can hand to a handler. This
//! mirrors the reference implementation's package-level `messageMap`,
//! populated once at startup before the bus is built.

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised while registering or looking up message factories.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No factory was registered under this type name.
    #[error("no message type registered for {0}")]
    UnknownType(String),

    /// A factory is already registered under this type name.
    #[error("message type {0} is already registered")]
    AlreadyRegistered(String),

    /// The registered factory failed to decode the given bytes.
    #[error("failed to decode {type_name}: {reason}")]
    DecodeFailed {
        /// The type name the factory was registered under.
        type_name: String,
        /// The underlying decode error.
        reason: String,
    },

    /// The registered encoder failed to encode the given value.
    #[error("failed to encode {type_name}: {reason}")]
    EncodeFailed {
        /// The type name the encoder was registered under.
        type_name: String,
        /// The underlying encode error.
        reason: String,
    },
}

/// Decodes wire bytes into a type-erased, `Send + Sync` value.
pub type MessageFactory =
    fn(&[u8]) -> Result<Box<dyn Any + Send + Sync>, Box<dyn std::error::Error + Send + Sync>>;

/// Encodes a type-erased value back to wire bytes.
///
/// Registered alongside a [`MessageFactory`] for message types (commands,
/// mainly) that need to round-trip through the durable queue: the bus holds
/// only `Box<dyn Any + Send + Sync>` once a command has been routed, so
/// serializing it for async dispatch needs this same name-keyed indirection
/// rather than a generic `Serialize` bound on the `Command` trait itself,
/// which would make `Command` non-object-safe.
pub type MessageEncoder =
    fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;

/// A process-wide, thread-safe registry of message factories keyed by type name.
///
/// Registration happens once at startup, before the bus starts routing
/// traffic — typically from each module's `register()` hook. Lookups happen
/// on every message the queue or event store delivers.
pub struct MessageRegistry {
    factories: RwLock<HashMap<&'static str, MessageFactory>>,
    encoders: RwLock<HashMap<&'static str, MessageEncoder>>,
}

impl MessageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            encoders: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory for `type_name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if `type_name` already has a factory.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned, which only happens if a
    /// prior registration panicked while holding it.
    pub fn register(
        &self,
        type_name: &'static str,
        factory: MessageFactory,
    ) -> Result<(), RegistryError> {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        if factories.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name.to_string()));
        }
        factories.insert(type_name, factory);
        Ok(())
    }

    /// Register an encoder for `type_name`, in addition to its factory.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if `type_name` already has an encoder.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn register_encoder(
        &self,
        type_name: &'static str,
        encoder: MessageEncoder,
    ) -> Result<(), RegistryError> {
        let mut encoders = self.encoders.write().unwrap_or_else(|e| e.into_inner());
        if encoders.contains_key(type_name) {
            return Err(RegistryError::AlreadyRegistered(type_name.to_string()));
        }
        encoders.insert(type_name, encoder);
        Ok(())
    }

    /// Encode `value` using the encoder registered for `type_name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownType`] if nothing is registered, or
    /// [`RegistryError::EncodeFailed`] if the encoder itself errors.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn encode(
        &self,
        type_name: &str,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, RegistryError> {
        let encoders = self.encoders.read().unwrap_or_else(|e| e.into_inner());
        let encoder = encoders
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;
        encoder(value).map_err(|e| RegistryError::EncodeFailed {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode `bytes` using the factory registered for `type_name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownType`] if nothing is registered, or
    /// [`RegistryError::DecodeFailed`] if the factory itself errors.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn decode(
        &self,
        type_name: &str,
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send + Sync>, RegistryError> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let factory = factories
            .get(type_name)
            .ok_or_else(|| RegistryError::UnknownType(type_name.to_string()))?;
        factory(bytes).map_err(|e| RegistryError::DecodeFailed {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether a factory is registered under `type_name`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(type_name)
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Counter(i32);

    fn decode_counter(
        bytes: &[u8],
    ) -> Result<Box<dyn Any + Send + Sync>, Box<dyn std::error::Error + Send + Sync>> {
        let value: i32 = bincode::deserialize(bytes)?;
        Ok(Box::new(Counter(value)))
    }

    #[test]
    fn register_then_decode_round_trips() {
        let registry = MessageRegistry::new();
        registry.register("Counter.v1", decode_counter).expect("register should succeed");

        let bytes = bincode::serialize(&42_i32).expect("serialize should succeed");
        let decoded = registry.decode("Counter.v1", &bytes).expect("decode should succeed");
        let counter = decoded.downcast_ref::<Counter>().expect("downcast should succeed");
        assert_eq!(*counter, Counter(42));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = MessageRegistry::new();
        registry.register("Counter.v1", decode_counter).expect("first register should succeed");
        let result = registry.register("Counter.v1", decode_counter);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn unknown_type_lookup_fails() {
        let registry = MessageRegistry::new();
        let result = registry.decode("Nope.v1", &[]);
        assert!(matches!(result, Err(RegistryError::UnknownType(_))));
    }

    #[test]
    fn contains_reflects_registration() {
        let registry = MessageRegistry::new();
        assert!(!registry.contains("Counter.v1"));
        registry.register("Counter.v1", decode_counter).expect("register should succeed");
        assert!(registry.contains("Counter.v1"));
    }

    fn encode_counter(
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> {
        let counter = value.downcast_ref::<Counter>().ok_or("not a Counter")?;
        Ok(bincode::serialize(&counter.0)?)
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let registry = MessageRegistry::new();
        registry.register("Counter.v1", decode_counter).expect("register should succeed");
        registry.register_encoder("Counter.v1", encode_counter).expect("register should succeed");

        let bytes = registry.encode("Counter.v1", &Counter(7)).expect("encode should succeed");
        let decoded = registry.decode("Counter.v1", &bytes).expect("decode should succeed");
        assert_eq!(*decoded.downcast_ref::<Counter>().expect("downcast should succeed"), Counter(7));
    }

    #[test]
    fn duplicate_encoder_registration_is_rejected() {
        let registry = MessageRegistry::new();
        registry.register_encoder("Counter.v1", encode_counter).expect("first register should succeed");
        let result = registry.register_encoder("Counter.v1", encode_counter);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }
}
