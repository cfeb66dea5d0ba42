//! The typed message and its envelope.
//!
//! An [`Envelope`] is an immutable record carrying a payload plus UID,
//! origin, and case-insensitive headers. [`Outbound`] is the message shape
//! a saga or projector constructs when it wants to emit something; the
//! [`crate::router::EndpointRouter`] and [`crate::transport::Transport`]
//! turn it into wire bytes.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The header key carrying the saga instance identity.
///
/// Authoritative for routing an incoming envelope to a saga instance
/// (see `SagaEventsHandler::handle`).
pub const SAGA_UID_HEADER: &str = "saga_uid";

/// The header key carrying the MIME-ish content type of the payload.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Two-part wire-level discriminator for a payload type.
///
/// `Group` is the namespace (e.g. a bounded context or subsystem);
/// `Kind` is the payload's structural name within that group. The pair
/// is the only thing [`crate::registry::TypeRegistry`] needs to find or
/// construct a concrete payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    /// True for the malformed case the decode path must reject.
    pub fn is_empty_kind(&self) -> bool {
        self.kind.is_empty()
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.kind)
    }
}

/// Case-insensitive header map.
///
/// Keys are normalized to lowercase on insert and lookup so that
/// `headers.get("Saga_UID")` and `headers.get("saga_uid")` are
/// equivalent, matching the header semantics of common AMQP/HTTP
/// transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&Self::normalize(key)).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(Self::normalize(key.as_ref()), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(&Self::normalize(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a copy of `self` with `key` overwritten, the way the saga
    /// handler stamps `saga_uid` onto an outgoing message derived from an
    /// incoming one.
    pub fn with_override(&self, key: &str, value: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.insert(key, value);
        copy
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        let mut headers = Self::new();
        for (k, v) in map {
            headers.insert(k, v);
        }
        headers
    }
}

/// Any payload value identifiable by a [`GroupKind`].
///
/// Payloads are self-describing: `group_kind` reports the identity the
/// registry will stamp onto the wire. `as_any` exists only so the
/// registry's erased encode/decode machinery can downcast back to the
/// concrete type; saga and handler code never needs to touch it.
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    fn group_kind(&self) -> GroupKind;
    fn as_any(&self) -> &dyn Any;
}

/// A payload type that can be registered with the [`crate::registry::TypeRegistry`].
///
/// `type_group_kind` is a associated-function (no `self`) deliberately:
/// the registry needs the identity of a *type*, not an instance, to build
/// its decode table. This is the "factory, not reflection" reformulation
/// called for by the design notes.
pub trait RegisteredPayload:
    Payload + Default + Clone + Serialize + for<'de> Deserialize<'de> + 'static
{
    fn type_group_kind() -> GroupKind;
}

/// An immutable message received from or destined for the transport.
#[derive(Debug, Clone)]
pub struct Envelope {
    uid: String,
    origin: String,
    headers: Headers,
    group_kind: GroupKind,
    body: serde_json::Value,
}

impl Envelope {
    pub fn new(
        uid: impl Into<String>,
        origin: impl Into<String>,
        headers: Headers,
        group_kind: GroupKind,
        body: serde_json::Value,
    ) -> Self {
        Self {
            uid: uid.into(),
            origin: origin.into(),
            headers,
            group_kind,
            body,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn group_kind(&self) -> &GroupKind {
        &self.group_kind
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// The `saga_uid` header, if present and non-empty.
    pub fn saga_uid(&self) -> Option<&str> {
        self.headers.get(SAGA_UID_HEADER).filter(|s| !s.is_empty())
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Per-delivery options a saga can attach when emitting an [`Outbound`]
/// message, e.g. a delay before the transport makes it visible to
/// consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOptions {
    pub delay: Option<std::time::Duration>,
    pub mandatory: bool,
    pub immediate: bool,
}

impl DeliveryOptions {
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Sets `immediate` only. `Mandatory` and `Immediate` are independent
    /// flags — a prior implementation conflated them, which was a bug
    /// (see REDESIGN FLAGS); this keeps them orthogonal.
    pub fn with_immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}

/// A message a saga (or any producer) wishes to emit during one turn.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub group_kind: GroupKind,
    pub body: serde_json::Value,
    pub headers: Headers,
    pub options: DeliveryOptions,
}

impl Outbound {
    pub fn new(group_kind: GroupKind, body: serde_json::Value) -> Self {
        Self {
            group_kind,
            body,
            headers: Headers::new(),
            options: DeliveryOptions::default(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_options(mut self, options: DeliveryOptions) -> Self {
        self.options = options;
        self
    }
}
