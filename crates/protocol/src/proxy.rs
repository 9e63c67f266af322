//! Handles to protocol objects.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::schema::Interface;
use crate::wire::{Argument, ObjectId};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a [`crate::Connection`], used as the proxies' back-reference.
///
/// It only lets a connection recognise its own proxies; it never keeps a
/// connection alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A local stand-in for a protocol object.
///
/// Proxies are cheap to clone. The connection owns the object itself; a proxy
/// whose object has been destroyed is simply rejected when used.
#[derive(Clone)]
pub struct Proxy {
    id: ObjectId,
    interface: Arc<Interface>,
    version: u32,
    connection: ConnectionId,
    generation: u64,
}

impl Proxy {
    pub(crate) fn new(
        id: ObjectId,
        interface: Arc<Interface>,
        version: u32,
        connection: ConnectionId,
        generation: u64,
    ) -> Self {
        Self {
            id,
            interface,
            version,
            connection,
            generation,
        }
    }

    /// Which of the objects that have used this id the proxy refers to.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub fn interface(&self) -> &Arc<Interface> {
        &self.interface
    }

    /// Negotiated version of this object.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.connection == other.connection
            && self.generation == other.generation
    }
}

impl Eq for Proxy {}

impl Hash for Proxy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.connection.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} (v{})", self.interface.name(), self.id, self.version)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interface.name(), self.id)
    }
}

impl From<&Proxy> for Argument {
    fn from(proxy: &Proxy) -> Self {
        Argument::Object(proxy.id)
    }
}
