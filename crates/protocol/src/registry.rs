//! Object map and id allocation.
//!
//! The id space is split at [`SERVER_ID_START`]: the client allocates from
//! `1..SERVER_ID_START`, the server from `SERVER_ID_START..=u32::MAX`. Each side
//! allocates only from its own range and registers the peer's ids as they are
//! announced by `new_id` arguments. Id 0 is never allocated nor registered.
//!
//! A client never forgets an object it destroyed until the id can no longer
//! be addressed by the server: its own ids stay as zombies until
//! `wl_display.delete_id`, server ids stay as tombstones until the server
//! announces a new object under the same id.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::connection::Listener;
use crate::error::Error;
use crate::proxy::{ConnectionId, Proxy};
use crate::schema::{Direction, Interface};
use crate::wire::{ObjectId, SERVER_ID_START};

/// Which end of the connection this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn id_range(self) -> (u32, u32) {
        match self {
            Side::Client => (1, SERVER_ID_START - 1),
            Side::Server => (SERVER_ID_START, u32::MAX),
        }
    }

    /// Whether ids like `id` are allocated by this side.
    #[must_use]
    pub fn owns(self, id: ObjectId) -> bool {
        let (first, last) = self.id_range();
        (first..=last).contains(&id.raw())
    }

    /// Message table used for what this side sends.
    #[must_use]
    pub fn outgoing(self) -> Direction {
        match self {
            Side::Client => Direction::Request,
            Side::Server => Direction::Event,
        }
    }

    /// Message table used for what this side receives.
    #[must_use]
    pub fn incoming(self) -> Direction {
        match self {
            Side::Client => Direction::Event,
            Side::Server => Direction::Request,
        }
    }
}

/// Allocator for one side's id range.
///
/// Freed ids are handed out again lowest first before the high-water mark
/// advances.
#[derive(Debug)]
pub struct IdAllocator {
    last: u32,
    next: u64,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    #[must_use]
    pub fn new(side: Side) -> Self {
        let (first, last) = side.id_range();
        Self::with_range(first, last)
    }

    fn with_range(first: u32, last: u32) -> Self {
        Self {
            last,
            next: u64::from(first),
            free: BTreeSet::new(),
        }
    }

    /// Next id to use, or `None` once the range is exhausted.
    pub fn allocate(&mut self) -> Option<ObjectId> {
        if let Some(id) = self.free.pop_first() {
            return Some(ObjectId::new(id));
        }
        if self.next > u64::from(self.last) {
            return None;
        }
        let id = self.next as u32;
        self.next += 1;
        Some(ObjectId::new(id))
    }

    /// Make `id` available again. Ids never handed out are ignored.
    pub fn release(&mut self, id: ObjectId) {
        if u64::from(id.raw()) < self.next {
            self.free.insert(id.raw());
        }
    }

    #[must_use]
    pub fn is_free(&self, id: ObjectId) -> bool {
        self.free.contains(&id.raw()) || u64::from(id.raw()) >= self.next
    }
}

/// Queue of freshly created objects until told otherwise.
pub(crate) const DEFAULT_QUEUE: u64 = 0;

/// One live object, or a destroyed one the peer may still address.
pub(crate) struct ObjectEntry {
    pub proxy: Proxy,
    /// Destroyed locally; messages for it are decoded and dropped.
    pub destroyed: bool,
    /// The peer released the id while messages for the object were still
    /// queued; the entry goes as soon as it is destroyed or drained.
    pub id_deleted: bool,
    /// Event queue its incoming messages are put on.
    pub queue: u64,
    /// Distinguishes successive objects that reuse one id.
    pub generation: u64,
    /// Bumped whenever the listener table is changed from outside dispatch.
    pub listener_epoch: u64,
    pub listeners: HashMap<u16, Listener>,
}

/// Map from id to object for one connection, plus its allocator.
pub(crate) struct ObjectRegistry {
    side: Side,
    connection: ConnectionId,
    objects: HashMap<u32, ObjectEntry>,
    allocator: IdAllocator,
    generation: u64,
}

impl ObjectRegistry {
    pub fn new(side: Side, connection: ConnectionId) -> Self {
        Self {
            side,
            connection,
            objects: HashMap::new(),
            allocator: IdAllocator::new(side),
            generation: 0,
        }
    }

    fn insert(&mut self, id: ObjectId, interface: Arc<Interface>, version: u32) -> Proxy {
        self.generation += 1;
        let proxy = Proxy::new(id, interface, version, self.connection, self.generation);
        self.objects.insert(
            id.raw(),
            ObjectEntry {
                proxy: proxy.clone(),
                destroyed: false,
                id_deleted: false,
                queue: DEFAULT_QUEUE,
                generation: self.generation,
                listener_epoch: 0,
                listeners: HashMap::new(),
            },
        );
        proxy
    }

    /// Allocate a local id and register a new object under it.
    pub fn create(&mut self, interface: Arc<Interface>, version: u32) -> Result<Proxy, Error> {
        let id = self.allocator.allocate().ok_or(Error::IdsExhausted)?;
        debug_assert!(!self.objects.contains_key(&id.raw()));
        Ok(self.insert(id, interface, version))
    }

    /// Register an object the peer created.
    ///
    /// A tombstone left under `id` is replaced: the peer only reuses an id
    /// once it is done with the old object.
    pub fn register_peer(
        &mut self,
        id: ObjectId,
        interface: Arc<Interface>,
        version: u32,
    ) -> Result<Proxy, Error> {
        let taken = self.get(id).is_some_and(|e| !e.destroyed);
        if id.is_null() || self.side.owns(id) || taken {
            return Err(Error::InvalidNewId { id });
        }
        Ok(self.insert(id, interface, version))
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(&id.raw())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectEntry> {
        self.objects.get_mut(&id.raw())
    }

    /// A live (not destroyed) object.
    pub fn live(&self, id: ObjectId) -> Option<&Proxy> {
        self.get(id).filter(|e| !e.destroyed).map(|e| &e.proxy)
    }

    /// Handle a local destroy.
    ///
    /// A client keeps the entry, since events the server sent before it saw
    /// the destroy may still arrive: own ids wait for `delete_id`, server ids
    /// for reuse by [`ObjectRegistry::register_peer`]. A server removes at
    /// once.
    pub fn destroy(&mut self, id: ObjectId) {
        let Some(entry) = self.objects.get_mut(&id.raw()) else {
            return;
        };
        if self.side == Side::Client && !entry.id_deleted {
            entry.destroyed = true;
            entry.listeners.clear();
        } else {
            self.remove(id);
        }
    }

    /// Remove an object and free its id if it is ours to reuse.
    ///
    /// Returns `false` if nothing was registered under `id`.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let existed = self.objects.remove(&id.raw()).is_some();
        if existed && self.side.owns(id) {
            self.allocator.release(id);
        }
        existed
    }

    /// Drop every object, e.g. when the connection fails.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Move every object on `queue` back to the default queue.
    pub fn reset_queue(&mut self, queue: u64) {
        for entry in self.objects.values_mut().filter(|e| e.queue == queue) {
            entry.queue = DEFAULT_QUEUE;
        }
    }

    #[cfg(test)]
    fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id.raw())
    }
}
