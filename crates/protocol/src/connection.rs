//! The dispatch engine: one [`Connection`] per connected peer.
//!
//! A connection owns its transport and its object registry. It never blocks
//! or spawns anything on its own; the caller decides when to [`flush`] and when
//! to [`process`] input, using [`Connection::interest`] and the socket
//! descriptor (`AsFd`) to plug it into whatever loop it runs.
//!
//! Incoming frames are decoded as soon as they are read and put on the event
//! queue of the object they address. Listeners run when that queue is
//! dispatched: [`Connection::process`] and [`Connection::dispatch_pending`]
//! serve the default queue, [`Connection::dispatch_queue`] any other.
//!
//! [`flush`]: Connection::flush
//! [`process`]: Connection::process

use bitflags::bitflags;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, trace, warn};

use crate::core_interfaces::{WL_DISPLAY, display};
use crate::error::{Error, ProtocolError};
use crate::proxy::{ConnectionId, Proxy};
use crate::registry::{DEFAULT_QUEUE, ObjectRegistry, Side};
use crate::schema::{ArgKind, Direction, Interface, MessageSpec, Protocol};
use crate::socket;
use crate::transport::{Frame, Transport};
use crate::wire::{
    Argument, EncodeError, HEADER_SIZE, MAX_FDS_OUT, MAX_MESSAGE_SIZE, MessageHeader, ObjectId,
    decode_args, encode_args,
};

/// Callback invoked for one incoming message on one object.
pub type Listener = Box<dyn FnMut(&mut Connection, Message) + Send>;

bitflags! {
    /// What a connection is waiting for on its socket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// Handle to one event queue of a connection.
///
/// Each object's incoming messages go to one queue: the default queue unless
/// [`Connection::set_queue`] moved it. Objects created through an object start
/// on that object's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventQueue {
    connection: ConnectionId,
    id: u64,
}

impl EventQueue {
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_QUEUE
    }
}

/// A decoded incoming message, as handed to a listener.
#[derive(Debug)]
pub struct Message {
    sender: Proxy,
    opcode: u16,
    direction: Direction,
    args: Vec<Argument>,
    /// Objects behind `object` and `new_id` arguments, by slot.
    proxies: Vec<Option<Proxy>>,
}

/// A message waiting on its queue, tied to the object it was read for.
struct Queued {
    message: Message,
    generation: u64,
}

impl Message {
    /// The object the message was sent on.
    #[must_use]
    pub fn sender(&self) -> &Proxy {
        &self.sender
    }

    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    #[must_use]
    pub fn spec(&self) -> Option<&MessageSpec> {
        self.sender.interface().message(self.direction, self.opcode)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.spec().map_or("", |spec| spec.name.as_str())
    }

    /// Arguments in signature order.
    #[must_use]
    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    /// Take ownership of the arguments, descriptors included.
    #[must_use]
    pub fn into_args(self) -> Vec<Argument> {
        self.args
    }

    fn slot(&self, name: &str) -> Option<usize> {
        self.spec()?.args.iter().position(|a| a.name == name)
    }

    /// Argument by its schema name.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Argument> {
        self.args.get(self.slot(name)?)
    }

    #[must_use]
    pub fn int(&self, name: &str) -> Option<i32> {
        match self.arg(name)? {
            Argument::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn uint(&self, name: &str) -> Option<u32> {
        match self.arg(name)? {
            Argument::Uint(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.arg(name)? {
            Argument::Str(v) => v.as_deref(),
            _ => None,
        }
    }

    /// Id carried by an `object` or `new_id` argument.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<ObjectId> {
        match self.arg(name)? {
            Argument::Object(id) => Some(*id),
            Argument::NewId(new_id) => Some(new_id.id),
            _ => None,
        }
    }

    /// Object behind an `object` or `new_id` argument, resolved when the
    /// message was read. `None` for a null reference, including one to an
    /// object destroyed on this side.
    #[must_use]
    pub fn proxy(&self, name: &str) -> Option<&Proxy> {
        self.proxies.get(self.slot(name)?)?.as_ref()
    }

    #[must_use]
    pub fn fd(&self, name: &str) -> Option<BorrowedFd<'_>> {
        match self.arg(name)? {
            Argument::Fd(fd) => Some(fd.as_fd()),
            _ => None,
        }
    }
}

/// One end of a protocol connection.
pub struct Connection {
    id: ConnectionId,
    side: Side,
    protocol: Arc<Protocol>,
    transport: Transport,
    registry: ObjectRegistry,
    display: Proxy,
    queues: HashMap<u64, VecDeque<Queued>>,
    next_queue: u64,
    failure: Option<Arc<Error>>,
}

impl Connection {
    /// Wrap a connected socket.
    ///
    /// `protocol` must contain `wl_display` and every interface its messages
    /// refer to. The display object (id 1) exists on both sides from the
    /// start.
    pub fn new(
        stream: UnixStream,
        protocol: impl Into<Arc<Protocol>>,
        side: Side,
    ) -> Result<Self, Error> {
        let protocol = protocol.into();
        protocol.validate()?;
        let display = protocol
            .interface(WL_DISPLAY)
            .cloned()
            .ok_or_else(|| Error::UnknownInterface(WL_DISPLAY.to_string()))?;

        let id = ConnectionId::next();
        let transport = Transport::new(stream)?;
        let mut registry = ObjectRegistry::new(side, id);
        let display = match side {
            Side::Client => registry.create(display, 1)?,
            Side::Server => registry.register_peer(ObjectId::DISPLAY, display, 1)?,
        };
        debug_assert_eq!(display.id(), ObjectId::DISPLAY);
        debug!(side = ?side, protocol = protocol.name(), "connection created");

        Ok(Self {
            id,
            side,
            protocol,
            transport,
            registry,
            display,
            queues: HashMap::from([(DEFAULT_QUEUE, VecDeque::new())]),
            next_queue: DEFAULT_QUEUE,
            failure: None,
        })
    }

    /// Connect to the compositor named by the environment.
    pub fn connect_to_env(protocol: impl Into<Arc<Protocol>>) -> Result<Self, Error> {
        let stream = socket::connect_to_env()?;
        Self::new(stream, protocol, Side::Client)
    }

    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// The `wl_display` singleton.
    #[must_use]
    pub fn display(&self) -> &Proxy {
        &self.display
    }

    /// A live object by id.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> Option<Proxy> {
        self.registry.live(id).cloned()
    }

    /// Number of registered objects, including destroyed ones the peer may
    /// still address.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// The error that ended the connection.
    #[must_use]
    pub fn fatal_error(&self) -> Option<&Error> {
        self.failure.as_deref()
    }

    /// The peer's fatal error, if that is what ended the connection.
    #[must_use]
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        self.fatal_error().and_then(Error::protocol_error)
    }

    /// Readiness the caller should wait for before the next step.
    #[must_use]
    pub fn interest(&self) -> Interest {
        if self.is_failed() {
            return Interest::empty();
        }
        let mut interest = Interest::READABLE;
        if self.transport.has_pending_output() {
            interest |= Interest::WRITABLE;
        }
        interest
    }

    fn ensure_live(&self) -> Result<(), Error> {
        match &self.failure {
            Some(err) => Err(Error::ConnectionFailed(err.clone())),
            None => Ok(()),
        }
    }

    /// Move to the failed state. Every object is dropped.
    fn fail(&mut self, err: Error) -> Error {
        error!(side = ?self.side, "connection failed: {err}");
        let err = Arc::new(err);
        self.failure = Some(err.clone());
        self.registry.clear();
        self.queues.values_mut().for_each(VecDeque::clear);
        Error::ConnectionFailed(err)
    }

    fn check_proxy(&self, proxy: &Proxy) -> Result<(), Error> {
        self.ensure_live()?;
        if proxy.connection() != self.id {
            return Err(Error::ForeignProxy { object: proxy.id() });
        }
        match self.registry.get(proxy.id()) {
            Some(entry) if !entry.destroyed && entry.generation == proxy.generation() => Ok(()),
            _ => Err(Error::NotLive { object: proxy.id() }),
        }
    }

    fn interface(&self, name: &str) -> Result<Arc<Interface>, Error> {
        self.protocol
            .interface(name)
            .cloned()
            .ok_or_else(|| Error::UnknownInterface(name.to_string()))
    }

    /// Send a request by name. Client side only.
    ///
    /// `new_id` slots take [`Argument::new_id`] or [`Argument::new_dynamic`]
    /// placeholders; the objects created for them are returned in signature
    /// order, already registered.
    pub fn send_request(
        &mut self,
        proxy: &Proxy,
        name: &str,
        args: Vec<Argument>,
    ) -> Result<Vec<Proxy>, Error> {
        if self.side != Side::Client {
            return Err(Error::WrongSide {
                operation: "send_request",
            });
        }
        self.send_message(proxy, name, args)
    }

    /// Send an event by name. Server side only.
    pub fn send_event(
        &mut self,
        proxy: &Proxy,
        name: &str,
        args: Vec<Argument>,
    ) -> Result<Vec<Proxy>, Error> {
        if self.side != Side::Server {
            return Err(Error::WrongSide {
                operation: "send_event",
            });
        }
        self.send_message(proxy, name, args)
    }

    fn send_message(
        &mut self,
        proxy: &Proxy,
        name: &str,
        mut args: Vec<Argument>,
    ) -> Result<Vec<Proxy>, Error> {
        self.check_proxy(proxy)?;
        let interface = proxy.interface().clone();
        let no_such_message = || Error::NoSuchMessage {
            interface: interface.name().to_string(),
            name: name.to_string(),
        };
        let direction = self.side.outgoing();
        let opcode = interface
            .opcode(direction, name)
            .ok_or_else(no_such_message)?;
        let spec = interface
            .message(direction, opcode)
            .ok_or_else(no_such_message)?;

        if spec.since > proxy.version() {
            return Err(Error::VersionTooLow {
                interface: interface.name().to_string(),
                message: spec.name.clone(),
                since: spec.since,
                version: proxy.version(),
            });
        }
        if args.len() != spec.args.len() {
            return Err(Error::Encode {
                interface: interface.name().to_string(),
                message: spec.name.clone(),
                source: EncodeError::ArgumentCount {
                    expected: spec.args.len(),
                    found: args.len(),
                },
            });
        }

        // Validate before anything is allocated so failures have no effect
        let mut to_create = Vec::new();
        for (index, (slot, arg)) in spec.args.iter().zip(&args).enumerate() {
            match (slot.kind, arg) {
                (ArgKind::Object, Argument::Object(id)) if !id.is_null() => {
                    let target = self
                        .registry
                        .live(*id)
                        .ok_or(Error::UnknownArgumentObject { id: *id })?;
                    if let Some(expected) = &slot.interface {
                        if target.interface().name() != expected {
                            return Err(Error::WrongInterface {
                                arg: slot.name.clone(),
                                expected: expected.clone(),
                                found: target.interface().name().to_string(),
                            });
                        }
                    }
                }
                (ArgKind::NewId, Argument::NewId(new_id)) => {
                    let (target, version) = match (&slot.interface, &new_id.dynamic) {
                        (Some(target), _) => (self.interface(target)?, proxy.version()),
                        (None, Some((target, version))) => {
                            let target = self.interface(target)?;
                            if *version == 0 || *version > target.version() {
                                return Err(Error::VersionUnsupported {
                                    interface: target.name().to_string(),
                                    requested: *version,
                                    supported: target.version(),
                                });
                            }
                            (target, *version)
                        }
                        (None, None) => {
                            return Err(Error::Encode {
                                interface: interface.name().to_string(),
                                message: spec.name.clone(),
                                source: EncodeError::MissingInterface {
                                    arg: slot.name.clone(),
                                },
                            });
                        }
                    };
                    to_create.push((index, target, version));
                }
                // Kind mismatches are reported by the encoder
                _ => {}
            }
        }

        let queue = self
            .registry
            .get(proxy.id())
            .map_or(DEFAULT_QUEUE, |entry| entry.queue);
        let mut created: Vec<Proxy> = Vec::with_capacity(to_create.len());
        for (index, target, version) in to_create {
            match self.registry.create(target, version) {
                Ok(new) => {
                    if let Some(entry) = self.registry.get_mut(new.id()) {
                        entry.queue = queue;
                    }
                    if let Argument::NewId(new_id) = &mut args[index] {
                        new_id.id = new.id();
                    }
                    created.push(new);
                }
                Err(err) => {
                    self.rollback(&created);
                    return Err(err);
                }
            }
        }

        if let Err(source) = self.queue_message(proxy.id(), opcode, spec, args) {
            self.rollback(&created);
            return Err(Error::Encode {
                interface: interface.name().to_string(),
                message: spec.name.clone(),
                source,
            });
        }
        debug!(object = %proxy, message = %spec.name, "sent");

        if spec.destructor {
            self.release(proxy.id())?;
        }
        self.flush()?;
        Ok(created)
    }

    fn rollback(&mut self, created: &[Proxy]) {
        for proxy in created {
            self.registry.remove(proxy.id());
        }
    }

    /// Encode a message and put it on the outgoing queue.
    fn queue_message(
        &mut self,
        object: ObjectId,
        opcode: u16,
        spec: &MessageSpec,
        args: Vec<Argument>,
    ) -> Result<(), EncodeError> {
        let mut payload = Vec::new();
        let mut fds = VecDeque::new();
        encode_args(&spec.args, args, &mut payload, &mut fds)?;
        let size = HEADER_SIZE + payload.len();
        if size > MAX_MESSAGE_SIZE {
            return Err(EncodeError::TooLarge { size });
        }
        if fds.len() > MAX_FDS_OUT {
            return Err(EncodeError::TooManyFds { count: fds.len() });
        }
        self.transport.queue(
            MessageHeader {
                object,
                opcode,
                size,
            },
            &payload,
            Vec::from(fds),
        );
        Ok(())
    }

    /// Drop an object after a destructor message went either way.
    ///
    /// A server tells the client it may reuse an id it allocated.
    fn release(&mut self, id: ObjectId) -> Result<(), Error> {
        self.registry.destroy(id);
        if self.side == Side::Server && Side::Client.owns(id) {
            let display = self.display.clone();
            self.send_message(&display, "delete_id", vec![Argument::Uint(id.raw())])?;
        }
        Ok(())
    }

    /// Register `listener` for the incoming message `name` on `proxy`,
    /// replacing any previous one.
    pub fn set_listener<F>(&mut self, proxy: &Proxy, name: &str, listener: F) -> Result<(), Error>
    where
        F: FnMut(&mut Connection, Message) + Send + 'static,
    {
        let opcode = self.incoming_opcode(proxy, name)?;
        if let Some(entry) = self.registry.get_mut(proxy.id()) {
            entry.listener_epoch += 1;
            entry.listeners.insert(opcode, Box::new(listener));
        }
        Ok(())
    }

    /// Remove the listener for `name` on `proxy`. Returns whether one was set.
    pub fn remove_listener(&mut self, proxy: &Proxy, name: &str) -> Result<bool, Error> {
        let opcode = self.incoming_opcode(proxy, name)?;
        Ok(self
            .registry
            .get_mut(proxy.id())
            .map(|entry| {
                entry.listener_epoch += 1;
                entry.listeners.remove(&opcode).is_some()
            })
            .unwrap_or(false))
    }

    fn incoming_opcode(&self, proxy: &Proxy, name: &str) -> Result<u16, Error> {
        self.check_proxy(proxy)?;
        proxy
            .interface()
            .opcode(self.side.incoming(), name)
            .ok_or_else(|| Error::NoSuchMessage {
                interface: proxy.interface().name().to_string(),
                name: name.to_string(),
            })
    }

    /// Write as much queued output as the socket takes without blocking.
    ///
    /// Returns `true` once the queue is empty.
    pub fn flush(&mut self) -> Result<bool, Error> {
        self.ensure_live()?;
        match self.transport.flush() {
            Ok(done) => Ok(done),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Read available input and dispatch the default queue.
    ///
    /// Never blocks. Returns the number of messages dispatched; messages for
    /// other queues are read and held for [`Connection::dispatch_queue`].
    pub fn process(&mut self) -> Result<usize, Error> {
        self.process_queue(DEFAULT_QUEUE)
    }

    fn process_queue(&mut self, queue: u64) -> Result<usize, Error> {
        self.ensure_live()?;
        if let Err(err) = self.transport.fill() {
            return Err(self.fail(err));
        }
        let dispatched = self.dispatch_queue_id(queue)?;
        if self.transport.is_closed() {
            if self.transport.has_partial_input() {
                warn!("peer closed the connection in the middle of a message");
            }
            return Err(self.fail(Error::ConnectionLost(None)));
        }
        Ok(dispatched)
    }

    /// Dispatch the default queue without reading from the socket.
    pub fn dispatch_pending(&mut self) -> Result<usize, Error> {
        self.dispatch_queue_id(DEFAULT_QUEUE)
    }

    /// Dispatch the messages waiting on `queue`, without reading from the
    /// socket. Input already buffered is sorted onto its queues first.
    pub fn dispatch_queue(&mut self, queue: EventQueue) -> Result<usize, Error> {
        let id = self.queue_id(queue)?;
        self.dispatch_queue_id(id)
    }

    fn dispatch_queue_id(&mut self, queue: u64) -> Result<usize, Error> {
        self.ensure_live()?;
        let mut dispatched = 0;
        loop {
            while let Some(queued) = self.queues.get_mut(&queue).and_then(VecDeque::pop_front) {
                self.dispatch_message(queued)?;
                dispatched += 1;
            }
            let frame = match self.transport.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(dispatched),
                Err(err) => return Err(self.fail(err)),
            };
            self.queue_frame(frame)?;
        }
    }

    #[must_use]
    pub fn default_queue(&self) -> EventQueue {
        EventQueue {
            connection: self.id,
            id: DEFAULT_QUEUE,
        }
    }

    /// Create an empty event queue.
    pub fn create_queue(&mut self) -> EventQueue {
        self.next_queue += 1;
        self.queues.insert(self.next_queue, VecDeque::new());
        EventQueue {
            connection: self.id,
            id: self.next_queue,
        }
    }

    /// Destroy an event queue, dropping the messages still on it.
    ///
    /// Its objects move back to the default queue. Returns how many messages
    /// were dropped. The default queue cannot be destroyed.
    pub fn destroy_queue(&mut self, queue: EventQueue) -> Result<usize, Error> {
        let id = self.queue_id(queue)?;
        if id == DEFAULT_QUEUE {
            return Err(Error::UnknownQueue { queue: id });
        }
        let dropped = self.queues.remove(&id).unwrap_or_default();
        if !dropped.is_empty() {
            warn!(queue = id, dropped = dropped.len(), "event queue destroyed with pending messages");
        }
        self.registry.reset_queue(id);
        let count = dropped.len();
        for queued in dropped {
            self.finish_deferred_delete(queued.message.sender.id(), queued.generation);
        }
        Ok(count)
    }

    /// Put `proxy`'s incoming messages on `queue` from now on.
    ///
    /// Messages already queued for it stay where they are.
    pub fn set_queue(&mut self, proxy: &Proxy, queue: EventQueue) -> Result<(), Error> {
        self.check_proxy(proxy)?;
        let id = self.queue_id(queue)?;
        if let Some(entry) = self.registry.get_mut(proxy.id()) {
            entry.queue = id;
        }
        Ok(())
    }

    /// The queue `proxy`'s messages go to, if it is still registered.
    #[must_use]
    pub fn queue_of(&self, proxy: &Proxy) -> Option<EventQueue> {
        if proxy.connection() != self.id {
            return None;
        }
        self.registry
            .get(proxy.id())
            .filter(|entry| entry.generation == proxy.generation())
            .map(|entry| EventQueue {
                connection: self.id,
                id: entry.queue,
            })
    }

    /// Number of messages waiting on `queue`.
    #[must_use]
    pub fn pending(&self, queue: EventQueue) -> usize {
        if queue.connection != self.id {
            return 0;
        }
        self.queues.get(&queue.id).map_or(0, VecDeque::len)
    }

    fn queue_id(&self, queue: EventQueue) -> Result<u64, Error> {
        if queue.connection != self.id || !self.queues.contains_key(&queue.id) {
            return Err(Error::UnknownQueue { queue: queue.id });
        }
        Ok(queue.id)
    }

    /// Decode one frame and put it on its object's queue.
    ///
    /// Whatever cannot wait for the queue to be dispatched happens here:
    /// fatal checks, the display's own events and registration of new
    /// objects.
    fn queue_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let Some(entry) = self.registry.get(frame.object) else {
            return Err(self.fail(Error::UnknownObject { id: frame.object }));
        };
        let proxy = entry.proxy.clone();
        let destroyed = entry.destroyed;
        let generation = entry.generation;
        let queue = entry.queue;
        let interface = proxy.interface().clone();
        let direction = self.side.incoming();
        let Some(spec) = interface.message(direction, frame.opcode) else {
            return Err(self.fail(Error::UnknownOpcode {
                object: frame.object,
                interface: interface.name().to_string(),
                opcode: frame.opcode,
            }));
        };

        let mut fds = self.transport.take_fds(spec.fd_count());
        let mut args = match decode_args(&spec.args, &frame.payload, &mut fds) {
            Ok(args) => args,
            Err(source) => {
                return Err(self.fail(Error::Decode {
                    object: frame.object,
                    opcode: frame.opcode,
                    source,
                }));
            }
        };
        trace!(object = %proxy, message = %spec.name, size = frame.size(), "frame");

        if self.side == Side::Client && proxy.id() == ObjectId::DISPLAY {
            match spec.name.as_str() {
                "error" => return Err(self.peer_error(&args)),
                "delete_id" => {
                    self.delete_id(&args);
                    return Ok(());
                }
                _ => {}
            }
        }

        for (slot, arg) in spec.args.iter().zip(&args) {
            let Argument::NewId(new_id) = arg else {
                continue;
            };
            let (name, version) = match &new_id.dynamic {
                Some((name, version)) => (name.as_str(), *version),
                None => (slot.interface.as_deref().unwrap_or_default(), proxy.version()),
            };
            let Some(target) = self.protocol.interface(name).cloned() else {
                return Err(self.fail(Error::UnknownPeerInterface {
                    id: new_id.id,
                    interface: name.to_string(),
                }));
            };
            if let Err(err) = self.registry.register_peer(new_id.id, target, version) {
                return Err(self.fail(err));
            }
            if let Some(created) = self.registry.get_mut(new_id.id) {
                created.queue = queue;
            }
        }

        if destroyed {
            warn!(object = %proxy, message = %spec.name, "dropping message for destroyed object");
            return Ok(());
        }

        let proxies = match self.resolve_references(&interface, spec, &mut args) {
            Ok(proxies) => proxies,
            Err(err) => return Err(self.fail(err)),
        };
        let message = Message {
            sender: proxy,
            opcode: frame.opcode,
            direction,
            args,
            proxies,
        };
        if let Some(pending) = self.queues.get_mut(&queue) {
            pending.push_back(Queued {
                message,
                generation,
            });
        }
        Ok(())
    }

    /// Look up the objects named by `object` and `new_id` arguments.
    ///
    /// A reference to an object destroyed here but not yet by the peer reads
    /// as null; anything else unknown, or of the wrong interface, is fatal.
    fn resolve_references(
        &self,
        interface: &Interface,
        spec: &MessageSpec,
        args: &mut [Argument],
    ) -> Result<Vec<Option<Proxy>>, Error> {
        let mut proxies = Vec::with_capacity(args.len());
        for (slot, arg) in spec.args.iter().zip(args.iter_mut()) {
            let resolved = match arg {
                Argument::Object(id) if !id.is_null() => match self.registry.get(*id) {
                    None => {
                        return Err(Error::UnknownReference {
                            message: format!("{}.{}", interface.name(), spec.name),
                            arg: slot.name.clone(),
                            id: *id,
                        });
                    }
                    Some(entry) if entry.destroyed => {
                        *id = ObjectId::NULL;
                        None
                    }
                    Some(entry) => {
                        let found = entry.proxy.interface().name();
                        if let Some(expected) = &slot.interface {
                            if found != expected {
                                return Err(Error::ReferenceMismatch {
                                    message: format!("{}.{}", interface.name(), spec.name),
                                    arg: slot.name.clone(),
                                    expected: expected.clone(),
                                    found: found.to_string(),
                                });
                            }
                        }
                        Some(entry.proxy.clone())
                    }
                },
                Argument::NewId(new_id) => self.registry.live(new_id.id).cloned(),
                _ => None,
            };
            proxies.push(resolved);
        }
        Ok(proxies)
    }

    /// Run the listener for one queued message.
    fn dispatch_message(&mut self, queued: Queued) -> Result<(), Error> {
        let Queued {
            message,
            generation,
        } = queued;
        let id = message.sender.id();
        let opcode = message.opcode;
        let interface = message.sender.interface().clone();
        let Some(spec) = interface.message(message.direction, opcode) else {
            return Ok(());
        };

        // Destroyed after the message was queued
        let live = self
            .registry
            .get(id)
            .is_some_and(|entry| entry.generation == generation && !entry.destroyed);
        if !live {
            debug!(object = %message.sender, message = %spec.name, "dropping queued message");
            return Ok(());
        }
        debug!(object = %message.sender, message = %spec.name, "dispatching");

        let taken = self.registry.get_mut(id).and_then(|entry| {
            let listener = entry.listeners.remove(&opcode)?;
            Some((listener, entry.listener_epoch))
        });
        let mut outcome = Ok(());
        match taken {
            Some((mut listener, epoch)) => {
                listener(self, message);
                self.ensure_live()?;
                if let Some(entry) = self.registry.get_mut(id) {
                    // Keep it unless the callback replaced it or the object changed
                    if entry.generation == generation
                        && entry.listener_epoch == epoch
                        && !entry.destroyed
                    {
                        entry.listeners.insert(opcode, listener);
                    }
                }
            }
            None if spec.requires_handler => {
                outcome = Err(Error::MissingHandler {
                    interface: interface.name().to_string(),
                    event: spec.name.clone(),
                });
            }
            None => {}
        }

        // The listener may already have destroyed the object itself
        let same_object = self
            .registry
            .get(id)
            .is_some_and(|entry| entry.generation == generation && !entry.destroyed);
        if spec.destructor && same_object {
            self.release(id)?;
        }
        self.finish_deferred_delete(id, generation);
        outcome
    }

    fn has_queued(&self, id: ObjectId, generation: u64) -> bool {
        self.queues
            .values()
            .flatten()
            .any(|queued| queued.generation == generation && queued.message.sender.id() == id)
    }

    /// Drop an object whose id the peer released while messages for it were
    /// queued, once the last of them is gone.
    fn finish_deferred_delete(&mut self, id: ObjectId, generation: u64) {
        let deferred = self
            .registry
            .get(id)
            .is_some_and(|entry| entry.generation == generation && entry.id_deleted);
        if deferred && !self.has_queued(id, generation) {
            self.registry.remove(id);
            trace!(%id, "id released");
        }
    }

    /// `wl_display.error`: the peer is giving up on us.
    fn peer_error(&mut self, args: &[Argument]) -> Error {
        let (object, code, message) = match args {
            [Argument::Object(object), Argument::Uint(code), Argument::Str(message)] => {
                (*object, *code, message.clone().unwrap_or_default())
            }
            _ => (ObjectId::NULL, 0, String::new()),
        };
        let interface = self
            .registry
            .get(object)
            .map(|entry| entry.proxy.interface().clone());
        let err = ProtocolError {
            object,
            interface: interface.as_ref().map(|i| i.name().to_string()),
            code,
            code_name: interface
                .as_ref()
                .and_then(|i| i.enum_entry_name("error", code))
                .map(str::to_string),
            message,
        };
        self.fail(Error::Protocol(err))
    }

    /// `wl_display.delete_id`: the server is done with one of our ids.
    ///
    /// A live object with messages still queued keeps its entry until they
    /// are dispatched.
    fn delete_id(&mut self, args: &[Argument]) {
        let Some(Argument::Uint(raw)) = args.first() else {
            return;
        };
        let id = ObjectId::new(*raw);
        let Some(entry) = self.registry.get(id) else {
            warn!(%id, "delete_id for unknown object");
            return;
        };
        if !entry.destroyed && self.has_queued(id, entry.generation) {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.id_deleted = true;
            }
            trace!(%id, "id release deferred");
        } else {
            self.registry.remove(id);
            trace!(%id, "id released");
        }
    }

    /// Flush, wait for input if none is buffered, and dispatch the default
    /// queue.
    ///
    /// Blocks until at least one message was dispatched.
    pub fn blocking_dispatch(&mut self) -> Result<usize, Error> {
        self.blocking_dispatch_id(DEFAULT_QUEUE)
    }

    /// [`Connection::blocking_dispatch`] for any queue.
    pub fn blocking_dispatch_queue(&mut self, queue: EventQueue) -> Result<usize, Error> {
        let id = self.queue_id(queue)?;
        self.blocking_dispatch_id(id)
    }

    fn blocking_dispatch_id(&mut self, queue: u64) -> Result<usize, Error> {
        let dispatched = self.dispatch_queue_id(queue)?;
        if dispatched > 0 {
            return Ok(dispatched);
        }
        loop {
            let mut events = libc::POLLIN;
            if !self.flush()? {
                events |= libc::POLLOUT;
            }
            if let Err(err) = self.wait(events) {
                return Err(self.fail(err.into()));
            }
            let dispatched = self.process_queue(queue)?;
            if dispatched > 0 {
                return Ok(dispatched);
            }
        }
    }

    fn wait(&self, events: libc::c_short) -> io::Result<()> {
        let mut pollfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events,
            revents: 0,
        };
        loop {
            // SAFETY: one valid pollfd for the duration of the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Block until the server has processed everything sent so far.
    ///
    /// Sends `wl_display.sync` and dispatches until its callback fires.
    /// Returns the number of messages dispatched on the way.
    pub fn roundtrip(&mut self) -> Result<usize, Error> {
        let display = self.display.clone();
        let created = self.send_request(&display, "sync", vec![Argument::new_id()])?;
        let Some(callback) = created.first() else {
            return Err(Error::NoSuchMessage {
                interface: WL_DISPLAY.to_string(),
                name: "sync".to_string(),
            });
        };

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        self.set_listener(callback, "done", move |_, _| {
            flag.store(true, Ordering::Release);
        })?;

        let mut dispatched = 0;
        while !done.load(Ordering::Acquire) {
            dispatched += self.blocking_dispatch()?;
        }
        Ok(dispatched)
    }

    /// Report a fatal error to the client and fail the connection.
    /// Server side only.
    pub fn post_error(
        &mut self,
        object: ObjectId,
        code: u32,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        if self.side != Side::Server {
            return Err(Error::WrongSide {
                operation: "post_error",
            });
        }
        self.ensure_live()?;
        let message = message.into();
        let interface = self.registry.get(object).map(|e| e.proxy.interface().clone());
        let code_name = interface
            .as_ref()
            .and_then(|i| i.enum_entry_name("error", code))
            .map(str::to_string);

        let display_interface = self.display.interface().clone();
        let spec = display_interface
            .event(display::ERROR)
            .ok_or_else(|| Error::NoSuchMessage {
                interface: WL_DISPLAY.to_string(),
                name: "error".to_string(),
            })?;
        let args = vec![
            Argument::Object(object),
            Argument::Uint(code),
            Argument::string(message.clone()),
        ];
        self.queue_message(ObjectId::DISPLAY, display::ERROR, spec, args)
            .map_err(|source| Error::Encode {
                interface: WL_DISPLAY.to_string(),
                message: "error".to_string(),
                source,
            })?;
        while !self.flush()? {
            if let Err(err) = self.wait(libc::POLLOUT) {
                return Err(self.fail(err.into()));
            }
        }

        self.fail(Error::Protocol(ProtocolError {
            object,
            interface: interface.map(|i| i.name().to_string()),
            code,
            code_name,
            message,
        }));
        Ok(())
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.transport.as_fd()
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.transport.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_interfaces;
    use crate::schema::{ArgSpec, EnumSpec};
    use crate::wire::SERVER_ID_START;
    use std::io::{Read, Write};
    use std::sync::Mutex;

    fn test_protocol() -> Protocol {
        let extra = Protocol::new("test")
            .with_interface(
                Interface::new("test_factory", 3)
                    .with_request(
                        MessageSpec::new("create")
                            .arg(ArgSpec::new_id("id", "test_object"))
                            .arg(ArgSpec::uint("value")),
                    )
                    .with_request(
                        MessageSpec::new("send_fds")
                            .arg(ArgSpec::fd("first"))
                            .arg(ArgSpec::uint("tag"))
                            .arg(ArgSpec::fd("second")),
                    )
                    .with_request(MessageSpec::new("upgrade").since(2))
                    .with_event(MessageSpec::new("announce").arg(ArgSpec::new_id("id", "test_object")))
                    .with_event(MessageSpec::new("value").arg(ArgSpec::uint("value")))
                    .with_event(MessageSpec::new("critical").requires_handler())
                    .with_event(
                        MessageSpec::new("refer").arg(
                            ArgSpec::object("target")
                                .of_interface("test_object")
                                .nullable(),
                        ),
                    )
                    .with_enum(EnumSpec::new("error").entry("bad_value", 0).entry("bad_fd", 1)),
            )
            .unwrap()
            .with_interface(
                Interface::new("test_object", 3)
                    .with_request(MessageSpec::new("destroy").destructor())
                    .with_request(
                        MessageSpec::new("attach")
                            .arg(ArgSpec::object("factory").of_interface("test_factory")),
                    )
                    .with_event(MessageSpec::new("ping").arg(ArgSpec::uint("serial"))),
            )
            .unwrap();
        let mut protocol = core_interfaces::protocol();
        protocol.extend(extra).unwrap();
        protocol
    }

    fn loopback() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        let protocol = Arc::new(test_protocol());
        (
            Connection::new(a, protocol.clone(), Side::Client).unwrap(),
            Connection::new(b, protocol, Side::Server).unwrap(),
        )
    }

    /// Client with a raw socket as its peer.
    fn raw_client() -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Connection::new(a, test_protocol(), Side::Client).unwrap(), b)
    }

    fn bind_factory(client: &mut Connection, version: u32) -> Proxy {
        let display = client.display().clone();
        let registry = client
            .send_request(&display, "get_registry", vec![Argument::new_id()])
            .unwrap()
            .remove(0);
        client
            .send_request(
                &registry,
                "bind",
                vec![Argument::Uint(1), Argument::new_dynamic("test_factory", version)],
            )
            .unwrap()
            .remove(0)
    }

    fn raw_frame(object: u32, opcode: u16, payload: &[u8]) -> Vec<u8> {
        let mut bytes = MessageHeader {
            object: ObjectId::new(object),
            opcode,
            size: HEADER_SIZE + payload.len(),
        }
        .to_bytes()
        .to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_new_id_and_uint_frame_layout() {
        let (mut client, mut peer) = raw_client();
        let factory = bind_factory(&mut client, 3);
        assert_eq!(factory.id().raw(), 3);

        let created = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(7)])
            .unwrap();
        let object = &created[0];
        assert_eq!(object.id().raw(), 4);
        assert_eq!(object.interface().name(), "test_object");
        assert_eq!(object.version(), 3);
        assert_eq!(client.object(object.id()).as_ref(), Some(object));

        // get_registry (12) + bind (40) come first
        let mut buf = vec![0u8; 12 + 40 + 16];
        peer.read_exact(&mut buf).unwrap();
        let frame = &buf[52..];
        let words: Vec<u32> = frame
            .chunks(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(words, vec![3, 16 << 16, 4, 7]);
    }

    #[test]
    fn test_server_registers_client_objects() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 2);
        assert_eq!(server.process().unwrap(), 2);

        let seen = server.object(factory.id()).unwrap();
        assert_eq!(seen.interface().name(), "test_factory");
        assert_eq!(seen.version(), 2);
        assert!(server.object(ObjectId::new(2)).is_some());
    }

    #[test]
    fn test_delete_id_frees_id_for_reuse() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let four = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap();
        let five = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap();
        assert_eq!(four[0].id().raw(), 4);
        assert_eq!(five[0].id().raw(), 5);
        server.process().unwrap();

        let display = server.display().clone();
        server
            .send_event(&display, "delete_id", vec![Argument::Uint(5)])
            .unwrap();
        client.process().unwrap();

        assert!(client.object(ObjectId::new(5)).is_none());
        let again = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap();
        assert_eq!(again[0].id().raw(), 5);
    }

    #[test]
    fn test_destructor_round_trip_releases_id() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        client.send_request(&object, "destroy", vec![]).unwrap();

        // Zombie until the server confirms
        assert!(client.object(object.id()).is_none());
        assert!(matches!(
            client.send_request(&object, "destroy", vec![]),
            Err(Error::NotLive { .. })
        ));
        let next = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap();
        assert_ne!(next[0].id(), object.id());

        server.process().unwrap();
        assert!(server.object(object.id()).is_none());
        client.process().unwrap();

        let reused = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap();
        assert_eq!(reused[0].id(), object.id());
        // The old handle does not address the new object
        assert!(matches!(
            client.send_request(&object, "attach", vec![Argument::from(&factory)]),
            Err(Error::NotLive { .. })
        ));
    }

    #[test]
    fn test_unknown_object_fails_connection() {
        let (mut client, mut peer) = raw_client();
        let display = client.display().clone();
        let registry = client
            .send_request(&display, "get_registry", vec![Argument::new_id()])
            .unwrap()
            .remove(0);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        client
            .set_listener(&registry, "global_remove", move |_, _| {
                *counter.lock().unwrap() += 1;
            })
            .unwrap();

        peer.write_all(&raw_frame(77, 0, &[])).unwrap();
        peer.write_all(&raw_frame(registry.id().raw(), 1, &9u32.to_ne_bytes()))
            .unwrap();

        let err = client.process().unwrap_err();
        assert!(matches!(err.root(), Error::UnknownObject { id } if id.raw() == 77));
        assert!(err.is_fatal());
        assert!(client.is_failed());
        assert_eq!(client.interest(), Interest::empty());
        assert!(matches!(client.process(), Err(Error::ConnectionFailed(_))));
        assert!(matches!(
            client.send_request(&display, "sync", vec![Argument::new_id()]),
            Err(Error::ConnectionFailed(_))
        ));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_unknown_opcode_fails_connection() {
        let (mut client, mut peer) = raw_client();
        peer.write_all(&raw_frame(1, 9, &[])).unwrap();
        let err = client.process().unwrap_err();
        assert!(matches!(
            err.root(),
            Error::UnknownOpcode { opcode: 9, interface, .. } if interface == "wl_display"
        ));
        assert!(client.fatal_error().is_some());
    }

    #[test]
    fn test_truncated_payload_fails_connection() {
        let (mut client, mut peer) = raw_client();
        // delete_id needs a uint, none given
        peer.write_all(&raw_frame(1, display::DELETE_ID, &[])).unwrap();
        let err = client.process().unwrap_err();
        assert!(matches!(err.root(), Error::Decode { .. }));
    }

    #[test]
    fn test_descriptors_arrive_in_slot_order() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let server_factory = server.object(factory.id()).unwrap();
        server
            .set_listener(&server_factory, "send_fds", move |_, message| {
                assert_eq!(message.uint("tag"), Some(42));
                sink.lock().unwrap().extend(message.into_args());
            })
            .unwrap();

        let (first, mut first_peer) = UnixStream::pair().unwrap();
        let (second, mut second_peer) = UnixStream::pair().unwrap();
        client
            .send_request(
                &factory,
                "send_fds",
                vec![
                    Argument::Fd(first.into()),
                    Argument::Uint(42),
                    Argument::Fd(second.into()),
                ],
            )
            .unwrap();
        assert_eq!(server.process().unwrap(), 1);

        let mut args = received.lock().unwrap().drain(..).collect::<Vec<_>>().into_iter();
        let (Some(Argument::Fd(a)), Some(Argument::Uint(42)), Some(Argument::Fd(b))) =
            (args.next(), args.next(), args.next())
        else {
            panic!("unexpected arguments");
        };
        UnixStream::from(a).write_all(b"first").unwrap();
        UnixStream::from(b).write_all(b"second").unwrap();

        let mut buf = [0u8; 5];
        first_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"first");
        let mut buf = [0u8; 6];
        second_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"second");
    }

    #[test]
    fn test_dispatch_follows_frame_order() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        server.process().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for (proxy, event, arg) in [(&factory, "value", "value"), (&object, "ping", "serial")] {
            let log = log.clone();
            client
                .set_listener(proxy, event, move |_, message| {
                    log.lock().unwrap().push((
                        message.sender().id().raw(),
                        message.name().to_string(),
                        message.uint(arg).unwrap(),
                    ));
                })
                .unwrap();
        }

        let server_factory = server.object(factory.id()).unwrap();
        let server_object = server.object(object.id()).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(1)]).unwrap();
        server.send_event(&server_object, "ping", vec![Argument::Uint(2)]).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(3)]).unwrap();
        server.send_event(&server_object, "ping", vec![Argument::Uint(4)]).unwrap();

        assert_eq!(client.process().unwrap(), 4);
        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                (3, "value".to_string(), 1),
                (4, "ping".to_string(), 2),
                (3, "value".to_string(), 3),
                (4, "ping".to_string(), 4),
            ]
        );
    }

    #[test]
    fn test_server_created_objects_use_high_range() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        let announced = Arc::new(Mutex::new(None));
        let slot = announced.clone();
        client
            .set_listener(&factory, "announce", move |conn, message| {
                let id = message.object("id").unwrap();
                assert_eq!(message.proxy("id").cloned(), conn.object(id));
                *slot.lock().unwrap() = message.proxy("id").cloned();
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        let created = server
            .send_event(&server_factory, "announce", vec![Argument::new_id()])
            .unwrap();
        assert_eq!(created[0].id().raw(), SERVER_ID_START);

        client.process().unwrap();
        let proxy = announced.lock().unwrap().clone().unwrap();
        assert_eq!(proxy.id().raw(), SERVER_ID_START);
        assert_eq!(proxy.interface().name(), "test_object");
        assert_eq!(proxy.version(), 3);
    }

    #[test]
    fn test_usage_errors_leave_connection_live() {
        let (mut client, _server) = loopback();
        let factory = bind_factory(&mut client, 1);
        let display = client.display().clone();

        let err = client.send_request(&factory, "upgrade", vec![]).unwrap_err();
        assert!(matches!(err, Error::VersionTooLow { since: 2, version: 1, .. }));
        assert!(!err.is_fatal());

        let err = client.send_request(&factory, "nope", vec![]).unwrap_err();
        assert!(matches!(err, Error::NoSuchMessage { .. }));

        let err = client
            .send_request(&factory, "create", vec![Argument::new_id()])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Encode { source: EncodeError::ArgumentCount { expected: 2, found: 1 }, .. }
        ));

        let err = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::Encode { source: EncodeError::KindMismatch { .. }, .. }));

        let registry = client.object(ObjectId::new(2)).unwrap();
        let err = client
            .send_request(&registry, "bind", vec![Argument::Uint(1), Argument::new_dynamic("test_factory", 4)])
            .unwrap_err();
        assert!(matches!(err, Error::VersionUnsupported { requested: 4, supported: 3, .. }));

        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        let err = client
            .send_request(&object, "attach", vec![Argument::from(&registry)])
            .unwrap_err();
        assert!(matches!(err, Error::WrongInterface { .. }));

        let err = client
            .send_request(&object, "attach", vec![Argument::Object(ObjectId::new(99))])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownArgumentObject { .. }));

        let err = client.send_event(&display, "delete_id", vec![Argument::Uint(1)]).unwrap_err();
        assert!(matches!(err, Error::WrongSide { .. }));

        // A failed send allocates nothing
        let before = client.object_count();
        client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Str(None)])
            .unwrap_err();
        assert_eq!(client.object_count(), before);

        assert!(!client.is_failed());
        client
            .send_request(&object, "attach", vec![Argument::from(&factory)])
            .unwrap();
    }

    #[test]
    fn test_foreign_proxy_rejected() {
        let (mut one, _s1) = loopback();
        let (two, _s2) = loopback();
        let foreign = two.display().clone();
        let err = one
            .send_request(&foreign, "sync", vec![Argument::new_id()])
            .unwrap_err();
        assert!(matches!(err, Error::ForeignProxy { .. }));
    }

    #[test]
    fn test_post_error_reaches_client() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        server.post_error(factory.id(), 1, "descriptor is not a file").unwrap();
        assert!(server.is_failed());
        assert!(matches!(server.flush(), Err(Error::ConnectionFailed(_))));

        let err = client.process().unwrap_err();
        let protocol = err.protocol_error().unwrap();
        assert_eq!(protocol.object, factory.id());
        assert_eq!(protocol.interface.as_deref(), Some("test_factory"));
        assert_eq!(protocol.code, 1);
        assert_eq!(protocol.code_name.as_deref(), Some("bad_fd"));
        assert_eq!(protocol.message, "descriptor is not a file");
        assert_eq!(client.protocol_error(), Some(protocol));

        let display = client.display().clone();
        let err = client
            .send_request(&display, "sync", vec![Argument::new_id()])
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.protocol_error().is_some());
    }

    #[test]
    fn test_missing_mandatory_handler() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        client
            .set_listener(&factory, "value", move |_, message| {
                sink.lock().unwrap().push(message.uint("value").unwrap());
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        server.send_event(&server_factory, "critical", vec![]).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(8)]).unwrap();

        let err = client.process().unwrap_err();
        assert!(matches!(err, Error::MissingHandler { ref event, .. } if event == "critical"));
        assert!(!client.is_failed());
        assert!(values.lock().unwrap().is_empty());

        assert_eq!(client.process().unwrap(), 1);
        assert_eq!(*values.lock().unwrap(), vec![8]);
    }

    #[test]
    fn test_events_for_destroyed_object_are_dropped() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        server.process().unwrap();
        let server_object = server.object(object.id()).unwrap();

        let pings = Arc::new(Mutex::new(0));
        let counter = pings.clone();
        client
            .set_listener(&object, "ping", move |_, _| *counter.lock().unwrap() += 1)
            .unwrap();
        client.send_request(&object, "destroy", vec![]).unwrap();

        // Crosses the destroy on the wire
        server.send_event(&server_object, "ping", vec![Argument::Uint(1)]).unwrap();
        assert_eq!(client.process().unwrap(), 0);
        assert_eq!(*pings.lock().unwrap(), 0);
        assert!(!client.is_failed());
    }

    #[test]
    fn test_events_for_destroyed_server_object_are_dropped() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        let announced = Arc::new(Mutex::new(Vec::new()));
        let sink = announced.clone();
        client
            .set_listener(&factory, "announce", move |_, message| {
                sink.lock().unwrap().push(message.proxy("id").cloned().unwrap());
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        let server_object = server
            .send_event(&server_factory, "announce", vec![Argument::new_id()])
            .unwrap()
            .remove(0);
        client.process().unwrap();
        let object = announced.lock().unwrap()[0].clone();
        client.send_request(&object, "destroy", vec![]).unwrap();
        assert!(client.object(object.id()).is_none());

        // Crosses the destroy on the wire
        server.send_event(&server_object, "ping", vec![Argument::Uint(1)]).unwrap();
        assert_eq!(client.process().unwrap(), 0);
        assert!(!client.is_failed());

        // The server frees the id and announces a new object under it
        server.process().unwrap();
        assert!(server.object(server_object.id()).is_none());
        server
            .send_event(&server_factory, "announce", vec![Argument::new_id()])
            .unwrap();
        assert_eq!(client.process().unwrap(), 1);
        let again = announced.lock().unwrap()[1].clone();
        assert_eq!(again.id().raw(), SERVER_ID_START);
        assert_ne!(again, object);
        assert_eq!(client.object(again.id()), Some(again));
    }

    #[test]
    fn test_unknown_reference_fails_connection() {
        let (mut client, mut peer) = raw_client();
        let factory = bind_factory(&mut client, 3);
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        client
            .set_listener(&factory, "refer", move |_, _| *counter.lock().unwrap() += 1)
            .unwrap();

        peer.write_all(&raw_frame(factory.id().raw(), 3, &0xff00_1234u32.to_ne_bytes()))
            .unwrap();
        let err = client.process().unwrap_err();
        assert!(matches!(
            err.root(),
            Error::UnknownReference { arg, id, .. } if arg == "target" && id.raw() == 0xff00_1234
        ));
        assert!(err.is_fatal());
        assert!(client.is_failed());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_reference_to_wrong_interface_fails_connection() {
        let (mut client, mut peer) = raw_client();
        let factory = bind_factory(&mut client, 3);

        // Id 2 is the registry
        peer.write_all(&raw_frame(factory.id().raw(), 3, &2u32.to_ne_bytes()))
            .unwrap();
        let err = client.process().unwrap_err();
        assert!(matches!(
            err.root(),
            Error::ReferenceMismatch { expected, found, .. }
                if expected == "test_object" && found == "wl_registry"
        ));
        assert!(client.is_failed());
    }

    #[test]
    fn test_reference_to_destroyed_object_reads_as_null() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        server.process().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client
            .set_listener(&factory, "refer", move |_, message| {
                sink.lock()
                    .unwrap()
                    .push((message.object("target"), message.proxy("target").cloned()));
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        let server_object = server.object(object.id()).unwrap();
        server
            .send_event(&server_factory, "refer", vec![Argument::from(&server_object)])
            .unwrap();
        assert_eq!(client.process().unwrap(), 1);

        client.send_request(&object, "destroy", vec![]).unwrap();
        server
            .send_event(&server_factory, "refer", vec![Argument::from(&server_object)])
            .unwrap();
        assert_eq!(client.process().unwrap(), 1);
        assert!(!client.is_failed());

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Some(object.id()), Some(object.clone())));
        assert_eq!(seen[1], (Some(ObjectId::NULL), None));
    }

    #[test]
    fn test_queued_events_wait_for_their_queue() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let queue = client.create_queue();
        assert!(!queue.is_default());
        client.set_queue(&factory, queue).unwrap();
        let object = client
            .send_request(&factory, "create", vec![Argument::new_id(), Argument::Uint(0)])
            .unwrap()
            .remove(0);
        assert_eq!(client.queue_of(&object), Some(queue));
        server.process().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for (proxy, event, arg) in [(&factory, "value", "value"), (&object, "ping", "serial")] {
            let log = log.clone();
            client
                .set_listener(proxy, event, move |_, message| {
                    log.lock().unwrap().push(message.uint(arg).unwrap());
                })
                .unwrap();
        }

        let server_factory = server.object(factory.id()).unwrap();
        let server_object = server.object(object.id()).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(1)]).unwrap();
        server.send_event(&server_object, "ping", vec![Argument::Uint(2)]).unwrap();
        server
            .send_event(&server_factory, "announce", vec![Argument::new_id()])
            .unwrap();

        assert_eq!(client.process().unwrap(), 0);
        assert_eq!(client.pending(queue), 3);
        assert_eq!(client.pending(client.default_queue()), 0);
        assert!(log.lock().unwrap().is_empty());

        // Objects announced on a queued object join its queue
        let announced = client.object(ObjectId::new(SERVER_ID_START)).unwrap();
        assert_eq!(client.queue_of(&announced), Some(queue));

        assert_eq!(client.dispatch_queue(queue).unwrap(), 3);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(client.pending(queue), 0);
    }

    #[test]
    fn test_destroyed_queue_drops_its_messages() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        let queue = client.create_queue();
        client.set_queue(&factory, queue).unwrap();
        server.process().unwrap();

        let values = Arc::new(Mutex::new(Vec::new()));
        let sink = values.clone();
        client
            .set_listener(&factory, "value", move |_, message| {
                sink.lock().unwrap().push(message.uint("value").unwrap());
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(1)]).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(2)]).unwrap();
        assert_eq!(client.process().unwrap(), 0);

        assert_eq!(client.destroy_queue(queue).unwrap(), 2);
        assert_eq!(client.queue_of(&factory), Some(client.default_queue()));
        assert!(matches!(client.dispatch_queue(queue), Err(Error::UnknownQueue { .. })));
        let default = client.default_queue();
        assert!(matches!(client.destroy_queue(default), Err(Error::UnknownQueue { .. })));

        let (other, _other_server) = loopback();
        let err = client.set_queue(&factory, other.default_queue()).unwrap_err();
        assert!(matches!(err, Error::UnknownQueue { .. }));
        assert!(!err.is_fatal());

        server.send_event(&server_factory, "value", vec![Argument::Uint(3)]).unwrap();
        assert_eq!(client.process().unwrap(), 1);
        assert_eq!(*values.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_delete_id_waits_for_queued_messages() {
        let (mut client, mut server) = loopback();
        let display = client.display().clone();
        let callback = client
            .send_request(&display, "sync", vec![Argument::new_id()])
            .unwrap()
            .remove(0);
        let queue = client.create_queue();
        client.set_queue(&callback, queue).unwrap();

        let done = Arc::new(Mutex::new(false));
        let flag = done.clone();
        client
            .set_listener(&callback, "done", move |_, _| *flag.lock().unwrap() = true)
            .unwrap();

        server.process().unwrap();
        let server_callback = server.object(callback.id()).unwrap();
        // done is a destructor, so delete_id follows it
        server
            .send_event(&server_callback, "done", vec![Argument::Uint(0)])
            .unwrap();
        assert_eq!(client.process().unwrap(), 0);
        assert_eq!(client.object(callback.id()), Some(callback.clone()));

        assert_eq!(client.dispatch_queue(queue).unwrap(), 1);
        assert!(*done.lock().unwrap());
        assert!(client.object(callback.id()).is_none());

        let next = client
            .send_request(&display, "sync", vec![Argument::new_id()])
            .unwrap();
        assert_eq!(next[0].id(), callback.id());
    }

    #[test]
    fn test_listener_can_replace_itself() {
        let (mut client, mut server) = loopback();
        let factory = bind_factory(&mut client, 3);
        server.process().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        let outer = log.clone();
        let proxy = factory.clone();
        client
            .set_listener(&factory, "value", move |conn, message| {
                outer.lock().unwrap().push(("first", message.uint("value").unwrap()));
                let inner = outer.clone();
                conn.set_listener(&proxy, "value", move |_, message| {
                    inner.lock().unwrap().push(("second", message.uint("value").unwrap()));
                })
                .unwrap();
            })
            .unwrap();

        let server_factory = server.object(factory.id()).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(1)]).unwrap();
        server.send_event(&server_factory, "value", vec![Argument::Uint(2)]).unwrap();
        client.process().unwrap();
        assert_eq!(*log.lock().unwrap(), vec![("first", 1), ("second", 2)]);

        assert!(client.remove_listener(&factory, "value").unwrap());
        assert!(!client.remove_listener(&factory, "value").unwrap());
    }

    #[test]
    fn test_peer_hangup_is_connection_lost() {
        let (mut client, server) = loopback();
        drop(server);
        let err = client.process().unwrap_err();
        assert!(matches!(err.root(), Error::ConnectionLost(_)));
    }

    #[test]
    fn test_interest_tracks_queued_output() {
        let (client, _server) = loopback();
        assert_eq!(client.interest(), Interest::READABLE);
        assert_eq!(client.as_raw_fd(), client.as_fd().as_raw_fd());
    }

    #[test]
    fn test_roundtrip_against_threaded_server() {
        let (a, b) = UnixStream::pair().unwrap();
        let protocol = Arc::new(core_interfaces::protocol());
        let mut client = Connection::new(a, protocol.clone(), Side::Client).unwrap();
        let mut server = Connection::new(b, protocol, Side::Server).unwrap();

        let handle = std::thread::spawn(move || {
            let display = server.display().clone();
            server
                .set_listener(&display, "sync", |conn, message| {
                    let callback = message.proxy("callback").unwrap();
                    conn.send_event(callback, "done", vec![Argument::Uint(0)])
                        .unwrap();
                })
                .unwrap();
            while server.blocking_dispatch().is_ok() {}
            server.fatal_error().map(|e| matches!(e, Error::ConnectionLost(_)))
        });

        client.roundtrip().unwrap();
        client.roundtrip().unwrap();
        assert!(!client.is_failed());
        drop(client);
        assert_eq!(handle.join().unwrap(), Some(true));
    }
}
