//! Runtime protocol schema: interfaces, their messages and argument signatures.
//!
//! The schema is produced by an external loader (the XML parser lives outside
//! this crate) and is read-only once it has been handed to a connection. Each
//! [`Interface`] builds its name → opcode tables when it is constructed, so
//! dispatch by name never scans the message lists.
//!
//! Schemas can cross the loader boundary as a [bincode](https://docs.rs/bincode)
//! blob via [`Protocol::to_bytes`] and [`Protocol::from_bytes`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for schema construction and lookup.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Two interfaces with the same name were loaded into one protocol set.
    #[error("duplicate interface name: {0}")]
    DuplicateInterface(String),

    /// An argument refers to an interface the protocol set does not contain.
    #[error("{message} references unknown interface {interface}")]
    UnknownInterface {
        /// `interface.message` that holds the reference.
        message: String,
        /// The missing interface name.
        interface: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// The kind of a single argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// Signed 32-bit integer.
    Int,
    /// Unsigned 32-bit integer.
    Uint,
    /// Signed 24.8 fixed-point number.
    Fixed,
    /// Length-prefixed, NUL-terminated UTF-8 string.
    String,
    /// Reference to an existing object.
    Object,
    /// Identifier of an object created by this message.
    NewId,
    /// Length-prefixed byte array.
    Array,
    /// File descriptor, carried out of band.
    Fd,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Uint => "uint",
            Self::Fixed => "fixed",
            Self::String => "string",
            Self::Object => "object",
            Self::NewId => "new_id",
            Self::Array => "array",
            Self::Fd => "fd",
        };
        f.write_str(name)
    }
}

/// Which message table of an interface is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Messages sent by the client to the server.
    Request,
    /// Messages sent by the server to the client.
    Event,
}

/// Documentation carried over from the protocol document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    /// One-line summary.
    pub summary: Option<String>,
    /// Full text, if the document has one.
    pub text: Option<String>,
}

impl Description {
    #[must_use]
    pub fn summary(summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            text: None,
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// One typed slot of a message signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Argument name, used in diagnostics and [`crate::Message::arg`].
    pub name: String,
    /// Wire type of the slot.
    pub kind: ArgKind,
    /// Interface of an `object` or `new_id` slot.
    ///
    /// A `new_id` slot without an interface is *dynamic*: the interface name
    /// and version travel on the wire in front of the id.
    #[serde(default)]
    pub interface: Option<String>,
    /// Whether a null string or null object is accepted.
    #[serde(default)]
    pub allow_null: bool,
    /// Enum the value belongs to, for diagnostics.
    #[serde(default)]
    pub enum_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ArgSpec {
    /// Create a slot of the given kind.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ArgKind) -> Self {
        Self {
            name: name.into(),
            kind,
            interface: None,
            allow_null: false,
            enum_name: None,
            summary: None,
        }
    }

    #[must_use]
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Int)
    }

    #[must_use]
    pub fn uint(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Uint)
    }

    #[must_use]
    pub fn fixed(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Fixed)
    }

    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::String)
    }

    /// An untyped object reference; use [`ArgSpec::of_interface`] to type it.
    #[must_use]
    pub fn object(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Object)
    }

    /// A `new_id` slot whose interface is fixed by the schema.
    #[must_use]
    pub fn new_id(name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self::new(name, ArgKind::NewId).of_interface(interface)
    }

    /// A `new_id` slot whose interface is chosen by the sender at call time.
    #[must_use]
    pub fn dynamic_new_id(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::NewId)
    }

    #[must_use]
    pub fn array(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Array)
    }

    #[must_use]
    pub fn fd(name: impl Into<String>) -> Self {
        Self::new(name, ArgKind::Fd)
    }

    /// Restrict an object slot (or fix a new_id slot) to one interface.
    #[must_use]
    pub fn of_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Accept null values in this slot.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    /// Tag the slot with the enum its values come from.
    #[must_use]
    pub fn with_enum(mut self, enum_name: impl Into<String>) -> Self {
        self.enum_name = Some(enum_name.into());
        self
    }

    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Whether this is a `new_id` slot without a schema-fixed interface.
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.kind == ArgKind::NewId && self.interface.is_none()
    }
}

fn default_since() -> u32 {
    1
}

/// A request or event: a name plus an ordered argument signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSpec {
    pub name: String,
    /// First interface version that carries this message.
    #[serde(default = "default_since")]
    pub since: u32,
    /// The message destroys the object it is sent on.
    #[serde(default)]
    pub destructor: bool,
    /// Receiving this message without a registered listener is an error.
    #[serde(default)]
    pub requires_handler: bool,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub description: Option<Description>,
}

impl MessageSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            since: 1,
            destructor: false,
            requires_handler: false,
            args: Vec::new(),
            description: None,
        }
    }

    /// Append an argument slot.
    #[must_use]
    pub fn arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    #[must_use]
    pub fn since(mut self, version: u32) -> Self {
        self.since = version;
        self
    }

    #[must_use]
    pub fn destructor(mut self) -> Self {
        self.destructor = true;
        self
    }

    #[must_use]
    pub fn requires_handler(mut self) -> Self {
        self.requires_handler = true;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Description) -> Self {
        self.description = Some(description);
        self
    }

    /// Number of descriptor slots, i.e. how many fds one frame carries.
    #[must_use]
    pub fn fd_count(&self) -> usize {
        self.args.iter().filter(|a| a.kind == ArgKind::Fd).count()
    }
}

/// One named value of an enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumEntry {
    pub name: String,
    pub value: u32,
    #[serde(default = "default_since")]
    pub since: u32,
    #[serde(default)]
    pub summary: Option<String>,
}

/// An enum declared by an interface.
///
/// The engine only reads it to name error codes; callers use it to map
/// between entry names and wire values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumSpec {
    pub name: String,
    #[serde(default = "default_since")]
    pub since: u32,
    #[serde(default)]
    pub bitfield: bool,
    #[serde(default)]
    pub entries: Vec<EnumEntry>,
    #[serde(default)]
    pub description: Option<Description>,
}

impl EnumSpec {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            since: 1,
            bitfield: false,
            entries: Vec::new(),
            description: None,
        }
    }

    #[must_use]
    pub fn bitfield(mut self) -> Self {
        self.bitfield = true;
        self
    }

    #[must_use]
    pub fn entry(mut self, name: impl Into<String>, value: u32) -> Self {
        self.entries.push(EnumEntry {
            name: name.into(),
            value,
            since: 1,
            summary: None,
        });
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Description) -> Self {
        self.description = Some(description);
        self
    }

    /// Wire value of the entry called `name`.
    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<u32> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.value)
    }

    /// Symbolic name of `value`, if it is one of the entries.
    #[must_use]
    pub fn name_of(&self, value: u32) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.value == value)
            .map(|e| e.name.as_str())
    }
}

/// Plain data form of an [`Interface`], as it crosses the serde boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct InterfaceDef {
    name: String,
    version: u32,
    #[serde(default)]
    requests: Vec<MessageSpec>,
    #[serde(default)]
    events: Vec<MessageSpec>,
    #[serde(default)]
    enums: Vec<EnumSpec>,
    #[serde(default)]
    description: Option<Description>,
}

/// A named, versioned set of request and event signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "InterfaceDef", into = "InterfaceDef")]
pub struct Interface {
    name: String,
    version: u32,
    requests: Vec<MessageSpec>,
    events: Vec<MessageSpec>,
    enums: Vec<EnumSpec>,
    description: Option<Description>,
    request_opcodes: HashMap<String, u16>,
    event_opcodes: HashMap<String, u16>,
}

impl Interface {
    /// Create an interface with no messages.
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            requests: Vec::new(),
            events: Vec::new(),
            enums: Vec::new(),
            description: None,
            request_opcodes: HashMap::new(),
            event_opcodes: HashMap::new(),
        }
    }

    /// Append a request; its opcode is its position.
    #[must_use]
    pub fn with_request(mut self, request: MessageSpec) -> Self {
        self.request_opcodes
            .insert(request.name.clone(), self.requests.len() as u16);
        self.requests.push(request);
        self
    }

    /// Append an event; its opcode is its position.
    #[must_use]
    pub fn with_event(mut self, event: MessageSpec) -> Self {
        self.event_opcodes
            .insert(event.name.clone(), self.events.len() as u16);
        self.events.push(event);
        self
    }

    #[must_use]
    pub fn with_enum(mut self, spec: EnumSpec) -> Self {
        self.enums.push(spec);
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: Description) -> Self {
        self.description = Some(description);
        self
    }

    #[must_use]
    pub fn description(&self) -> Option<&Description> {
        self.description.as_ref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn requests(&self) -> &[MessageSpec] {
        &self.requests
    }

    #[must_use]
    pub fn events(&self) -> &[MessageSpec] {
        &self.events
    }

    #[must_use]
    pub fn enums(&self) -> &[EnumSpec] {
        &self.enums
    }

    /// The message table for one direction.
    #[must_use]
    pub fn messages(&self, direction: Direction) -> &[MessageSpec] {
        match direction {
            Direction::Request => &self.requests,
            Direction::Event => &self.events,
        }
    }

    /// Signature lookup by opcode.
    #[must_use]
    pub fn message(&self, direction: Direction, opcode: u16) -> Option<&MessageSpec> {
        self.messages(direction).get(usize::from(opcode))
    }

    /// Opcode lookup by message name.
    #[must_use]
    pub fn opcode(&self, direction: Direction, name: &str) -> Option<u16> {
        let table = match direction {
            Direction::Request => &self.request_opcodes,
            Direction::Event => &self.event_opcodes,
        };
        table.get(name).copied()
    }

    #[must_use]
    pub fn request(&self, opcode: u16) -> Option<&MessageSpec> {
        self.message(Direction::Request, opcode)
    }

    #[must_use]
    pub fn event(&self, opcode: u16) -> Option<&MessageSpec> {
        self.message(Direction::Event, opcode)
    }

    #[must_use]
    pub fn enum_spec(&self, name: &str) -> Option<&EnumSpec> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Symbolic name of `value` in enum `enum_name`, for diagnostics.
    #[must_use]
    pub fn enum_entry_name(&self, enum_name: &str, value: u32) -> Option<&str> {
        self.enum_spec(enum_name)?.name_of(value)
    }

    /// Wire value of entry `entry` in enum `enum_name`.
    #[must_use]
    pub fn enum_value(&self, enum_name: &str, entry: &str) -> Option<u32> {
        self.enum_spec(enum_name)?.value_of(entry)
    }
}

impl From<InterfaceDef> for Interface {
    fn from(def: InterfaceDef) -> Self {
        let mut interface = Interface::new(def.name, def.version);
        for request in def.requests {
            interface = interface.with_request(request);
        }
        for event in def.events {
            interface = interface.with_event(event);
        }
        interface.enums = def.enums;
        interface.description = def.description;
        interface
    }
}

impl From<Interface> for InterfaceDef {
    fn from(interface: Interface) -> Self {
        Self {
            name: interface.name,
            version: interface.version,
            requests: interface.requests,
            events: interface.events,
            enums: interface.enums,
            description: interface.description,
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A set of interfaces, usually one protocol document plus its parents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Protocol {
    name: String,
    #[serde(default)]
    copyright: Option<String>,
    interfaces: BTreeMap<String, Arc<Interface>>,
}

impl Protocol {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            copyright: None,
            interfaces: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_copyright(mut self, copyright: impl Into<String>) -> Self {
        self.copyright = Some(copyright.into());
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn copyright(&self) -> Option<&str> {
        self.copyright.as_deref()
    }

    /// Add an interface, rejecting a name that is already present.
    pub fn add(&mut self, interface: Interface) -> Result<(), SchemaError> {
        if self.interfaces.contains_key(interface.name()) {
            return Err(SchemaError::DuplicateInterface(interface.name().to_string()));
        }
        self.interfaces
            .insert(interface.name().to_string(), Arc::new(interface));
        Ok(())
    }

    /// Insert an interface whose name is known to be unique.
    pub(crate) fn insert(&mut self, interface: Interface) {
        self.interfaces
            .insert(interface.name().to_string(), Arc::new(interface));
    }

    /// Builder form of [`Protocol::add`].
    pub fn with_interface(mut self, interface: Interface) -> Result<Self, SchemaError> {
        self.add(interface)?;
        Ok(self)
    }

    /// Merge the interfaces of another protocol document into this set.
    ///
    /// Nothing is merged if any name collides.
    pub fn extend(&mut self, other: Protocol) -> Result<(), SchemaError> {
        if let Some(name) = other
            .interfaces
            .keys()
            .find(|name| self.interfaces.contains_key(*name))
        {
            return Err(SchemaError::DuplicateInterface(name.clone()));
        }
        self.interfaces.extend(other.interfaces);
        Ok(())
    }

    #[must_use]
    pub fn interface(&self, name: &str) -> Option<&Arc<Interface>> {
        self.interfaces.get(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Arc<Interface>> {
        self.interfaces.values()
    }

    /// Check that every interface named by an argument slot is present.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for interface in self.interfaces.values() {
            let messages = interface.requests().iter().chain(interface.events());
            for message in messages {
                for arg in &message.args {
                    if let Some(target) = &arg.interface {
                        if !self.interfaces.contains_key(target) {
                            return Err(SchemaError::UnknownInterface {
                                message: format!("{}.{}", interface.name(), message.name),
                                interface: target.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize this protocol set to bytes using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SchemaError> {
        bincode::serialize(self).map_err(Into::into)
    }

    /// Deserialize a protocol set from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}
