//! wlwire Protocol - a from-scratch implementation of the Wayland wire protocol.
//!
//! This crate provides:
//! - The wire codec for the protocol's argument types ([`wire`])
//! - A runtime schema of interfaces, requests, events and enums ([`Protocol`])
//! - Framing and `SCM_RIGHTS` descriptor passing over a Unix socket
//! - An object registry with client/server id partitioning
//! - The dispatch engine, [`Connection`], driving both ends of a connection
//! - The built-in core interfaces ([`core_interfaces`])
//! - Socket discovery via `WAYLAND_SOCKET`, `WAYLAND_DISPLAY` and
//!   `XDG_RUNTIME_DIR` ([`socket`])
//!
//! # Wire Format
//!
//! Every message is an 8-byte header (object id, then opcode in the low and
//! total size in the high 16 bits of the second word) followed by 4-byte
//! aligned arguments, all in native byte order. Descriptors travel out of
//! band as ancillary data.
//!
//! # Example
//!
//! ```no_run
//! use wlwire_protocol::{Argument, Connection, core_interfaces};
//!
//! let mut conn = Connection::connect_to_env(core_interfaces::protocol())?;
//! let display = conn.display().clone();
//! let registry = conn
//!     .send_request(&display, "get_registry", vec![Argument::new_id()])?
//!     .remove(0);
//! conn.set_listener(&registry, "global", |_, message| {
//!     println!(
//!         "{} {} v{}",
//!         message.uint("name").unwrap_or_default(),
//!         message.str("interface").unwrap_or_default(),
//!         message.uint("version").unwrap_or_default(),
//!     );
//! })?;
//! conn.roundtrip()?;
//! # Ok::<(), wlwire_protocol::Error>(())
//! ```

mod connection;
pub mod core_interfaces;
mod error;
mod proxy;
mod registry;
pub mod schema;
pub mod socket;
mod transport;
pub mod wire;

// Re-export main types at crate root
pub use connection::{Connection, EventQueue, Interest, Listener, Message};
pub use error::{Error, ProtocolError};
pub use proxy::{ConnectionId, Proxy};
pub use registry::{IdAllocator, Side};
pub use schema::{
    ArgKind, ArgSpec, Description, Direction, EnumEntry, EnumSpec, Interface, MessageSpec,
    Protocol, SchemaError,
};
pub use wire::{Argument, DecodeError, EncodeError, Fixed, NewId, ObjectId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reexports_accessible() {
        let _ = Argument::new_id();
        let _ = ObjectId::DISPLAY;
        let _ = Interest::READABLE | Interest::WRITABLE;
        let _ = Side::Client;
        let _ = wire::MAX_MESSAGE_SIZE;
        let _ = socket::DEFAULT_DISPLAY;
    }

    #[test]
    fn test_protocol_constants() {
        const {
            assert!(wire::HEADER_SIZE == 8);
            assert!(wire::MAX_MESSAGE_SIZE == 4096);
            assert!(wire::MAX_FDS_OUT == 28);
            assert!(wire::SERVER_ID_START == 0xff00_0000);
            assert!(wire::DISPLAY_ID == 1);
        }
    }
}
