//! The interfaces every connection relies on: `wl_display`, `wl_registry`
//! and `wl_callback`.
//!
//! These are frozen by the protocol and the engine uses them itself
//! (`delete_id`, fatal errors, round trips), so they are built in rather than
//! loaded. Application protocols are merged on top with [`Protocol::extend`].

use crate::schema::{ArgSpec, EnumSpec, Interface, MessageSpec, Protocol};

pub const WL_DISPLAY: &str = "wl_display";
pub const WL_REGISTRY: &str = "wl_registry";
pub const WL_CALLBACK: &str = "wl_callback";

/// `wl_display` request opcodes.
pub mod display {
    pub const SYNC: u16 = 0;
    pub const GET_REGISTRY: u16 = 1;

    /// Event opcodes.
    pub const ERROR: u16 = 0;
    pub const DELETE_ID: u16 = 1;

    /// Codes of the `error` enum.
    pub const INVALID_OBJECT: u32 = 0;
    pub const INVALID_METHOD: u32 = 1;
    pub const NO_MEMORY: u32 = 2;
    pub const IMPLEMENTATION: u32 = 3;
}

#[must_use]
pub fn wl_display() -> Interface {
    Interface::new(WL_DISPLAY, 1)
        .with_request(MessageSpec::new("sync").arg(ArgSpec::new_id("callback", WL_CALLBACK)))
        .with_request(MessageSpec::new("get_registry").arg(ArgSpec::new_id("registry", WL_REGISTRY)))
        .with_event(
            MessageSpec::new("error")
                .arg(ArgSpec::object("object_id"))
                .arg(ArgSpec::uint("code"))
                .arg(ArgSpec::string("message")),
        )
        .with_event(MessageSpec::new("delete_id").arg(ArgSpec::uint("id")))
        .with_enum(
            EnumSpec::new("error")
                .entry("invalid_object", display::INVALID_OBJECT)
                .entry("invalid_method", display::INVALID_METHOD)
                .entry("no_memory", display::NO_MEMORY)
                .entry("implementation", display::IMPLEMENTATION),
        )
}

#[must_use]
pub fn wl_registry() -> Interface {
    Interface::new(WL_REGISTRY, 1)
        .with_request(
            MessageSpec::new("bind")
                .arg(ArgSpec::uint("name"))
                .arg(ArgSpec::dynamic_new_id("id")),
        )
        .with_event(
            MessageSpec::new("global")
                .arg(ArgSpec::uint("name"))
                .arg(ArgSpec::string("interface"))
                .arg(ArgSpec::uint("version")),
        )
        .with_event(MessageSpec::new("global_remove").arg(ArgSpec::uint("name")))
}

#[must_use]
pub fn wl_callback() -> Interface {
    Interface::new(WL_CALLBACK, 1).with_event(
        MessageSpec::new("done")
            .destructor()
            .arg(ArgSpec::uint("callback_data")),
    )
}

/// A protocol set holding only the core interfaces.
#[must_use]
pub fn protocol() -> Protocol {
    let mut protocol = Protocol::new("wayland");
    protocol.insert(wl_display());
    protocol.insert(wl_registry());
    protocol.insert(wl_callback());
    protocol
}
