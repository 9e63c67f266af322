//! Async client session against a compositor.
//!
//! The engine never blocks on its own; this module parks on the socket with
//! tokio's [`AsyncFd`] and lets the connection read and dispatch whenever it
//! becomes ready.

use parking_lot::Mutex;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};
use wlwire_protocol::{Argument, Connection, Proxy, Side, core_interfaces, socket};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("compositor did not answer within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Wire(#[from] wlwire_protocol::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("request did not create a {0} object")]
    NoObject(&'static str),
}

/// A global advertised by the compositor's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

pub struct Session {
    conn: AsyncFd<Connection>,
    timeout: Duration,
}

impl Session {
    /// Wrap a connected socket. Must be called from within a tokio runtime.
    pub fn new(stream: UnixStream, timeout: Duration) -> Result<Self, ProbeError> {
        let conn = Connection::new(stream, core_interfaces::protocol(), Side::Client)?;
        Ok(Self {
            conn: AsyncFd::new(conn)?,
            timeout,
        })
    }

    /// Connect to `display`, or to whatever the environment names.
    pub fn connect(display: Option<&str>, timeout: Duration) -> Result<Self, ProbeError> {
        let stream = match display {
            Some(display) => socket::connect(Some(display))?,
            None => socket::connect_to_env()?,
        };
        Self::new(stream, timeout)
    }

    /// Dispatch until `done` holds, or give up after the session timeout.
    async fn drive_until(&mut self, done: impl Fn() -> bool) -> Result<(), ProbeError> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, drive(&mut self.conn, &done))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
    }

    /// Wait until the compositor has handled everything sent so far.
    pub async fn roundtrip(&mut self) -> Result<(), ProbeError> {
        let conn = self.conn.get_mut();
        let display = conn.display().clone();
        let callback = conn
            .send_request(&display, "sync", vec![Argument::new_id()])?
            .pop()
            .ok_or(ProbeError::NoObject(core_interfaces::WL_CALLBACK))?;

        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        conn.set_listener(&callback, "done", move |_, _| {
            flag.store(true, Ordering::Release);
        })?;

        self.drive_until(|| done.load(Ordering::Acquire)).await
    }

    /// Every global the registry advertises, ordered by name.
    pub async fn list_globals(&mut self) -> Result<Vec<Global>, ProbeError> {
        let conn = self.conn.get_mut();
        let display = conn.display().clone();
        let registry = conn
            .send_request(&display, "get_registry", vec![Argument::new_id()])?
            .pop()
            .ok_or(ProbeError::NoObject(core_interfaces::WL_REGISTRY))?;

        let globals: Arc<Mutex<Vec<Global>>> = Arc::default();
        watch_registry(conn, &registry, &globals)?;
        self.roundtrip().await?;

        let mut globals = std::mem::take(&mut *globals.lock());
        globals.sort_by_key(|g| g.name);
        debug!(count = globals.len(), "registry enumerated");
        Ok(globals)
    }

    /// Time `count` round trips.
    pub async fn ping(&mut self, count: u32) -> Result<Vec<Duration>, ProbeError> {
        let mut samples = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let start = Instant::now();
            self.roundtrip().await?;
            samples.push(start.elapsed());
        }
        Ok(samples)
    }
}

async fn drive(conn: &mut AsyncFd<Connection>, done: &impl Fn() -> bool) -> Result<(), ProbeError> {
    loop {
        conn.get_mut().dispatch_pending()?;
        if done() {
            return Ok(());
        }
        if !conn.get_mut().flush()? {
            let mut guard = conn.writable_mut().await?;
            guard.clear_ready();
            continue;
        }
        let mut guard = conn.readable_mut().await?;
        let dispatched = guard.get_inner_mut().process()?;
        trace!(dispatched, "processed input");
        // process() drains the socket until it would block
        guard.clear_ready();
    }
}

fn watch_registry(
    conn: &mut Connection,
    registry: &Proxy,
    globals: &Arc<Mutex<Vec<Global>>>,
) -> Result<(), ProbeError> {
    let added = globals.clone();
    conn.set_listener(registry, "global", move |_, message| {
        let (Some(name), Some(interface), Some(version)) = (
            message.uint("name"),
            message.str("interface"),
            message.uint("version"),
        ) else {
            return;
        };
        added.lock().push(Global {
            name,
            interface: interface.to_string(),
            version,
        });
    })?;

    let removed = globals.clone();
    conn.set_listener(registry, "global_remove", move |_, message| {
        if let Some(name) = message.uint("name") {
            removed.lock().retain(|g| g.name != name);
        }
    })?;
    Ok(())
}
