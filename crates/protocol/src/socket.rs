//! Locating and connecting to the compositor socket.

use std::env;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Error;

/// Display name used when `WAYLAND_DISPLAY` is unset.
pub const DEFAULT_DISPLAY: &str = "wayland-0";

/// Environment variable naming the display socket.
pub const DISPLAY_ENV_VAR: &str = "WAYLAND_DISPLAY";

/// Environment variable carrying an already-connected socket descriptor.
pub const SOCKET_ENV_VAR: &str = "WAYLAND_SOCKET";

/// Directory the display socket lives in.
pub const RUNTIME_DIR_ENV_VAR: &str = "XDG_RUNTIME_DIR";

/// The display name from the environment, or [`DEFAULT_DISPLAY`].
#[must_use]
pub fn display_name() -> String {
    env::var(DISPLAY_ENV_VAR)
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_DISPLAY.to_string())
}

/// Resolve a display name against a runtime directory.
///
/// An absolute display name is a socket path already and is used as-is.
pub fn socket_path_in(runtime_dir: Option<&Path>, display: &str) -> Result<PathBuf, Error> {
    let display = Path::new(display);
    if display.is_absolute() {
        return Ok(display.to_path_buf());
    }
    let runtime_dir = runtime_dir.ok_or(Error::NoRuntimeDir)?;
    Ok(runtime_dir.join(display))
}

/// Socket path for `display`, or for the environment's display if `None`.
///
/// Resolution order:
/// 1. an absolute display name
/// 2. `$XDG_RUNTIME_DIR/<display>`
pub fn socket_path(display: Option<&str>) -> Result<PathBuf, Error> {
    let display = display.map_or_else(display_name, str::to_string);
    let runtime_dir = env::var_os(RUNTIME_DIR_ENV_VAR).map(PathBuf::from);
    socket_path_in(runtime_dir.as_deref(), &display)
}

/// Connect to a display by name (see [`socket_path`]).
pub fn connect(display: Option<&str>) -> Result<UnixStream, Error> {
    let path = socket_path(display)?;
    debug!(path = %path.display(), "connecting");
    UnixStream::connect(&path).map_err(|source| Error::Connect { path, source })
}

/// Connect the way clients launched by a compositor are expected to.
///
/// A descriptor in `WAYLAND_SOCKET` takes precedence over the display name.
pub fn connect_to_env() -> Result<UnixStream, Error> {
    match env::var(SOCKET_ENV_VAR) {
        Ok(value) => inherited_socket(&value),
        Err(_) => connect(None),
    }
}

fn inherited_socket(value: &str) -> Result<UnixStream, Error> {
    let fd: RawFd = value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidSocketFd(value.to_string()))?;
    if fd < 0 {
        return Err(Error::InvalidSocketFd(value.to_string()));
    }
    // SAFETY: F_GETFD/F_SETFD only inspect and set descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Error::InvalidSocketFd(value.to_string()));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(Error::InvalidSocketFd(value.to_string()));
    }
    debug!(fd, "using inherited socket");
    // SAFETY: the descriptor was handed to this process to own.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}
