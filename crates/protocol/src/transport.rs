//! Framed byte stream over a Unix socket, with descriptor passing.
//!
//! Outgoing frames are queued whole and written with one `sendmsg(2)` per
//! frame so that a frame's descriptors travel in exactly one `SCM_RIGHTS`
//! block. Incoming bytes and descriptors are buffered separately; frames are
//! cut from the byte buffer and claim descriptors from the front of the
//! descriptor queue as the codec decodes them.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::ptr;
use tracing::trace;

use crate::error::Error;
use crate::wire::{DecodeError, HEADER_SIZE, MessageHeader, ObjectId};

/// Bytes requested per `recvmsg(2)` call.
const READ_CHUNK: usize = 4096;

/// Control buffer for incoming descriptors, in u64 words for alignment.
const CMSG_BUF_WORDS: usize = 64;

/// A complete incoming frame.
#[derive(Debug)]
pub(crate) struct Frame {
    pub object: ObjectId,
    pub opcode: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

struct OutFrame {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
    written: usize,
}

pub(crate) struct Transport {
    stream: UnixStream,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_fds: VecDeque<OwnedFd>,
    out: VecDeque<OutFrame>,
    closed: bool,
}

/// Map socket errors that mean the peer is gone to [`Error::ConnectionLost`].
fn classify(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected => Error::ConnectionLost(Some(err)),
        _ => Error::Io(err),
    }
}

impl Transport {
    /// Take over a connected socket, switching it to non-blocking mode.
    pub fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            in_buf: Vec::with_capacity(READ_CHUNK),
            in_pos: 0,
            in_fds: VecDeque::new(),
            out: VecDeque::new(),
            closed: false,
        })
    }

    /// Queue one frame for sending. Nothing is written until [`Self::flush`].
    pub fn queue(&mut self, header: MessageHeader, payload: &[u8], fds: Vec<OwnedFd>) {
        let mut bytes = Vec::with_capacity(header.size);
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(payload);
        self.out.push_back(OutFrame {
            bytes,
            fds,
            written: 0,
        });
    }

    pub fn has_pending_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// Write queued frames until the queue is empty or the socket is full.
    ///
    /// Returns `true` once everything has been written.
    pub fn flush(&mut self) -> Result<bool, Error> {
        while let Some(frame) = self.out.front_mut() {
            let pending = &frame.bytes[frame.written..];
            match send_with_fds(self.stream.as_raw_fd(), pending, &frame.fds) {
                Ok(n) => {
                    trace!(bytes = n, fds = frame.fds.len(), "sent");
                    // The kernel holds its own references once the first byte is out
                    frame.fds.clear();
                    frame.written += n;
                    if frame.written == frame.bytes.len() {
                        self.out.pop_front();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(true)
    }

    /// Read everything the socket has to offer without blocking.
    ///
    /// Returns the number of bytes read. An orderly shutdown by the peer sets
    /// [`Self::is_closed`]; frames already buffered stay readable.
    pub fn fill(&mut self) -> Result<usize, Error> {
        if self.in_pos > 0 {
            self.in_buf.drain(..self.in_pos);
            self.in_pos = 0;
        }
        let mut total = 0;
        while !self.closed {
            match self.recv_chunk() {
                Ok(0) => {
                    trace!("peer closed the socket");
                    self.closed = true;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(total)
    }

    fn recv_chunk(&mut self) -> io::Result<usize> {
        let mut buf = [0u8; READ_CHUNK];
        let mut cmsg_buf = [0u64; CMSG_BUF_WORDS];
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        // SAFETY: msghdr is plain data; all-zero is a valid empty header.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = mem::size_of_val(&cmsg_buf) as _;

        // SAFETY: msg points at live buffers for the duration of the call.
        let n = unsafe {
            libc::recvmsg(
                self.stream.as_raw_fd(),
                &mut msg,
                libc::MSG_CMSG_CLOEXEC | libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        let received_fds = self.in_fds.len();
        // SAFETY: the kernel filled msg_control with well-formed cmsg headers
        // and each SCM_RIGHTS payload holds descriptors now owned by us.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    let len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    for i in 0..len / mem::size_of::<RawFd>() {
                        let fd = ptr::read_unaligned(data.add(i));
                        self.in_fds.push_back(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(io::Error::other("ancillary data truncated"));
        }

        let n = n as usize;
        self.in_buf.extend_from_slice(&buf[..n]);
        if n > 0 {
            trace!(bytes = n, fds = self.in_fds.len() - received_fds, "received");
        }
        Ok(n)
    }

    /// Cut the next complete frame from the receive buffer.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        let buffered = &self.in_buf[self.in_pos..];
        let Some(header) = MessageHeader::parse(buffered) else {
            return Ok(None);
        };
        if header.size < HEADER_SIZE || header.size % 4 != 0 {
            return Err(Error::Framing(DecodeError::BadFrameSize { size: header.size }));
        }
        if buffered.len() < header.size {
            return Ok(None);
        }
        let payload = buffered[HEADER_SIZE..header.size].to_vec();
        self.in_pos += header.size;
        Ok(Some(Frame {
            object: header.object,
            opcode: header.opcode,
            payload,
        }))
    }

    /// Hand out up to `count` received descriptors, oldest first.
    pub fn take_fds(&mut self, count: usize) -> VecDeque<OwnedFd> {
        let count = count.min(self.in_fds.len());
        self.in_fds.drain(..count).collect()
    }

    /// Whether the peer has shut the socket down.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether a partial frame is still sitting in the receive buffer.
    pub fn has_partial_input(&self) -> bool {
        self.in_pos < self.in_buf.len()
    }
}

impl AsFd for Transport {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

fn send_with_fds(socket: RawFd, bytes: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };
    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    let mut cmsg_buf: Vec<u64> = Vec::new();
    if !raw.is_empty() {
        let fd_bytes = (raw.len() * mem::size_of::<RawFd>()) as u32;
        // SAFETY: cmsg_buf is sized by CMSG_SPACE and u64-aligned, so the
        // first header and its payload fit inside it.
        unsafe {
            let space = libc::CMSG_SPACE(fd_bytes) as usize;
            cmsg_buf.resize(space.div_ceil(mem::size_of::<u64>()), 0);
            msg.msg_control = cmsg_buf.as_mut_ptr().cast();
            msg.msg_controllen = space as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_bytes) as _;
            ptr::copy_nonoverlapping(raw.as_ptr(), libc::CMSG_DATA(cmsg).cast::<RawFd>(), raw.len());
        }
    }

    // SAFETY: msg points at live buffers for the duration of the call.
    let n = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
