//! Wire codec for the protocol's fixed set of argument types.
//!
//! All values are encoded in native byte order. Strings and arrays carry a
//! 4-byte length prefix and are zero-padded to a 4-byte boundary. File
//! descriptors contribute nothing to the payload: they are moved into a side
//! list, in signature order, which the transport sends as ancillary data.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use thiserror::Error;

use crate::schema::{ArgKind, ArgSpec};

/// Size of a frame header: object id plus the size/opcode word.
pub const HEADER_SIZE: usize = 8;

/// Largest frame the peer is guaranteed to accept.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Most descriptors that may accompany a single frame.
pub const MAX_FDS_OUT: usize = 28;

/// First id of the range allocated by the server.
pub const SERVER_ID_START: u32 = 0xff00_0000;

/// Id of the display singleton on every connection.
pub const DISPLAY_ID: u32 = 1;

/// Numeric identifier of a protocol object. `0` means "no object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId(u32);

impl ObjectId {
    /// The null object.
    pub const NULL: Self = Self(0);

    /// The display singleton, always the first object of a connection.
    pub const DISPLAY: Self = Self(DISPLAY_ID);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the id lies in the server-allocated range.
    #[must_use]
    pub const fn is_server_allocated(self) -> bool {
        self.0 >= SERVER_ID_START
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signed 24.8 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Self = Self(0);

    /// Wrap the raw 32-bit wire representation.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn to_raw(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn from_int(value: i32) -> Self {
        Self(value.wrapping_mul(256))
    }

    /// Integer part, rounded towards negative infinity.
    #[must_use]
    pub const fn to_int(self) -> i32 {
        self.0 >> 8
    }

    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self((value * 256.0).round() as i32)
    }

    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / 256.0
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// Value of a `new_id` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewId {
    /// The new object's id. Left null by callers; the connection fills it in.
    pub id: ObjectId,
    /// Interface name and version, present for dynamic slots only.
    pub dynamic: Option<(String, u32)>,
}

/// A decoded (or to-be-encoded) argument value.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    /// `None` is the null string.
    Str(Option<String>),
    /// [`ObjectId::NULL`] is the null object.
    Object(ObjectId),
    NewId(NewId),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

impl Argument {
    /// Placeholder for a schema-typed `new_id` slot.
    #[must_use]
    pub fn new_id() -> Self {
        Self::NewId(NewId {
            id: ObjectId::NULL,
            dynamic: None,
        })
    }

    /// Placeholder for a dynamic `new_id` slot.
    #[must_use]
    pub fn new_dynamic(interface: impl Into<String>, version: u32) -> Self {
        Self::NewId(NewId {
            id: ObjectId::NULL,
            dynamic: Some((interface.into(), version)),
        })
    }

    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::Str(Some(value.into()))
    }

    /// The wire kind this value encodes as.
    #[must_use]
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Int(_) => ArgKind::Int,
            Self::Uint(_) => ArgKind::Uint,
            Self::Fixed(_) => ArgKind::Fixed,
            Self::Str(_) => ArgKind::String,
            Self::Object(_) => ArgKind::Object,
            Self::NewId(_) => ArgKind::NewId,
            Self::Array(_) => ArgKind::Array,
            Self::Fd(_) => ArgKind::Fd,
        }
    }
}

// Descriptors compare by number: a value that went through the codec keeps
// the very same descriptor.
impl PartialEq for Argument {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Uint(a), Self::Uint(b)) => a == b,
            (Self::Fixed(a), Self::Fixed(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::NewId(a), Self::NewId(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Fd(a), Self::Fd(b)) => a.as_raw_fd() == b.as_raw_fd(),
            _ => false,
        }
    }
}

/// Error produced while encoding arguments. Never fatal to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("expected {expected} arguments, got {found}")]
    ArgumentCount { expected: usize, found: usize },

    #[error("argument {arg}: expected {expected}, got {found}")]
    KindMismatch {
        arg: String,
        expected: ArgKind,
        found: ArgKind,
    },

    #[error("argument {arg} may not be null")]
    UnexpectedNull { arg: String },

    #[error("argument {arg} contains a NUL byte")]
    InteriorNul { arg: String },

    #[error("argument {arg} needs an interface name and version")]
    MissingInterface { arg: String },

    #[error("message of {size} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    TooLarge { size: usize },

    #[error("{count} descriptors exceed the per-message limit of {MAX_FDS_OUT}")]
    TooManyFds { count: usize },
}

/// Error produced while decoding a frame. Always fatal to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("argument {arg} needs {needed} bytes, {remaining} left in frame")]
    Truncated {
        arg: String,
        needed: usize,
        remaining: usize,
    },

    #[error("argument {arg} is not valid UTF-8")]
    InvalidUtf8 { arg: String },

    #[error("argument {arg} is missing its NUL terminator")]
    MissingTerminator { arg: String },

    #[error("argument {arg} may not be null")]
    UnexpectedNull { arg: String },

    #[error("no descriptor received for argument {arg}")]
    MissingFd { arg: String },

    #[error("{count} bytes left over after the last argument")]
    TrailingBytes { count: usize },

    #[error("invalid frame size {size}")]
    BadFrameSize { size: usize },
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub object: ObjectId,
    pub opcode: u16,
    /// Total frame size, header included.
    pub size: usize,
}

impl MessageHeader {
    /// Serialize the header. `size` must fit in 16 bits.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let word = ((self.size as u32) << 16) | u32::from(self.opcode);
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.object.raw().to_ne_bytes());
        buf[4..8].copy_from_slice(&word.to_ne_bytes());
        buf
    }

    /// Parse a header from the front of `buf`.
    ///
    /// Returns `None` if the buffer is too small.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let object = u32::from_ne_bytes(buf.get(0..4)?.try_into().ok()?);
        let word = u32::from_ne_bytes(buf.get(4..8)?.try_into().ok()?);
        Some(Self {
            object: ObjectId(object),
            opcode: (word & 0xffff) as u16,
            size: (word >> 16) as usize,
        })
    }
}

/// Length of `len` bytes once padded to a 4-byte boundary.
#[must_use]
pub const fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn put_blob(buf: &mut Vec<u8>, bytes: &[u8], terminate: bool) {
    let len = bytes.len() + usize::from(terminate);
    put_u32(buf, len as u32);
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + padded_len(len) - bytes.len(), 0);
}

fn put_string(buf: &mut Vec<u8>, arg: &str, value: &str) -> Result<(), EncodeError> {
    if value.contains('\0') {
        return Err(EncodeError::InteriorNul {
            arg: arg.to_string(),
        });
    }
    put_blob(buf, value.as_bytes(), true);
    Ok(())
}

/// Encode `args` against `signature`, appending to `payload` and `fds`.
pub fn encode_args(
    signature: &[ArgSpec],
    args: Vec<Argument>,
    payload: &mut Vec<u8>,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(), EncodeError> {
    if args.len() != signature.len() {
        return Err(EncodeError::ArgumentCount {
            expected: signature.len(),
            found: args.len(),
        });
    }
    for (spec, arg) in signature.iter().zip(args) {
        encode_arg(spec, arg, payload, fds)?;
    }
    Ok(())
}

fn encode_arg(
    spec: &ArgSpec,
    arg: Argument,
    payload: &mut Vec<u8>,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(), EncodeError> {
    let null = || EncodeError::UnexpectedNull {
        arg: spec.name.clone(),
    };
    match (spec.kind, arg) {
        (ArgKind::Int, Argument::Int(v)) => payload.extend_from_slice(&v.to_ne_bytes()),
        (ArgKind::Uint, Argument::Uint(v)) => put_u32(payload, v),
        (ArgKind::Fixed, Argument::Fixed(v)) => payload.extend_from_slice(&v.to_raw().to_ne_bytes()),
        (ArgKind::String, Argument::Str(None)) => {
            if !spec.allow_null {
                return Err(null());
            }
            put_u32(payload, 0);
        }
        (ArgKind::String, Argument::Str(Some(s))) => put_string(payload, &spec.name, &s)?,
        (ArgKind::Object, Argument::Object(id)) => {
            if id.is_null() && !spec.allow_null {
                return Err(null());
            }
            put_u32(payload, id.raw());
        }
        (ArgKind::NewId, Argument::NewId(new_id)) => {
            if new_id.id.is_null() {
                return Err(null());
            }
            if spec.is_dynamic() {
                let Some((interface, version)) = new_id.dynamic else {
                    return Err(EncodeError::MissingInterface {
                        arg: spec.name.clone(),
                    });
                };
                put_string(payload, &spec.name, &interface)?;
                put_u32(payload, version);
            }
            put_u32(payload, new_id.id.raw());
        }
        (ArgKind::Array, Argument::Array(bytes)) => put_blob(payload, &bytes, false),
        (ArgKind::Fd, Argument::Fd(fd)) => fds.push_back(fd),
        (expected, arg) => {
            return Err(EncodeError::KindMismatch {
                arg: spec.name.clone(),
                expected,
                found: arg.kind(),
            });
        }
    }
    Ok(())
}

/// Cursor over a frame payload that refuses to read past its end.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, arg: &str) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated {
                arg: arg.to_string(),
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self, arg: &str) -> Result<u32, DecodeError> {
        let bytes = self.take(4, arg)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a length-prefixed blob, consuming its padding too.
    fn blob(&mut self, arg: &str) -> Result<&'a [u8], DecodeError> {
        let len = self.u32(arg)? as usize;
        let padded = self.take(padded_len(len), arg)?;
        Ok(&padded[..len])
    }

    fn string(&mut self, spec_name: &str) -> Result<Option<String>, DecodeError> {
        let bytes = self.blob(spec_name)?;
        let Some((&last, text)) = bytes.split_last() else {
            return Ok(None);
        };
        if last != 0 {
            return Err(DecodeError::MissingTerminator {
                arg: spec_name.to_string(),
            });
        }
        String::from_utf8(text.to_vec())
            .map(Some)
            .map_err(|_| DecodeError::InvalidUtf8 {
                arg: spec_name.to_string(),
            })
    }

    fn arg(&mut self, spec: &ArgSpec, fds: &mut VecDeque<OwnedFd>) -> Result<Argument, DecodeError> {
        let name = spec.name.as_str();
        let null = || DecodeError::UnexpectedNull {
            arg: name.to_string(),
        };
        let value = match spec.kind {
            ArgKind::Int => Argument::Int(self.u32(name)? as i32),
            ArgKind::Uint => Argument::Uint(self.u32(name)?),
            ArgKind::Fixed => Argument::Fixed(Fixed::from_raw(self.u32(name)? as i32)),
            ArgKind::String => {
                let value = self.string(name)?;
                if value.is_none() && !spec.allow_null {
                    return Err(null());
                }
                Argument::Str(value)
            }
            ArgKind::Object => {
                let id = ObjectId(self.u32(name)?);
                if id.is_null() && !spec.allow_null {
                    return Err(null());
                }
                Argument::Object(id)
            }
            ArgKind::NewId => {
                let dynamic = if spec.is_dynamic() {
                    let interface = self.string(name)?.ok_or_else(null)?;
                    Some((interface, self.u32(name)?))
                } else {
                    None
                };
                let id = ObjectId(self.u32(name)?);
                if id.is_null() {
                    return Err(null());
                }
                Argument::NewId(NewId { id, dynamic })
            }
            ArgKind::Array => Argument::Array(self.blob(name)?.to_vec()),
            ArgKind::Fd => Argument::Fd(fds.pop_front().ok_or_else(|| DecodeError::MissingFd {
                arg: name.to_string(),
            })?),
        };
        Ok(value)
    }
}

/// Decode a frame payload against `signature`, popping descriptors from `fds`.
///
/// The whole payload must be consumed.
pub fn decode_args(
    signature: &[ArgSpec],
    payload: &[u8],
    fds: &mut VecDeque<OwnedFd>,
) -> Result<Vec<Argument>, DecodeError> {
    let mut reader = Reader::new(payload);
    let mut args = Vec::with_capacity(signature.len());
    for spec in signature {
        args.push(reader.arg(spec, fds)?);
    }
    if reader.remaining() != 0 {
        return Err(DecodeError::TrailingBytes {
            count: reader.remaining(),
        });
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn encode(signature: &[ArgSpec], args: Vec<Argument>) -> (Vec<u8>, VecDeque<OwnedFd>) {
        let mut payload = Vec::new();
        let mut fds = VecDeque::new();
        encode_args(signature, args, &mut payload, &mut fds).unwrap();
        (payload, fds)
    }

    fn words(payload: &[u8]) -> Vec<u32> {
        payload
            .chunks(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_roundtrip_every_kind() {
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let fd = OwnedFd::from(a);
        let raw = fd.as_raw_fd();

        let signature = vec![
            ArgSpec::int("i"),
            ArgSpec::uint("u"),
            ArgSpec::fixed("f"),
            ArgSpec::string("s"),
            ArgSpec::string("null_s").nullable(),
            ArgSpec::object("o"),
            ArgSpec::object("null_o").nullable(),
            ArgSpec::new_id("n", "wl_callback"),
            ArgSpec::array("empty"),
            ArgSpec::array("bytes"),
            ArgSpec::fd("fd"),
        ];
        let args = vec![
            Argument::Int(i32::MIN),
            Argument::Uint(u32::MAX),
            Argument::Fixed(Fixed::from_f64(-1.5)),
            Argument::string("héllo"),
            Argument::Str(None),
            Argument::Object(ObjectId::new(7)),
            Argument::Object(ObjectId::NULL),
            Argument::NewId(NewId {
                id: ObjectId::new(0xff00_0001),
                dynamic: None,
            }),
            Argument::Array(Vec::new()),
            Argument::Array(vec![1, 2, 3, 4, 5]),
            Argument::Fd(fd),
        ];

        let (payload, mut fds) = encode(&signature, args);
        assert_eq!(fds.len(), 1);
        let decoded = decode_args(&signature, &payload, &mut fds).unwrap();
        assert!(fds.is_empty());

        assert_eq!(decoded[0], Argument::Int(i32::MIN));
        assert_eq!(decoded[1], Argument::Uint(u32::MAX));
        assert_eq!(decoded[2], Argument::Fixed(Fixed::from_f64(-1.5)));
        assert_eq!(decoded[3], Argument::string("héllo"));
        assert_eq!(decoded[4], Argument::Str(None));
        assert_eq!(decoded[5], Argument::Object(ObjectId::new(7)));
        assert_eq!(decoded[6], Argument::Object(ObjectId::NULL));
        assert_eq!(
            decoded[7],
            Argument::NewId(NewId {
                id: ObjectId::new(0xff00_0001),
                dynamic: None
            })
        );
        assert_eq!(decoded[8], Argument::Array(Vec::new()));
        assert_eq!(decoded[9], Argument::Array(vec![1, 2, 3, 4, 5]));
        match &decoded[10] {
            Argument::Fd(fd) => assert_eq!(fd.as_raw_fd(), raw),
            other => panic!("expected fd, got {other:?}"),
        }
    }

    #[test]
    fn test_string_layout() {
        let (payload, _) = encode(&[ArgSpec::string("s")], vec![Argument::string("abc")]);
        // "abc" + NUL fills exactly one word
        assert_eq!(payload.len(), 8);
        assert_eq!(words(&payload)[0], 4);
        assert_eq!(&payload[4..8], b"abc\0");

        let (payload, _) = encode(&[ArgSpec::string("s")], vec![Argument::string("abcd")]);
        assert_eq!(payload.len(), 12);
        assert_eq!(words(&payload)[0], 5);
        assert_eq!(&payload[4..12], b"abcd\0\0\0\0");

        let (payload, _) = encode(&[ArgSpec::string("s").nullable()], vec![Argument::Str(None)]);
        assert_eq!(payload, 0u32.to_ne_bytes());
    }

    #[test]
    fn test_padding_is_word_aligned() {
        for len in 0..=9 {
            let text = "x".repeat(len);
            let (payload, _) = encode(&[ArgSpec::string("s")], vec![Argument::string(text)]);
            assert_eq!(payload.len() % 4, 0, "string of {len}");

            let (payload, _) = encode(&[ArgSpec::array("a")], vec![Argument::Array(vec![9; len])]);
            assert_eq!(payload.len() % 4, 0, "array of {len}");
            assert_eq!(payload.len(), 4 + padded_len(len));
        }
    }

    #[test]
    fn test_dynamic_new_id_layout() {
        let signature = [ArgSpec::uint("name"), ArgSpec::dynamic_new_id("id")];
        let args = vec![
            Argument::Uint(3),
            Argument::NewId(NewId {
                id: ObjectId::new(5),
                dynamic: Some(("wl_shm".to_string(), 2)),
            }),
        ];
        let (payload, _) = encode(&signature, args);
        let w = words(&payload);
        assert_eq!(w[0], 3);
        assert_eq!(w[1], 7); // "wl_shm" + NUL
        assert_eq!(&payload[8..16], b"wl_shm\0\0");
        assert_eq!(w[4], 2);
        assert_eq!(w[5], 5);
        assert_eq!(payload.len(), 24);

        let decoded = decode_args(&signature, &payload, &mut VecDeque::new()).unwrap();
        assert_eq!(
            decoded[1],
            Argument::NewId(NewId {
                id: ObjectId::new(5),
                dynamic: Some(("wl_shm".to_string(), 2)),
            })
        );
    }

    #[test]
    fn test_dynamic_new_id_needs_interface() {
        let mut payload = Vec::new();
        let err = encode_args(
            &[ArgSpec::dynamic_new_id("id")],
            vec![Argument::NewId(NewId {
                id: ObjectId::new(4),
                dynamic: None,
            })],
            &mut payload,
            &mut VecDeque::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::MissingInterface { .. }));
    }

    #[test]
    fn test_encode_rejects_bad_arguments() {
        let mut payload = Vec::new();
        let mut fds = VecDeque::new();

        let err = encode_args(&[ArgSpec::uint("u")], vec![], &mut payload, &mut fds).unwrap_err();
        assert_eq!(err, EncodeError::ArgumentCount { expected: 1, found: 0 });

        let err = encode_args(&[ArgSpec::uint("u")], vec![Argument::Int(1)], &mut payload, &mut fds)
            .unwrap_err();
        assert!(matches!(
            err,
            EncodeError::KindMismatch { expected: ArgKind::Uint, found: ArgKind::Int, .. }
        ));

        let err = encode_args(&[ArgSpec::string("s")], vec![Argument::Str(None)], &mut payload, &mut fds)
            .unwrap_err();
        assert!(matches!(err, EncodeError::UnexpectedNull { .. }));

        let err = encode_args(
            &[ArgSpec::object("o")],
            vec![Argument::Object(ObjectId::NULL)],
            &mut payload,
            &mut fds,
        )
        .unwrap_err();
        assert!(matches!(err, EncodeError::UnexpectedNull { .. }));

        let err = encode_args(&[ArgSpec::string("s")], vec![Argument::string("a\0b")], &mut payload, &mut fds)
            .unwrap_err();
        assert!(matches!(err, EncodeError::InteriorNul { .. }));
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u32.to_ne_bytes());
        payload.extend_from_slice(&[0xff, 0xfe, 0, 0]);
        let err = decode_args(&[ArgSpec::string("s")], &payload, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidUtf8 { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_terminator() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&4u32.to_ne_bytes());
        payload.extend_from_slice(b"abcd");
        let err = decode_args(&[ArgSpec::string("s")], &payload, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingTerminator { .. }));
    }

    #[test]
    fn test_decode_never_reads_past_frame() {
        // Length claims 100 bytes but only 4 follow
        let mut payload = Vec::new();
        payload.extend_from_slice(&100u32.to_ne_bytes());
        payload.extend_from_slice(b"abc\0");
        let err = decode_args(&[ArgSpec::array("a")], &payload, &mut VecDeque::new()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                arg: "a".to_string(),
                needed: 100,
                remaining: 4
            }
        );

        let err = decode_args(&[ArgSpec::uint("a"), ArgSpec::uint("b")], &[0; 6], &mut VecDeque::new())
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { arg, .. } if arg == "b"));
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let payload = [0u8; 8];
        let err = decode_args(&[ArgSpec::string("s").nullable()], &payload, &mut VecDeque::new())
            .unwrap_err();
        assert_eq!(err, DecodeError::TrailingBytes { count: 4 });
    }

    #[test]
    fn test_decode_null_in_non_nullable_slot() {
        let payload = 0u32.to_ne_bytes();
        let err = decode_args(&[ArgSpec::object("o")], &payload, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedNull { .. }));
        let err = decode_args(&[ArgSpec::new_id("n", "x")], &payload, &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedNull { .. }));
    }

    #[test]
    fn test_decode_missing_fd() {
        let err = decode_args(&[ArgSpec::fd("fd")], &[], &mut VecDeque::new()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingFd { arg } if arg == "fd"));
    }

    #[test]
    fn test_header_roundtrip() {
        let header = MessageHeader {
            object: ObjectId::new(3),
            opcode: 2,
            size: 16,
        };
        let bytes = header.to_bytes();
        assert_eq!(u32::from_ne_bytes(bytes[4..8].try_into().unwrap()), (16 << 16) | 2);
        assert_eq!(MessageHeader::parse(&bytes), Some(header));
        assert_eq!(MessageHeader::parse(&bytes[..7]), None);
    }

    #[test]
    fn test_fixed_conversions() {
        assert_eq!(Fixed::from_int(3).to_raw(), 768);
        assert_eq!(Fixed::from_int(-2).to_int(), -2);
        assert_eq!(Fixed::from_f64(1.25).to_raw(), 320);
        assert_eq!(Fixed::from_raw(320).to_f64(), 1.25);
        assert_eq!(Fixed::from_f64(-0.5).to_int(), -1);
    }
}
