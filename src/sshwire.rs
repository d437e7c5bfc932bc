//! SSH wire format reading/writing.
//!
//! Used with the [`packets`](crate::packets) message definitions. Fields are
//! big-endian `u32`, single byte booleans, and `u32` length prefixed strings.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt::{self, Debug};
use pretty_hex::PrettyHex;

use ascii::{AsAsciiStr, AsciiChar, AsciiStr};

use crate::packets::Packet;

/// A generic destination for serializing, used similarly to `serde::Serializer`
pub trait SSHSink {
    fn push(&mut self, v: &[u8]) -> WireResult<()>;
}

/// A generic source for a packet, used similarly to `serde::Deserializer`
pub trait SSHSource<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]>;
    fn pos(&self) -> usize;
    /// Number of bytes not yet consumed
    fn remaining(&self) -> usize;

    /// Consumes the remainder of the input.
    fn take_rest(&mut self) -> WireResult<&'de [u8]> {
        let r = self.remaining();
        self.take(r)
    }
}

/// Encodes the type in SSH wire format
pub trait SSHEncode {
    fn enc<S>(&self, s: &mut S) -> WireResult<()> where S: SSHSink;
}

/// For enums with a name carried by the parent struct
pub trait SSHEncodeEnum {
    /// Returns the name of the current variant, used for encoding parent structs.
    ///
    /// Raw bytes, since unknown variants keep the name from the wire.
    fn variant_name(&self) -> &[u8];
}

/// Decodes `struct` and `enum`s without an externally provided enum name
pub trait SSHDecode<'de>: Sized {
    fn dec<S>(s: &mut S) -> WireResult<Self> where S: SSHSource<'de>;
}

/// Decodes enums with an externally provided name
pub trait SSHDecodeEnum<'de>: Sized {
    /// `var` is the variant name to decode, as raw bytes off the wire.
    fn dec_enum<S>(s: &mut S, var: &'de [u8]) -> WireResult<Self> where S: SSHSource<'de>;
}

/// A subset of [`Error`] for `SSHEncode` and `SSHDecode`.
#[derive(Debug)]
pub enum WireError {
    NoRoom,

    RanOut,

    BadString,

    BadName,

    UnknownPacket { number: u8 },
}

impl From<WireError> for Error {
    fn from(w: WireError) -> Self {
        match w {
            WireError::NoRoom => Error::NoRoom,
            WireError::RanOut => Error::RanOut,
            WireError::BadString => Error::BadString,
            WireError::BadName => Error::BadName,
            WireError::UnknownPacket { number } => Error::UnknownPacket { number },
        }
    }
}

pub type WireResult<T> = core::result::Result<T, WireError>;

///////////////////////////////////////////////

/// Parses a [`Packet`] from a borrowed `&[u8]` byte buffer.
///
/// The whole buffer must be consumed.
pub fn packet_from_bytes(b: &[u8]) -> Result<Packet<'_>> {
    let mut s = DecodeBytes { input: b, pos: 0 };
    let p = Packet::dec(&mut s)?;

    if s.remaining() != 0 {
        trace!("{} trailing bytes after {:?}", s.remaining(), p.message_num());
        Err(Error::WrongPacketLength)
    } else {
        Ok(p)
    }
}

pub fn read_ssh<'a, T: SSHDecode<'a>>(b: &'a [u8]) -> Result<T> {
    let mut s = DecodeBytes { input: b, pos: 0 };
    Ok(T::dec(&mut s)?)
}

pub fn write_ssh<T>(target: &mut [u8], value: &T) -> Result<usize>
where
    T: SSHEncode,
{
    let mut s = EncodeBytes { target, pos: 0 };
    value.enc(&mut s)?;
    Ok(s.pos)
}

/// Serializes `value` into a newly allocated `Vec`.
pub fn write_ssh_vec<T>(value: &T) -> Result<Vec<u8>>
where
    T: SSHEncode,
{
    let len = length_enc(value)? as usize;
    let mut v = Vec::with_capacity(len);
    value.enc(&mut v)?;
    debug_assert_eq!(v.len(), len);
    Ok(v)
}

/// Returns `WireError::NoRoom` if larger than `u32`
pub fn length_enc<T>(value: &T) -> WireResult<u32>
where
    T: SSHEncode,
{
    let mut s = EncodeLen { pos: 0 };
    value.enc(&mut s)?;
    s.pos.try_into().map_err(|_| WireError::NoRoom)
}

struct EncodeBytes<'a> {
    target: &'a mut [u8],
    pos: usize,
}

impl SSHSink for EncodeBytes<'_> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        if self.pos + v.len() > self.target.len() {
            return Err(WireError::NoRoom);
        }
        self.target[self.pos..self.pos + v.len()].copy_from_slice(v);
        self.pos += v.len();
        Ok(())
    }
}

impl SSHSink for Vec<u8> {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.extend_from_slice(v);
        Ok(())
    }
}

struct EncodeLen {
    pos: usize,
}

impl SSHSink for EncodeLen {
    fn push(&mut self, v: &[u8]) -> WireResult<()> {
        self.pos += v.len();
        Ok(())
    }
}

struct DecodeBytes<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'de> SSHSource<'de> for DecodeBytes<'de> {
    fn take(&mut self, len: usize) -> WireResult<&'de [u8]> {
        if len > self.input.len() {
            return Err(WireError::RanOut);
        }
        let t;
        (t, self.input) = self.input.split_at(len);
        self.pos += len;
        Ok(t)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.input.len()
    }
}

///////////////////////////////////////////////

/// A SSH style binary string. Serialized as `u32` length followed by the bytes
/// of the slice.
#[derive(Clone, PartialEq)]
pub struct BinString<'a>(pub &'a [u8]);

impl<'a> AsRef<[u8]> for BinString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl Debug for BinString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinString(len={})", self.0.len())
    }
}

impl SSHEncode for BinString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let len: u32 = self.0.len().try_into().map_err(|_| WireError::NoRoom)?;
        len.enc(s)?;
        self.0.enc(s)
    }
}

impl<'de> SSHDecode<'de> for BinString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)? as usize;
        Ok(BinString(s.take(len)?))
    }
}

/// A text string that may be presented to a user or used
/// for things such as an exec command, TCP hostname, error description etc.
///
/// The SSH protocol defines it to be UTF-8, the library
/// treats it as an opaque `&[u8]`.
///
/// Note that SSH protocol identifiers in `Packet` etc
/// are `&str` rather than `TextString`, and always defined as ASCII.
#[derive(Clone, PartialEq, Copy)]
pub struct TextString<'a>(pub &'a [u8]);

impl<'a> TextString<'a> {
    /// Returns the UTF-8 decoded string, using [`core::str::from_utf8`]
    pub fn as_str(&self) -> Result<&'a str> {
        core::str::from_utf8(self.0).map_err(|_| Error::BadString)
    }

    pub fn as_ascii(&self) -> Result<&'a str> {
        self.0.as_ascii_str().map_err(|_| Error::BadString).map(|s| s.as_str())
    }

    /// Lossy conversion, for log messages and error descriptions
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.0).into_owned()
    }
}

impl<'a> AsRef<[u8]> for TextString<'a> {
    fn as_ref(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for TextString<'a> {
    fn from(s: &'a str) -> Self {
        TextString(s.as_bytes())
    }
}

impl Debug for TextString<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = core::str::from_utf8(self.0);
        if let Ok(s) = s {
            write!(f, "TextString(\"{}\")", s.escape_default())
        } else {
            write!(f, "TextString(not utf8!, {:#?})", self.0.hex_dump())
        }
    }
}

impl SSHEncode for TextString<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        BinString(self.0).enc(s)
    }
}

impl<'de> SSHDecode<'de> for TextString<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let b = BinString::dec(s)?;
        Ok(TextString(b.0))
    }
}

///////////////////////////////////////////////

impl SSHEncode for u8 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(&[*self])
    }
}

impl SSHEncode for bool {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        (*self as u8).enc(s)
    }
}

impl SSHEncode for u32 {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(&self.to_be_bytes())
    }
}

// no length prefix
impl SSHEncode for &[u8] {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        s.push(self)
    }
}

impl SSHEncode for &str {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        BinString(self.as_bytes()).enc(s)
    }
}

impl<'de> SSHDecode<'de> for bool {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(u8::dec(s)? != 0)
    }
}

impl<'de> SSHDecode<'de> for u8 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let t = s.take(1)?;
        Ok(t[0])
    }
}

impl<'de> SSHDecode<'de> for u32 {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let t = s.take(core::mem::size_of::<u32>())?;
        let mut b = [0u8; 4];
        b.copy_from_slice(t);
        Ok(u32::from_be_bytes(b))
    }
}

/// Decodes a SSH name string. Must be ASCII
/// without control characters. RFC4251 section 6.
pub fn try_as_ascii(t: &[u8]) -> WireResult<&AsciiStr> {
    let n = t.as_ascii_str().map_err(|_| WireError::BadName)?;
    if n.chars().any(|ch| ch.is_ascii_control() || ch == AsciiChar::DEL) {
        return Err(WireError::BadName);
    }
    Ok(n)
}

pub fn try_as_ascii_str(t: &[u8]) -> WireResult<&str> {
    try_as_ascii(t).map(AsciiStr::as_str)
}

impl<'de: 'a, 'a> SSHDecode<'de> for &'a str {
    #[inline]
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let len = u32::dec(s)?;
        let t = s.take(len as usize)?;
        try_as_ascii_str(t)
    }
}
