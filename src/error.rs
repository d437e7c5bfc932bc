#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt::Arguments;
use core::str::Utf8Error;

use snafu::prelude::*;

use crate::channel::ChanNum;

/// The sunset-mux error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// Output buffer ran out of room
    NoRoom,

    /// Input buffer ran out
    RanOut,

    /// Not a UTF-8 string
    BadString,

    /// Not a valid SSH ASCII string
    BadName,

    /// SSH packet contents doesn't match length
    WrongPacketLength,

    #[snafu(display("Unknown packet type {number}"))]
    UnknownPacket { number: u8 },

    /// A message arrived that isn't valid for the channel's current state.
    ///
    /// The transport will usually disconnect.
    #[snafu(display("Protocol violation on channel {num}: {msg}"))]
    ProtocolViolation { num: ChanNum, msg: &'static str },

    /// The peer refused a channel open, after all retries were used.
    #[snafu(display("Channel {num} open rejected, reason {reason}: {desc}"))]
    OpenRejected { num: ChanNum, reason: u32, desc: String },

    /// The peer replied `failure` to a request with `want_reply` set.
    #[snafu(display("Channel {num} request \"{req}\" failed"))]
    RequestFailed { num: ChanNum, req: String },

    #[snafu(display("Channel {num} timed out waiting for {op}"))]
    Timeout { num: ChanNum, op: &'static str },

    /// The session went away while the channel was outstanding.
    #[snafu(display("Transport lost with channel {num} outstanding"))]
    TransportLost { num: ChanNum },

    /// A channel hook failed. The channel has been closed.
    #[snafu(display("Channel {num} failed: {msg}"))]
    HookFailed { num: ChanNum, msg: String },

    /// Ran out of channels
    NoChannels,

    /// Channel EOF
    ///
    /// Returned when sending on a channel that has sent EOF or is closing.
    ChannelEOF,

    /// A global request was refused by the peer.
    #[snafu(display("Global request \"{req}\" failed"))]
    GlobalRequestFailed { req: &'static str },

    #[snafu(display("Global request \"{req}\" timed out"))]
    GlobalTimeout { req: &'static str },

    /// The session is no longer running.
    Disconnected,

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// IO Error
    IoError { source: std::io::Error },

    /// Program bug
    Bug,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }

    /// Like [`bug()`](Error::bug) but with a message
    #[cold]
    pub fn bug_fmt(args: Arguments) -> Error {
        if cfg!(debug_assertions) {
            panic!("Hit a bug: {args}");
        } else {
            trace!("Hit a bug: {args}");
            Error::Bug
        }
    }

    #[cold]
    pub fn bug_msg<T>(msg: &str) -> Result<T, Error> {
        Err(Self::bug_fmt(format_args!("{}", msg)))
    }

    /// The channel number an error refers to, if any.
    pub fn chan(&self) -> Option<ChanNum> {
        match self {
            | Error::ProtocolViolation { num, .. }
            | Error::OpenRejected { num, .. }
            | Error::RequestFailed { num, .. }
            | Error::Timeout { num, .. }
            | Error::TransportLost { num }
            | Error::HookFailed { num, .. }
            => Some(*num),
            _ => None,
        }
    }
}

/// A sunset-mux Result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` should be used like `.unwrap()`, in situations
    /// never expected to fail. Instead it calls [`Error::bug()`].
    /// (or debug builds may panic)
    fn trap(self) -> Result<T, Error>;

    /// Like `trap()` but with a message.
    fn trap_msg(self, args: Arguments) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
    fn trap_msg(self, args: Arguments) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug_fmt(args))
        }
    }
}

impl From<Utf8Error> for Error {
    fn from(_e: Utf8Error) -> Error {
        Error::BadString
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::IoError { source: value }
    }
}

#[cfg(test)]
mod tests {
    use crate::error::*;

    #[test]
    fn chan_of_error() {
        let e = Error::Timeout { num: ChanNum(3), op: "open" };
        assert_eq!(e.chan(), Some(ChanNum(3)));
        assert_eq!(e.to_string(), "Channel 3 timed out waiting for open");
        assert!(Error::NoRoom.chan().is_none());
    }

    #[test]
    fn trap_some() {
        let r: Result<u32> = Some(4u32).trap();
        assert_eq!(r.unwrap(), 4);
    }
}
