//! SSH connection protocol packets.
//!
//! A [`Packet`] can be encoded/decoded to the SSH payload format using
//! [`sshwire`](crate::sshwire). Only the channel and global request messages of
//! [RFC4254](https://tools.ietf.org/html/rfc4254) are handled here, other message
//! numbers belong to the transport.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;

use pretty_hex::PrettyHex;

use crate::sshnames::*;
use crate::sshwire::{self, BinString, TextString};
use crate::sshwire::{SSHDecode, SSHDecodeEnum, SSHEncode, SSHEncodeEnum};
use crate::sshwire::{SSHSink, SSHSource, WireError, WireResult};

// Plain structs are encoded field by field in declaration order.
// `borrowed` structs carry a lifetime for borrowed strings.
macro_rules! wire_struct {
    (borrowed $name:ident { $($field:ident),* $(,)? }) => {
        impl SSHEncode for $name<'_> {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where S: SSHSink {
                $( self.$field.enc(s)?; )*
                Ok(())
            }
        }

        impl<'de> SSHDecode<'de> for $name<'de> {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<'de> {
                Ok(Self { $( $field: SSHDecode::dec(s)?, )* })
            }
        }
    };

    ($name:ident { $($field:ident),* $(,)? }) => {
        impl SSHEncode for $name {
            fn enc<S>(&self, s: &mut S) -> WireResult<()>
            where S: SSHSink {
                let _ = &s;
                $( self.$field.enc(s)?; )*
                Ok(())
            }
        }

        impl<'de> SSHDecode<'de> for $name {
            fn dec<S>(s: &mut S) -> WireResult<Self>
            where S: SSHSource<'de> {
                let _ = &s;
                Ok(Self { $( $field: SSHDecode::dec(s)?, )* })
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalRequest<'a> {
    pub want_reply: bool,
    pub req: GlobalRequestMethod<'a>,
}

impl SSHEncode for GlobalRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        BinString(self.req.variant_name()).enc(s)?;
        self.want_reply.enc(s)?;
        self.req.enc(s)
    }
}

impl<'de> SSHDecode<'de> for GlobalRequest<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = BinString::dec(s)?;
        let want_reply = bool::dec(s)?;
        let req = GlobalRequestMethod::dec_enum(s, name.0)?;
        Ok(Self { want_reply, req })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GlobalRequestMethod<'a> {
    TcpipForward(TcpipForward<'a>),
    CancelTcpipForward(TcpipForward<'a>),
    Unknown(UnknownReq<'a>),
}

impl SSHEncodeEnum for GlobalRequestMethod<'_> {
    fn variant_name(&self) -> &[u8] {
        match self {
            Self::TcpipForward(_) => SSH_GLOBAL_TCPIP_FORWARD.as_bytes(),
            Self::CancelTcpipForward(_) => SSH_GLOBAL_CANCEL_TCPIP_FORWARD.as_bytes(),
            Self::Unknown(u) => u.name.0,
        }
    }
}

impl SSHEncode for GlobalRequestMethod<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            Self::TcpipForward(t) | Self::CancelTcpipForward(t) => t.enc(s),
            Self::Unknown(u) => u.data.enc(s),
        }
    }
}

impl<'de> SSHDecodeEnum<'de> for GlobalRequestMethod<'de> {
    fn dec_enum<S>(s: &mut S, var: &'de [u8]) -> WireResult<Self>
    where S: SSHSource<'de> {
        let r = match sshwire::try_as_ascii_str(var).ok() {
            Some(SSH_GLOBAL_TCPIP_FORWARD) => Self::TcpipForward(SSHDecode::dec(s)?),
            Some(SSH_GLOBAL_CANCEL_TCPIP_FORWARD) => {
                Self::CancelTcpipForward(SSHDecode::dec(s)?)
            }
            _ => Self::Unknown(UnknownReq { name: Unknown(var), data: s.take_rest()? }),
        };
        Ok(r)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpipForward<'a> {
    pub address: TextString<'a>,
    pub port: u32,
}
wire_struct!(borrowed TcpipForward { address, port });

/// The reply to a [`GlobalRequest`].
///
/// The content depends on the request, a `tcpip-forward` for port 0
/// replies with the allocated port.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSuccess<'a> {
    pub data: &'a [u8],
}

impl RequestSuccess<'_> {
    /// The port allocated by a `tcpip-forward` request, if present.
    pub fn port(&self) -> Option<u32> {
        if self.data.len() != 4 {
            return None;
        }
        sshwire::read_ssh::<u32>(self.data).ok()
    }
}

impl SSHEncode for RequestSuccess<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.data.enc(s)
    }
}

impl<'de> SSHDecode<'de> for RequestSuccess<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        Ok(Self { data: s.take_rest()? })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {}
wire_struct!(RequestFailure {});

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpen<'a> {
    /// The sender's channel number
    pub num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub ty: ChannelOpenType<'a>,
}

impl SSHEncode for ChannelOpen<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        // channel type name comes first on the wire
        BinString(self.ty.variant_name()).enc(s)?;
        self.num.enc(s)?;
        self.initial_window.enc(s)?;
        self.max_packet.enc(s)?;
        self.ty.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ChannelOpen<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = BinString::dec(s)?;
        let num = u32::dec(s)?;
        let initial_window = u32::dec(s)?;
        let max_packet = u32::dec(s)?;
        let ty = ChannelOpenType::dec_enum(s, name.0)?;
        Ok(Self { num, initial_window, max_packet, ty })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOpenType<'a> {
    Session,
    ForwardedTcpip(ForwardedTcpip<'a>),
    DirectTcpip(DirectTcpip<'a>),
    Unknown(UnknownReq<'a>),
}

impl SSHEncodeEnum for ChannelOpenType<'_> {
    fn variant_name(&self) -> &[u8] {
        match self {
            Self::Session => SSH_CHAN_SESSION.as_bytes(),
            Self::ForwardedTcpip(_) => SSH_CHAN_FORWARDED_TCPIP.as_bytes(),
            Self::DirectTcpip(_) => SSH_CHAN_DIRECT_TCPIP.as_bytes(),
            Self::Unknown(u) => u.name.0,
        }
    }
}

impl SSHEncode for ChannelOpenType<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            Self::Session => Ok(()),
            Self::ForwardedTcpip(t) => t.enc(s),
            Self::DirectTcpip(t) => t.enc(s),
            Self::Unknown(u) => u.data.enc(s),
        }
    }
}

impl<'de> SSHDecodeEnum<'de> for ChannelOpenType<'de> {
    fn dec_enum<S>(s: &mut S, var: &'de [u8]) -> WireResult<Self>
    where S: SSHSource<'de> {
        let r = match sshwire::try_as_ascii_str(var).ok() {
            Some(SSH_CHAN_SESSION) => Self::Session,
            Some(SSH_CHAN_FORWARDED_TCPIP) => Self::ForwardedTcpip(SSHDecode::dec(s)?),
            Some(SSH_CHAN_DIRECT_TCPIP) => Self::DirectTcpip(SSHDecode::dec(s)?),
            _ => Self::Unknown(UnknownReq { name: Unknown(var), data: s.take_rest()? }),
        };
        Ok(r)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenConfirmation {
    pub num: u32,
    pub sender_num: u32,
    pub initial_window: u32,
    pub max_packet: u32,
}
wire_struct!(ChannelOpenConfirmation { num, sender_num, initial_window, max_packet });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOpenFailure<'a> {
    pub num: u32,
    pub reason: u32,
    pub desc: TextString<'a>,
    pub lang: &'a str,
}
wire_struct!(borrowed ChannelOpenFailure { num, reason, desc, lang });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelWindowAdjust {
    pub num: u32,
    pub adjust: u32,
}
wire_struct!(ChannelWindowAdjust { num, adjust });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelData<'a> {
    pub num: u32,
    pub data: BinString<'a>,
}
wire_struct!(borrowed ChannelData { num, data });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDataExt<'a> {
    pub num: u32,
    pub code: u32,
    pub data: BinString<'a>,
}
wire_struct!(borrowed ChannelDataExt { num, code, data });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEof {
    pub num: u32,
}
wire_struct!(ChannelEof { num });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelClose {
    pub num: u32,
}
wire_struct!(ChannelClose { num });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSuccess {
    pub num: u32,
}
wire_struct!(ChannelSuccess { num });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFailure {
    pub num: u32,
}
wire_struct!(ChannelFailure { num });

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest<'a> {
    pub num: u32,
    pub want_reply: bool,
    pub req: ChannelReqType<'a>,
}

impl SSHEncode for ChannelRequest<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        self.num.enc(s)?;
        BinString(self.req.variant_name()).enc(s)?;
        self.want_reply.enc(s)?;
        self.req.enc(s)
    }
}

impl<'de> SSHDecode<'de> for ChannelRequest<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let num = u32::dec(s)?;
        let name = BinString::dec(s)?;
        let want_reply = bool::dec(s)?;
        let req = ChannelReqType::dec_enum(s, name.0)?;
        Ok(Self { num, want_reply, req })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelReqType<'a> {
    Shell,
    Exec(Exec<'a>),
    Pty(PtyReq<'a>),
    Subsystem(Subsystem<'a>),
    Env(Env<'a>),
    WinChange(WinChange),
    XonXoff(XonXoff),
    Signal(Signal<'a>),
    ExitStatus(ExitStatus),
    ExitSignal(ExitSignal<'a>),
    Break(Break),
    Eow,
    Keepalive,
    // Other requests that aren't implemented at present:
    // auth-agent-req@openssh.com
    // x11-req
    Unknown(UnknownReq<'a>),
}

impl ChannelReqType<'_> {
    /// The request name, lossy for unknown non-ASCII names
    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.variant_name()).into_owned()
    }
}

impl SSHEncodeEnum for ChannelReqType<'_> {
    fn variant_name(&self) -> &[u8] {
        let n = match self {
            Self::Shell => SSH_REQ_SHELL,
            Self::Exec(_) => SSH_REQ_EXEC,
            Self::Pty(_) => SSH_REQ_PTY,
            Self::Subsystem(_) => SSH_REQ_SUBSYSTEM,
            Self::Env(_) => SSH_REQ_ENV,
            Self::WinChange(_) => SSH_REQ_WINDOW_CHANGE,
            Self::XonXoff(_) => SSH_REQ_XON_XOFF,
            Self::Signal(_) => SSH_REQ_SIGNAL,
            Self::ExitStatus(_) => SSH_REQ_EXIT_STATUS,
            Self::ExitSignal(_) => SSH_REQ_EXIT_SIGNAL,
            Self::Break(_) => SSH_REQ_BREAK,
            Self::Eow => SSH_REQ_EOW,
            Self::Keepalive => SSH_REQ_KEEPALIVE,
            Self::Unknown(u) => return u.name.0,
        };
        n.as_bytes()
    }
}

impl SSHEncode for ChannelReqType<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        match self {
            Self::Shell | Self::Eow | Self::Keepalive => Ok(()),
            Self::Exec(r) => r.enc(s),
            Self::Pty(r) => r.enc(s),
            Self::Subsystem(r) => r.enc(s),
            Self::Env(r) => r.enc(s),
            Self::WinChange(r) => r.enc(s),
            Self::XonXoff(r) => r.enc(s),
            Self::Signal(r) => r.enc(s),
            Self::ExitStatus(r) => r.enc(s),
            Self::ExitSignal(r) => r.enc(s),
            Self::Break(r) => r.enc(s),
            Self::Unknown(u) => u.data.enc(s),
        }
    }
}

impl<'de> SSHDecodeEnum<'de> for ChannelReqType<'de> {
    fn dec_enum<S>(s: &mut S, var: &'de [u8]) -> WireResult<Self>
    where S: SSHSource<'de> {
        let name = sshwire::try_as_ascii_str(var).ok();
        let r = match name {
            Some(SSH_REQ_SHELL) => Self::Shell,
            Some(SSH_REQ_EXEC) => Self::Exec(SSHDecode::dec(s)?),
            Some(SSH_REQ_PTY) => Self::Pty(SSHDecode::dec(s)?),
            Some(SSH_REQ_SUBSYSTEM) => Self::Subsystem(SSHDecode::dec(s)?),
            Some(SSH_REQ_ENV) => Self::Env(SSHDecode::dec(s)?),
            Some(SSH_REQ_WINDOW_CHANGE) => Self::WinChange(SSHDecode::dec(s)?),
            Some(SSH_REQ_XON_XOFF) => Self::XonXoff(SSHDecode::dec(s)?),
            Some(SSH_REQ_SIGNAL) => Self::Signal(SSHDecode::dec(s)?),
            Some(SSH_REQ_EXIT_STATUS) => Self::ExitStatus(SSHDecode::dec(s)?),
            Some(SSH_REQ_EXIT_SIGNAL) => Self::ExitSignal(SSHDecode::dec(s)?),
            Some(SSH_REQ_BREAK) => Self::Break(SSHDecode::dec(s)?),
            Some(SSH_REQ_EOW) => Self::Eow,
            Some(SSH_REQ_KEEPALIVE) => Self::Keepalive,
            _ => {
                // The payload format is unknown, keep it all
                Self::Unknown(UnknownReq { name: Unknown(var), data: s.take_rest()? })
            }
        };
        Ok(r)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Exec<'a> {
    pub command: TextString<'a>,
}
wire_struct!(borrowed Exec { command });

#[derive(Debug, Clone, PartialEq)]
pub struct Subsystem<'a> {
    pub subsystem: TextString<'a>,
}
wire_struct!(borrowed Subsystem { subsystem });

/// The contents of a `"pty-req"` request.
///
/// Note that most function arguments use [`request::Pty`](crate::Pty)
/// rather than this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct PtyReq<'a> {
    pub term: TextString<'a>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: BinString<'a>,
}
wire_struct!(borrowed PtyReq { term, cols, rows, width, height, modes });

#[derive(Debug, Clone, PartialEq)]
pub struct Env<'a> {
    pub name: TextString<'a>,
    pub value: TextString<'a>,
}
wire_struct!(borrowed Env { name, value });

#[derive(Debug, Clone, PartialEq)]
pub struct WinChange {
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
}
wire_struct!(WinChange { cols, rows, width, height });

#[derive(Debug, Clone, PartialEq)]
pub struct XonXoff {
    pub client_can_do: bool,
}
wire_struct!(XonXoff { client_can_do });

/// A unix signal channel request
#[derive(Debug, Clone, PartialEq)]
pub struct Signal<'a> {
    pub sig: &'a str,
}
wire_struct!(borrowed Signal { sig });

#[derive(Debug, Clone, PartialEq)]
pub struct ExitStatus {
    pub status: u32,
}
wire_struct!(ExitStatus { status });

#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal<'a> {
    pub signal: &'a str,
    pub core: bool,
    pub error: TextString<'a>,
    pub lang: &'a str,
}
wire_struct!(borrowed ExitSignal { signal, core, error, lang });

#[derive(Debug, Clone, PartialEq)]
pub struct Break {
    pub length: u32,
}
wire_struct!(Break { length });

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}
wire_struct!(borrowed ForwardedTcpip { address, port, origin, origin_port });

#[derive(Debug, Clone, PartialEq)]
pub struct DirectTcpip<'a> {
    pub address: TextString<'a>,
    pub port: u32,
    pub origin: TextString<'a>,
    pub origin_port: u32,
}
wire_struct!(borrowed DirectTcpip { address, port, origin, origin_port });

/// Placeholder for unknown method names.
///
/// These are non-fatal and need to be handled by the relevant code,
/// for example a request type invented by a newer peer.
#[derive(Clone, PartialEq)]
pub struct Unknown<'a>(pub &'a [u8]);

impl fmt::Display for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = sshwire::try_as_ascii_str(self.0) {
            f.write_str(s)
        } else {
            write!(f, "non-ascii {:?}", self.0.hex_dump())
        }
    }
}

impl fmt::Debug for Unknown<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// An unknown request or channel type, with its undecoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownReq<'a> {
    pub name: Unknown<'a>,
    /// The remainder of the packet, no length prefix
    pub data: &'a [u8],
}

/// We have repeated `match` statements for the various packet types, use a macro
macro_rules! messagetypes {
    (
        $( ( $message_num:literal,
            $SpecificPacketVariant:ident,
            $SpecificPacketType:ty,
            $SSH_MESSAGE_NAME:ident
            ),
             )*
    ) => {

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum MessageNumber {
    // variants are eg
    // SSH_MSG_CHANNEL_OPEN = 90,
    $(
    $SSH_MESSAGE_NAME = $message_num,
    )*
}

impl TryFrom<u8> for MessageNumber {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self> {
        match v {
            $(
            $message_num => Ok(MessageNumber::$SSH_MESSAGE_NAME),
            )*
            _ => {
                Err(Error::UnknownPacket { number: v })
            }
        }
    }
}

impl SSHEncode for Packet<'_> {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        let t = self.message_num() as u8;
        t.enc(s)?;
        match self {
            $(
            Packet::$SpecificPacketVariant(p) => {
                p.enc(s)?
            }
            )*
        };
        Ok(())
    }
}

impl<'de> SSHDecode<'de> for Packet<'de> {
    fn dec<S>(s: &mut S) -> WireResult<Self>
    where S: SSHSource<'de> {
        let msg_num = u8::dec(s)?;
        let ty = match MessageNumber::try_from(msg_num) {
            Ok(t) => t,
            Err(_) => return Err(WireError::UnknownPacket { number: msg_num })
        };

        // Decode based on the message number
        let p = match ty {
            $(
            MessageNumber::$SSH_MESSAGE_NAME => Packet::$SpecificPacketVariant(SSHDecode::dec(s)?),
            )*
        };
        Ok(p)
    }
}

/// Top level connection protocol packet enum
#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    $(
    $SpecificPacketVariant($SpecificPacketType),
    )*
}

impl<'a> Packet<'a> {
    pub fn message_num(&self) -> MessageNumber {
        match self {
            $(
            Packet::$SpecificPacketVariant(_) => {
                MessageNumber::$SSH_MESSAGE_NAME
            }
            )*
        }
    }
}

$(
impl<'a> From<$SpecificPacketType> for Packet<'a> {
    fn from(s: $SpecificPacketType) -> Packet<'a> {
        Packet::$SpecificPacketVariant(s)
    }
}
)*

} } // macro

impl Packet<'_> {
    /// The local (recipient) channel number for channel scoped messages.
    ///
    /// `None` for global requests and `ChannelOpen`, where the number
    /// is the sender's.
    pub fn channel_num(&self) -> Option<u32> {
        match self {
            Packet::ChannelOpenConfirmation(p) => Some(p.num),
            Packet::ChannelOpenFailure(p) => Some(p.num),
            Packet::ChannelWindowAdjust(p) => Some(p.num),
            Packet::ChannelData(p) => Some(p.num),
            Packet::ChannelDataExt(p) => Some(p.num),
            Packet::ChannelEof(p) => Some(p.num),
            Packet::ChannelClose(p) => Some(p.num),
            Packet::ChannelRequest(p) => Some(p.num),
            Packet::ChannelSuccess(p) => Some(p.num),
            Packet::ChannelFailure(p) => Some(p.num),
            | Packet::GlobalRequest(_)
            | Packet::RequestSuccess(_)
            | Packet::RequestFailure(_)
            | Packet::ChannelOpen(_)
            => None,
        }
    }
}

messagetypes![
(80, GlobalRequest, GlobalRequest<'a>, SSH_MSG_GLOBAL_REQUEST),
(81, RequestSuccess, RequestSuccess<'a>, SSH_MSG_REQUEST_SUCCESS),
(82, RequestFailure, RequestFailure, SSH_MSG_REQUEST_FAILURE),

(90, ChannelOpen, ChannelOpen<'a>, SSH_MSG_CHANNEL_OPEN),
(91, ChannelOpenConfirmation, ChannelOpenConfirmation, SSH_MSG_CHANNEL_OPEN_CONFIRMATION),
(92, ChannelOpenFailure, ChannelOpenFailure<'a>, SSH_MSG_CHANNEL_OPEN_FAILURE),
(93, ChannelWindowAdjust, ChannelWindowAdjust, SSH_MSG_CHANNEL_WINDOW_ADJUST),
(94, ChannelData, ChannelData<'a>, SSH_MSG_CHANNEL_DATA),
(95, ChannelDataExt, ChannelDataExt<'a>, SSH_MSG_CHANNEL_EXTENDED_DATA),
(96, ChannelEof, ChannelEof, SSH_MSG_CHANNEL_EOF),
(97, ChannelClose, ChannelClose, SSH_MSG_CHANNEL_CLOSE),
(98, ChannelRequest, ChannelRequest<'a>, SSH_MSG_CHANNEL_REQUEST),
(99, ChannelSuccess, ChannelSuccess, SSH_MSG_CHANNEL_SUCCESS),
(100, ChannelFailure, ChannelFailure, SSH_MSG_CHANNEL_FAILURE),
];
