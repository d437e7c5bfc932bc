//! Named SSH channel types, requests, and reason codes.
//!
//! Packet numbers are listed in `packets.rs`.
//!
//! This module also serves as an index of SSH specifications.

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_CHAN_SESSION: &str = "session";
/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_CHAN_DIRECT_TCPIP: &str = "direct-tcpip";
/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_CHAN_FORWARDED_TCPIP: &str = "forwarded-tcpip";

/// [RFC4254](https://tools.ietf.org/html/rfc4254) channel requests
pub const SSH_REQ_PTY: &str = "pty-req";
pub const SSH_REQ_ENV: &str = "env";
pub const SSH_REQ_SHELL: &str = "shell";
pub const SSH_REQ_EXEC: &str = "exec";
pub const SSH_REQ_SUBSYSTEM: &str = "subsystem";
pub const SSH_REQ_WINDOW_CHANGE: &str = "window-change";
pub const SSH_REQ_XON_XOFF: &str = "xon-xoff";
pub const SSH_REQ_SIGNAL: &str = "signal";
pub const SSH_REQ_EXIT_STATUS: &str = "exit-status";
pub const SSH_REQ_EXIT_SIGNAL: &str = "exit-signal";
/// [RFC4335](https://tools.ietf.org/html/rfc4335)
pub const SSH_REQ_BREAK: &str = "break";
/// OpenSSH [PROTOCOL](https://cvsweb.openbsd.org/src/usr.bin/ssh/PROTOCOL?annotate=HEAD)
/// section 2.1, sent after the client's last write.
pub const SSH_REQ_EOW: &str = "eow@openssh.com";
/// OpenSSH keepalive. Peers reply `failure`, which still shows they're alive.
pub const SSH_REQ_KEEPALIVE: &str = "keepalive@openssh.com";

/// [RFC4254](https://tools.ietf.org/html/rfc4254) global requests
pub const SSH_GLOBAL_TCPIP_FORWARD: &str = "tcpip-forward";
pub const SSH_GLOBAL_CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";

/// [RFC4254](https://tools.ietf.org/html/rfc4254)
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// [RFC4254](https://tools.ietf.org/html/rfc4254) channel open failure reason codes
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanFail {
    SSH_OPEN_ADMINISTRATIVELY_PROHIBITED = 1,
    SSH_OPEN_CONNECT_FAILED = 2,
    SSH_OPEN_UNKNOWN_CHANNEL_TYPE = 3,
    SSH_OPEN_RESOURCE_SHORTAGE = 4,
}

impl ChanFail {
    pub fn description(&self) -> &'static str {
        match self {
            Self::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED => "administratively prohibited",
            Self::SSH_OPEN_CONNECT_FAILED => "connect failed",
            Self::SSH_OPEN_UNKNOWN_CHANNEL_TYPE => "unknown channel type",
            Self::SSH_OPEN_RESOURCE_SHORTAGE => "resource shortage",
        }
    }
}

impl TryFrom<u32> for ChanFail {
    type Error = u32;
    fn try_from(v: u32) -> Result<Self, u32> {
        match v {
            1 => Ok(Self::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED),
            2 => Ok(Self::SSH_OPEN_CONNECT_FAILED),
            3 => Ok(Self::SSH_OPEN_UNKNOWN_CHANNEL_TYPE),
            4 => Ok(Self::SSH_OPEN_RESOURCE_SHORTAGE),
            v => Err(v),
        }
    }
}
