//! SSH client channel multiplexing.
//!
//! A [`Conn`] multiplexes session and TCP forwarding channels over an
//! established SSH session. The session passes inbound connection protocol
//! messages to [`Conn::dispatch()`], and outbound messages are sent through
//! a [`Transport`].

#![forbid(unsafe_code)]

// avoids headscratching
#![deny(unused_must_use)]

pub mod sshwire;
pub mod packets;
pub mod sshnames;
pub mod config;
// exported so that some Channel error variants can be matched on
pub mod error;
pub mod termmodes;

mod channel;
mod conn;
mod request;
mod session;
mod sync;
mod tcp;
mod traffic;

#[cfg(test)]
mod test;

// Application API
pub use sshwire::TextString;

pub use config::ChanConfig;
pub use conn::{ChanIds, Conn};
pub use channel::{ChanHooks, ChanKind, ChanNum, ChanState, Channel};
pub use error::{Error, Result};
pub use request::{Pty, SessionCommand};
pub use session::{ExecOutput, SessionChannel, SessionData, SessionExit};
pub use sshnames::ChanFail;
pub use tcp::TcpChannel;
pub use traffic::Transport;
