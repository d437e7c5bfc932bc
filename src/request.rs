//! Application side channel request types.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use heapless::String;

use crate::config::{DEFAULT_TERM, MAX_TERM};
use crate::packets::{self, ChannelReqType, PtyReq};
use crate::sshwire::{self, BinString};
use crate::termmodes::TermModes;

/// A pseudo-terminal request.
///
/// Encoded as a [`packets::PtyReq`], with the modes serialized to the
/// `pty-req` blob format.
#[derive(Debug, Clone)]
pub struct Pty {
    pub term: String<MAX_TERM>,
    pub cols: u32,
    pub rows: u32,
    pub width: u32,
    pub height: u32,
    pub modes: TermModes,
}

impl Pty {
    pub fn new(term: &str, cols: u32, rows: u32) -> Result<Self> {
        let term = term.try_into().map_err(|_| Error::msg("Terminal name too long"))?;
        Ok(Self { term, cols, rows, width: 0, height: 0, modes: TermModes::default() })
    }

    /// A pty with the default `TERM`, `xterm`.
    pub fn with_size(cols: u32, rows: u32) -> Result<Self> {
        Self::new(DEFAULT_TERM, cols, rows)
    }

    /// The encoded terminal modes, to pass to [`req()`](Self::req).
    pub fn modes_blob(&self) -> Result<Vec<u8>> {
        sshwire::write_ssh_vec(&self.modes)
    }

    pub fn req<'a>(&'a self, modes: &'a [u8]) -> PtyReq<'a> {
        PtyReq {
            term: self.term.as_str().into(),
            cols: self.cols,
            rows: self.rows,
            width: self.width,
            height: self.height,
            modes: BinString(modes),
        }
    }
}

/// The command to run on a session channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand<S: AsRef<str>> {
    Shell,
    Exec(S),
    Subsystem(S),
}

impl<S: AsRef<str>> SessionCommand<S> {
    pub fn request(&self) -> ChannelReqType<'_> {
        match self {
            Self::Shell => ChannelReqType::Shell,
            Self::Exec(cmd) => {
                ChannelReqType::Exec(packets::Exec { command: cmd.as_ref().into() })
            }
            Self::Subsystem(s) => {
                ChannelReqType::Subsystem(packets::Subsystem { subsystem: s.as_ref().into() })
            }
        }
    }

    /// Completion of an exec also waits for the exit status.
    pub fn expects_exit(&self) -> bool {
        matches!(self, Self::Exec(_))
    }
}
