//! Terminal modes for `pty-req`.
//!
//! Opcodes from [RFC4254](https://tools.ietf.org/html/rfc4254) section 8,
//! `IUTF8` from [RFC8160](https://tools.ietf.org/html/rfc8160).

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use heapless::Vec;

use crate::sshwire::{SSHEncode, SSHSink, WireResult};

// Number of defined opcodes, excluding TTY_OP_END
pub const NUM_MODES: usize = 57;

pub const TTY_OP_END: u8 = 0;
pub const VINTR: u8 = 1;
pub const VQUIT: u8 = 2;
pub const VERASE: u8 = 3;
pub const VKILL: u8 = 4;
pub const VEOF: u8 = 5;
pub const VEOL: u8 = 6;
pub const VEOL2: u8 = 7;
pub const VSTART: u8 = 8;
pub const VSTOP: u8 = 9;
pub const VSUSP: u8 = 10;
pub const VDSUSP: u8 = 11;
pub const VREPRINT: u8 = 12;
pub const VWERASE: u8 = 13;
pub const VLNEXT: u8 = 14;
pub const VFLUSH: u8 = 15;
pub const VSWTCH: u8 = 16;
pub const VSTATUS: u8 = 17;
pub const VDISCARD: u8 = 18;
pub const IGNPAR: u8 = 30;
pub const PARMRK: u8 = 31;
pub const INPCK: u8 = 32;
pub const ISTRIP: u8 = 33;
pub const INLCR: u8 = 34;
pub const IGNCR: u8 = 35;
pub const ICRNL: u8 = 36;
pub const IUCLC: u8 = 37;
pub const IXON: u8 = 38;
pub const IXANY: u8 = 39;
pub const IXOFF: u8 = 40;
pub const IMAXBEL: u8 = 41;
pub const IUTF8: u8 = 42;
pub const ISIG: u8 = 50;
pub const ICANON: u8 = 51;
pub const XCASE: u8 = 52;
pub const ECHO: u8 = 53;
pub const ECHOE: u8 = 54;
pub const ECHOK: u8 = 55;
pub const ECHONL: u8 = 56;
pub const NOFLSH: u8 = 57;
pub const TOSTOP: u8 = 58;
pub const IEXTEN: u8 = 59;
pub const ECHOCTL: u8 = 60;
pub const ECHOKE: u8 = 61;
pub const PENDIN: u8 = 62;
pub const OPOST: u8 = 70;
pub const OLCUC: u8 = 71;
pub const ONLCR: u8 = 72;
pub const OCRNL: u8 = 73;
pub const ONOCR: u8 = 74;
pub const ONLRET: u8 = 75;
pub const CS7: u8 = 90;
pub const CS8: u8 = 91;
pub const PARENB: u8 = 92;
pub const PARODD: u8 = 93;
pub const TTY_OP_ISPEED: u8 = 128;
pub const TTY_OP_OSPEED: u8 = 129;

/// A single terminal mode setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModePair {
    pub opcode: u8,
    pub arg: u32,
}

impl ModePair {
    pub fn new(opcode: u8, arg: u32) -> Self {
        Self { opcode, arg }
    }

    /// Opcodes 160 to 255 are undefined and stop parsing at the receiver.
    fn valid(&self) -> bool {
        self.opcode != TTY_OP_END && self.opcode < 160
    }
}

/// The encoded modes list, each `(u8 opcode, u32 argument)`
/// followed by `TTY_OP_END`.
#[derive(Debug, Clone, Default)]
pub struct TermModes(pub Vec<ModePair, NUM_MODES>);

impl TermModes {
    /// Adds or replaces a mode.
    pub fn set(&mut self, opcode: u8, arg: u32) -> Result<()> {
        let m = ModePair::new(opcode, arg);
        if !m.valid() {
            debug!("Bad mode opcode {opcode}");
            return Err(Error::msg("Bad terminal mode opcode"));
        }
        if let Some(e) = self.0.iter_mut().find(|e| e.opcode == opcode) {
            e.arg = arg;
            return Ok(());
        }
        self.0.push(m).map_err(|_| Error::NoRoom)
    }

    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.0.iter().find(|e| e.opcode == opcode).map(|e| e.arg)
    }

    /// Parses a received modes blob. Parsing stops at `TTY_OP_END`
    /// or at the first undefined opcode.
    pub fn parse(mut b: &[u8]) -> Result<Self> {
        let mut t = Self::default();
        while let Some((&op, rest)) = b.split_first() {
            if op == TTY_OP_END || op >= 160 {
                break;
            }
            if rest.len() < 4 {
                return Err(Error::RanOut);
            }
            let (arg, rest) = rest.split_at(4);
            let arg = u32::from_be_bytes([arg[0], arg[1], arg[2], arg[3]]);
            t.set(op, arg)?;
            b = rest;
        }
        Ok(t)
    }
}

impl SSHEncode for TermModes {
    fn enc<S>(&self, s: &mut S) -> WireResult<()>
    where S: SSHSink {
        for m in self.0.iter() {
            m.opcode.enc(s)?;
            m.arg.enc(s)?;
        }
        TTY_OP_END.enc(s)
    }
}

#[cfg(test)]
mod tests {
    use crate::sshwire::write_ssh_vec;
    use crate::termmodes::*;

    #[test]
    fn modes_blob() {
        let mut m = TermModes::default();
        m.set(ECHO, 0).unwrap();
        m.set(TTY_OP_OSPEED, 38400).unwrap();
        m.set(ECHO, 1).unwrap();
        let b = write_ssh_vec(&m).unwrap();
        assert_eq!(b, [ECHO, 0, 0, 0, 1, TTY_OP_OSPEED, 0, 0, 0x96, 0, TTY_OP_END]);

        let p = TermModes::parse(&b).unwrap();
        assert_eq!(p.get(ECHO), Some(1));
        assert_eq!(p.get(TTY_OP_OSPEED), Some(38400));
        assert_eq!(p.get(ICANON), None);
    }

    #[test]
    fn empty_modes() {
        let b = write_ssh_vec(&TermModes::default()).unwrap();
        assert_eq!(b, [TTY_OP_END]);
        assert!(TermModes::parse(&[ECHO, 0, 0]).is_err());
    }
}
