//! The outbound side of the SSH transport.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use tokio::sync::mpsc;

use crate::packets::Packet;
use crate::sshwire;

/// Submits outbound connection protocol messages.
///
/// Implemented by the session that owns key exchange, encryption and
/// framing. `send()` is called with channel locks held so must not block
/// on channel progress, it should queue the packet and return.
pub trait Transport: Send + Sync {
    fn send(&self, p: Packet<'_>) -> Result<()>;
}

/// Sends encoded packet payloads to a queue, for a transport task
/// that encrypts and writes them.
impl Transport for mpsc::UnboundedSender<Vec<u8>> {
    fn send(&self, p: Packet<'_>) -> Result<()> {
        trace!("send {:?}", p.message_num());
        let b = sshwire::write_ssh_vec(&p)?;
        mpsc::UnboundedSender::send(self, b).map_err(|_| Error::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use crate::packets::*;
    use crate::sshwire::packet_from_bytes;
    use crate::traffic::*;

    #[test]
    fn queued_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        Transport::send(&tx, ChannelEof { num: 5 }.into()).unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(packet_from_bytes(&b).unwrap(), Packet::from(ChannelEof { num: 5 }));

        drop(rx);
        let r = Transport::send(&tx, ChannelClose { num: 5 }.into());
        assert!(matches!(r, Err(Error::Disconnected)));
    }
}
