//! Helpers for tests, a recording transport and a scripted peer.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};

use simplelog::{self, LevelFilter, TestLogger};
use tokio::sync::watch;

use crate::channel::Channel;
use crate::config::ChanConfig;
use crate::conn::{ChanIds, Conn};
use crate::error::{Error, Result};
use crate::packets::*;
use crate::session::SessionChannel;
use crate::sshwire::{self, packet_from_bytes};
use crate::traffic::Transport;

/// The peer's channel number in confirmations
pub const PEER_NUM: u32 = 100;

const WAIT: Duration = Duration::from_secs(5);

pub fn init_test_log() {
    let _ = TestLogger::init(LevelFilter::Trace, simplelog::Config::default());
}

/// Records sent packet payloads.
pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    count: watch::Sender<usize>,
    failing: AtomicBool,
}

impl Transport for MockTransport {
    fn send(&self, p: Packet<'_>) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::msg("transport failed"));
        }
        let b = sshwire::write_ssh_vec(&p)?;
        let n = {
            let mut s = self.sent.lock().unwrap();
            s.push(b);
            s.len()
        };
        self.count.send_replace(n);
        Ok(())
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { sent: Mutex::new(Vec::new()), count, failing: AtomicBool::new(false) }
    }

    /// While set, sends fail and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed)
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn count_of(&self, num: MessageNumber) -> usize {
        self.sent.lock().unwrap().iter().filter(|b| b[0] == num as u8).count()
    }

    pub fn last(&self) -> Vec<u8> {
        self.sent.lock().unwrap().last().expect("nothing sent").clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// Payloads of all `ChannelData` sent.
    pub fn data_packets(&self) -> Vec<Vec<u8>> {
        self.sent()
            .iter()
            .filter_map(|b| match packet_from_bytes(b).unwrap() {
                Packet::ChannelData(d) => Some(d.data.0.to_vec()),
                _ => None,
            })
            .collect()
    }

    pub fn data_sent(&self) -> usize {
        self.data_packets().iter().map(|d| d.len()).sum()
    }

    pub async fn wait_until(&self, f: impl Fn(&Self) -> bool) {
        // subscribed before checking so a send isn't missed
        let mut rx = self.count.subscribe();
        let w = async {
            while !f(self) {
                rx.changed().await.unwrap();
            }
        };
        tokio::time::timeout(WAIT, w).await.expect("timed out waiting for packets");
    }

    pub async fn wait_sent(&self, n: usize) {
        self.wait_until(|t| t.count() >= n).await
    }

    /// Waits for a message and returns the first of that type sent.
    pub async fn wait_msg(&self, num: MessageNumber) -> Vec<u8> {
        self.wait_until(|t| t.count_of(num) > 0).await;
        self.sent().into_iter().find(|b| b[0] == num as u8).unwrap()
    }
}

pub fn test_conn(config: ChanConfig) -> (Conn, Arc<MockTransport>) {
    let t = Arc::new(MockTransport::new());
    let conn = Conn::new(t.clone(), ChanIds::new(0), config);
    (conn, t)
}

pub async fn confirm_open(conn: &Conn, num: u32, window: u32, max_packet: u32) {
    let p = ChannelOpenConfirmation { num, sender_num: PEER_NUM, initial_window: window, max_packet };
    conn.dispatch(p.into()).await.unwrap();
}

/// Opens a session, the peer confirms with `window` and `max_packet`.
pub async fn open_session_with(
    conn: &Conn,
    t: &MockTransport,
    window: u32,
    max_packet: u32,
) -> SessionChannel {
    let n = t.count();
    let c = conn.clone();
    let h = tokio::spawn(async move { c.open_session().await });
    t.wait_sent(n + 1).await;
    let b = t.last();
    let Packet::ChannelOpen(o) = packet_from_bytes(&b).unwrap() else { panic!("not an open") };
    confirm_open(conn, o.num, window, max_packet).await;
    h.await.unwrap().unwrap()
}

pub async fn open_session_chan(conn: &Conn, t: &MockTransport) -> SessionChannel {
    open_session_with(conn, t, 0x10000, 0x8000).await
}

pub async fn open_chan(conn: &Conn, t: &MockTransport, window: u32, max_packet: u32) -> Channel {
    open_session_with(conn, t, window, max_packet).await.into_channel()
}

/// Data from the peer on local channel 0
pub async fn peer_data(conn: &Conn, data: &[u8]) {
    let p = ChannelData { num: 0, data: sshwire::BinString(data) };
    conn.dispatch(p.into()).await.unwrap();
}

/// Close from the peer on local channel 0
pub async fn peer_close(conn: &Conn) {
    conn.dispatch(ChannelClose { num: 0 }.into()).await.unwrap();
}
