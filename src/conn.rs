//! The connection's channel table and inbound dispatch.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use heapless::Deque;

use crate::channel::{self, ChanCore, ChanHooks, ChanInner, ChanKind, ChanNum, Channel, OpenOutcome};
use crate::config::{ChanConfig, MAX_OUTSTANDING_REQS};
use crate::packets::{self, ChannelOpen, ChannelOpenType, GlobalRequestMethod, MessageNumber, Packet};
use crate::sshnames::ChanFail;
use crate::sshwire;
use crate::sync::{ChanLimiter, Completion, SunsetBlockingMutex, SunsetMutex};
use crate::tcp::RemoteForwards;
use crate::traffic::Transport;

/// Allocates local channel numbers.
///
/// Owned by the session, numbers increment and wrap. [`Conn`] skips
/// numbers still in use.
#[derive(Debug, Default)]
pub struct ChanIds {
    next: AtomicU32,
}

impl ChanIds {
    pub fn new(first: u32) -> Self {
        Self { next: AtomicU32::new(first) }
    }

    pub fn next(&self) -> ChanNum {
        ChanNum(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum GlobalOutcome {
    Success(Option<u32>),
    Failure,
    Lost,
}

/// State shared by the [`Conn`] and its [`Channel`] handles.
pub(crate) struct ConnShared {
    transport: Arc<dyn Transport>,
    pub(crate) config: ChanConfig,
    limiter: ChanLimiter,
    ids: ChanIds,
    chans: SunsetBlockingMutex<BTreeMap<ChanNum, Arc<ChanCore>>>,
    pub(crate) forwards: SunsetBlockingMutex<RemoteForwards>,
    global_reqs: SunsetMutex<Deque<Arc<Completion<GlobalOutcome>>, MAX_OUTSTANDING_REQS>>,
    lost: AtomicBool,
    // a handle was dropped with its channel locked
    sweep: AtomicBool,
}

impl ConnShared {
    pub(crate) fn send<'p>(&self, p: impl Into<Packet<'p>>) -> Result<()> {
        self.transport.send(p.into())
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn limiter(&self) -> &ChanLimiter {
        &self.limiter
    }

    fn get(&self, num: ChanNum) -> Option<Arc<ChanCore>> {
        self.chans.lock(|c| c.borrow().get(&num).cloned())
    }

    fn all(&self) -> Vec<Arc<ChanCore>> {
        self.chans.lock(|c| c.borrow().values().cloned().collect())
    }

    /// Adds a channel with a free local number.
    pub(crate) fn insert_new(
        &self,
        f: impl FnOnce(ChanNum) -> ChanCore,
    ) -> Result<Arc<ChanCore>> {
        self.chans.lock(|c| {
            let mut c = c.borrow_mut();
            // among len+1 distinct numbers at least one is free
            let num = (0..=c.len())
                .map(|_| self.ids.next())
                .find(|n| !c.contains_key(n))
                .ok_or(Error::NoChannels)?;
            let core = Arc::new(f(num));
            c.insert(num, core.clone());
            Ok(core)
        })
    }

    pub(crate) fn remove(&self, num: ChanNum) {
        trace!("removing channel {num}");
        self.chans.lock(|c| c.borrow_mut().remove(&num));
    }

    pub(crate) fn sweep_needed(&self) {
        self.sweep.store(true, Ordering::Release);
    }
}

/// Multiplexes channels over a session's transport.
///
/// Inbound connection protocol messages are passed to
/// [`dispatch()`](Self::dispatch). Cloning gives another handle to the same
/// connection.
#[derive(Clone)]
pub struct Conn {
    pub(crate) shared: Arc<ConnShared>,
}

impl Conn {
    pub fn new(transport: Arc<dyn Transport>, ids: ChanIds, config: ChanConfig) -> Self {
        let limiter = ChanLimiter::new(config.max_channels);
        let shared = ConnShared {
            transport,
            config,
            limiter,
            ids,
            chans: SunsetBlockingMutex::new(Default::default()),
            forwards: SunsetBlockingMutex::new(Default::default()),
            global_reqs: SunsetMutex::new(Deque::new()),
            lost: AtomicBool::new(false),
            sweep: AtomicBool::new(false),
        };
        Self { shared: Arc::new(shared) }
    }

    pub fn config(&self) -> &ChanConfig {
        &self.shared.config
    }

    /// Number of channels in the table, in any state.
    pub fn channel_count(&self) -> usize {
        self.shared.chans.lock(|c| c.borrow().len())
    }

    /// Free slots in the channel limiter.
    pub fn available_channels(&self) -> usize {
        self.shared.limiter.available()
    }

    /// Whether a message number is handled by [`dispatch()`](Self::dispatch).
    pub fn handles(msg_num: u8) -> bool {
        MessageNumber::try_from(msg_num).is_ok()
    }

    /// Opens a channel and waits for the peer's confirmation.
    ///
    /// A refused open is resent up to `retry_attempts` times, after which
    /// `OpenRejected` is returned with the last reason.
    pub async fn open_channel(
        &self,
        ty: ChannelOpenType<'_>,
        kind: ChanKind,
        hooks: Box<dyn ChanHooks>,
    ) -> Result<Channel> {
        let sh = &self.shared;
        if sh.is_lost() {
            return Err(Error::Disconnected);
        }
        let permit = sh.limiter.acquire(sh.config.open_timeout).await?;
        let core = sh.insert_new(|num| {
            ChanCore::new(num, kind, ChanInner::new(sh.config.window, hooks, permit))
        })?;
        let num = core.num();
        if sh.is_lost() {
            // lost while acquiring, after transport_lost() released the table
            let mut inner = core.inner.lock().await;
            core.finish(&mut inner, sh, true);
            return Err(Error::Disconnected);
        }
        debug!("Channel {num} opening {kind:?}");

        let mut last = (0, String::new());
        for attempt in 0..=sh.config.retry_attempts {
            if attempt > 0 {
                debug!("Channel {num} open retry {attempt}");
            }
            let done = Arc::new(Completion::new());
            {
                let mut inner = core.inner.lock().await;
                let r = core.send_open(
                    &mut inner,
                    ty.clone(),
                    sh.config.local_max_packet(),
                    done.clone(),
                    sh,
                );
                if let Err(e) = r {
                    core.finish(&mut inner, sh, sh.is_lost());
                    return Err(e);
                }
            }

            let outcome = match done.wait_timeout(sh.config.open_timeout).await? {
                Some(o) => o,
                None => {
                    let mut inner = core.inner.lock().await;
                    // a reply may have raced the timeout
                    match done.peek() {
                        Some(o) => o,
                        None => {
                            debug!("Channel {num} open timed out");
                            core.abandon(&mut inner);
                            channel::expire(core.clone(), sh.clone());
                            return Err(Error::Timeout { num, op: "open" });
                        }
                    }
                }
            };

            match outcome {
                OpenOutcome::Confirmed => return Ok(Channel::new(core, sh.clone())),
                OpenOutcome::Failed { reason, desc } => last = (reason, desc),
                OpenOutcome::Lost => return Err(Error::TransportLost { num }),
            }
        }

        let mut inner = core.inner.lock().await;
        core.finish(&mut inner, sh, false);
        let (reason, desc) = last;
        Err(Error::OpenRejected { num, reason, desc })
    }

    /// Handles an inbound connection protocol message.
    ///
    /// Errors are protocol violations or transport failures, the session
    /// will usually disconnect. Hook errors are not returned here.
    pub async fn dispatch(&self, p: Packet<'_>) -> Result<()> {
        self.sweep().await;
        let sh = &self.shared;
        match p {
            Packet::ChannelOpen(p) => self.dispatch_open(&p),
            Packet::GlobalRequest(p) => {
                debug!("Refusing global request {:?}", p.req);
                if p.want_reply {
                    sh.send(packets::RequestFailure {})?;
                }
                Ok(())
            }
            Packet::RequestSuccess(p) => self.global_reply(GlobalOutcome::Success(p.port())).await,
            Packet::RequestFailure(_) => self.global_reply(GlobalOutcome::Failure).await,
            p => {
                let num = ChanNum(p.channel_num().trap()?);
                match sh.get(num) {
                    Some(ch) => ch.dispatch(p, sh).await,
                    None => {
                        warn!("Ignoring {:?} for unknown channel {num}", p.message_num());
                        Ok(())
                    }
                }
            }
        }
    }

    /// Decodes and dispatches a decrypted packet payload.
    pub async fn dispatch_payload(&self, payload: &[u8]) -> Result<()> {
        let p = sshwire::packet_from_bytes(payload)?;
        self.dispatch(p).await
    }

    /// Releases everything waiting on the connection.
    ///
    /// Called by the session when the transport fails or disconnects.
    /// Outstanding opens, requests and closes return `TransportLost`.
    pub async fn transport_lost(&self) {
        let sh = &self.shared;
        if sh.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Transport lost, releasing channels");
        sh.limiter.close();
        for ch in sh.all() {
            let mut inner = ch.inner.lock().await;
            ch.finish(&mut inner, sh, true);
        }
        let mut q = sh.global_reqs.lock().await;
        while let Some(g) = q.pop_front() {
            g.complete(GlobalOutcome::Lost);
        }
    }

    // disposes handles that were dropped with their channel locked
    async fn sweep(&self) {
        let sh = &self.shared;
        if !sh.sweep.swap(false, Ordering::AcqRel) {
            return;
        }
        for ch in sh.all() {
            if ch.disposed.load(Ordering::Acquire) {
                let mut inner = ch.inner.lock().await;
                ch.dispose(&mut inner, sh);
            }
        }
    }

    fn dispatch_open(&self, p: &ChannelOpen<'_>) -> Result<()> {
        let reason = match &p.ty {
            ChannelOpenType::Session => {
                // only servers accept sessions
                warn!("Peer opened a session channel");
                return Err(Error::ProtocolViolation {
                    num: ChanNum(p.num),
                    msg: "session open to a client",
                });
            }
            ChannelOpenType::DirectTcpip(_) => {
                debug!("Rejecting direct-tcpip open from peer");
                ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
            }
            ChannelOpenType::Unknown(u) => {
                debug!("Rejecting unknown channel type '{}'", u.name);
                ChanFail::SSH_OPEN_UNKNOWN_CHANNEL_TYPE
            }
            ChannelOpenType::ForwardedTcpip(t) => match self.open_forwarded(p, t) {
                Ok(()) => return Ok(()),
                Err(DispatchOpenError::Failure(f)) => f,
                Err(DispatchOpenError::Error(e)) => return Err(e),
            },
        };

        self.shared.send(packets::ChannelOpenFailure {
            // ChannelOpen.num is the sender's number
            num: p.num,
            reason: reason as u32,
            desc: reason.description().into(),
            lang: "",
        })
    }

    /// Sends a global request and waits for the reply.
    ///
    /// Returns the port from a `tcpip-forward` reply, if any.
    pub(crate) async fn global_request(
        &self,
        req: GlobalRequestMethod<'_>,
        name: &'static str,
    ) -> Result<Option<u32>> {
        let sh = &self.shared;
        if sh.is_lost() {
            return Err(Error::Disconnected);
        }
        let done = Arc::new(Completion::new());
        {
            // queued and sent together, so replies match request order
            let mut q = sh.global_reqs.lock().await;
            q.push_back(done.clone()).map_err(|_| Error::NoRoom)?;
            if let Err(e) = sh.send(packets::GlobalRequest { want_reply: true, req }) {
                q.pop_back();
                return Err(e);
            }
        }

        match done.wait_timeout(sh.config.request_timeout).await? {
            Some(GlobalOutcome::Success(port)) => Ok(port),
            Some(GlobalOutcome::Failure) => Err(Error::GlobalRequestFailed { req: name }),
            Some(GlobalOutcome::Lost) => Err(Error::Disconnected),
            None => Err(Error::GlobalTimeout { req: name }),
        }
    }

    async fn global_reply(&self, outcome: GlobalOutcome) -> Result<()> {
        let mut q = self.shared.global_reqs.lock().await;
        match q.pop_front() {
            Some(g) => {
                g.complete(outcome);
                Ok(())
            }
            None => {
                warn!("Global reply with no request outstanding");
                Err(Error::msg("Unexpected global request reply"))
            }
        }
    }
}

// for open_forwarded()
pub(crate) enum DispatchOpenError {
    Error(Error),
    Failure(ChanFail),
}

impl From<Error> for DispatchOpenError {
    fn from(e: Error) -> Self {
        match e {
            Error::NoChannels => Self::Failure(ChanFail::SSH_OPEN_RESOURCE_SHORTAGE),
            e => Self::Error(e),
        }
    }
}

impl From<ChanFail> for DispatchOpenError {
    fn from(f: ChanFail) -> Self {
        Self::Failure(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChanState;
    use crate::packets::*;
    use crate::sshwire::{packet_from_bytes, write_ssh_vec};
    use crate::test::*;
    use core::time::Duration;

    #[tokio::test]
    async fn open_retries_then_rejected() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.retry_attempts = 2;
        let (conn, t) = test_conn(config);

        let c = conn.clone();
        let h = tokio::spawn(async move { c.open_session().await });
        for i in 1..=3 {
            t.wait_sent(i).await;
            let b = t.last();
            let p = packet_from_bytes(&b).unwrap();
            let Packet::ChannelOpen(o) = p else { panic!("not an open: {p:?}") };
            assert!(matches!(o.ty, ChannelOpenType::Session));
            assert_eq!(o.max_packet, 0x8000);
            conn.dispatch(
                ChannelOpenFailure {
                    num: o.num,
                    reason: ChanFail::SSH_OPEN_RESOURCE_SHORTAGE as u32,
                    desc: "busy".into(),
                    lang: "",
                }
                .into(),
            )
            .await
            .unwrap();
        }
        let r = h.await.unwrap();
        match r {
            Err(Error::OpenRejected { reason, desc, .. }) => {
                assert_eq!(reason, 4);
                assert_eq!(desc, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_OPEN), 3);
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(conn.available_channels(), conn.config().max_channels);
    }

    #[tokio::test]
    async fn open_retry_succeeds() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.retry_attempts = 1;
        let (conn, t) = test_conn(config);

        let c = conn.clone();
        let h = tokio::spawn(async move { c.open_session().await });
        t.wait_sent(1).await;
        conn.dispatch(
            ChannelOpenFailure { num: 0, reason: 2, desc: "".into(), lang: "" }.into(),
        )
        .await
        .unwrap();
        t.wait_sent(2).await;
        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        let s = h.await.unwrap().unwrap();
        assert_eq!(s.channel().state().await, ChanState::Open);
    }

    #[tokio::test]
    async fn transport_loss_releases_open() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let c = conn.clone();
        let h = tokio::spawn(async move { c.open_session().await });
        t.wait_sent(1).await;
        conn.transport_lost().await;
        let r = h.await.unwrap();
        assert!(matches!(r, Err(Error::TransportLost { num: ChanNum(0) })));
        assert_eq!(conn.channel_count(), 0);

        let r = conn.open_session().await;
        assert!(matches!(r, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn transport_loss_releases_request() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        let n = t.count();
        let (r, _) = tokio::join!(ch.request(ChannelReqType::Shell, true), async {
            t.wait_sent(n + 1).await;
            conn.transport_lost().await;
        });
        assert!(matches!(r, Err(Error::TransportLost { .. })));
        assert!(matches!(ch.error().await, Some(Error::TransportLost { .. })));
        // close after loss returns promptly
        ch.close().await;
    }

    #[tokio::test]
    async fn open_timeout_then_late_confirm() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.open_timeout = Duration::from_millis(20);
        config.max_channels = 1;
        let (conn, t) = test_conn(config);
        let r = conn.open_session().await;
        assert!(matches!(r, Err(Error::Timeout { op: "open", .. })));
        // still held until the peer replies or the close timeout
        assert_eq!(conn.available_channels(), 0);

        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        peer_close(&conn).await;
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(conn.available_channels(), 1);
    }

    #[tokio::test]
    async fn abandoned_open_expires() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.open_timeout = Duration::from_millis(20);
        config.close_timeout = Duration::from_millis(20);
        config.max_channels = 1;
        let (conn, t) = test_conn(config);
        let r = conn.open_session().await;
        assert!(matches!(r, Err(Error::Timeout { op: "open", .. })));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(conn.available_channels(), 1);
        // a very late reply is ignored
        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_racing_transport_loss() {
        init_test_log();
        for _ in 0..50 {
            let (conn, _t) = test_conn(ChanConfig::default());
            let c = conn.clone();
            let h = tokio::spawn(async move { c.open_session().await });
            let c = conn.clone();
            let l = tokio::spawn(async move { c.transport_lost().await });
            let r = tokio::time::timeout(Duration::from_secs(5), h)
                .await
                .expect("open not released")
                .unwrap();
            assert!(matches!(r, Err(Error::Disconnected | Error::TransportLost { .. })));
            l.await.unwrap();
            assert_eq!(conn.channel_count(), 0);
        }
    }

    #[tokio::test]
    async fn refused_opens() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());

        let p: Packet = ChannelOpen {
            num: 9,
            initial_window: 1000,
            max_packet: 1000,
            ty: ChannelOpenType::DirectTcpip(DirectTcpip {
                address: "localhost".into(),
                port: 22,
                origin: "10.0.0.1".into(),
                origin_port: 5000,
            }),
        }
        .into();
        conn.dispatch(p).await.unwrap();
        let b = t.last();
        let Packet::ChannelOpenFailure(f) = packet_from_bytes(&b).unwrap() else { panic!() };
        assert_eq!((f.num, f.reason), (9, 1));

        // no forward registered
        let p: Packet = ChannelOpen {
            num: 10,
            initial_window: 1000,
            max_packet: 1000,
            ty: ChannelOpenType::ForwardedTcpip(ForwardedTcpip {
                address: "0.0.0.0".into(),
                port: 8022,
                origin: "10.0.0.1".into(),
                origin_port: 5000,
            }),
        }
        .into();
        conn.dispatch(p).await.unwrap();
        let b = t.last();
        let Packet::ChannelOpenFailure(f) = packet_from_bytes(&b).unwrap() else { panic!() };
        assert_eq!((f.num, f.reason), (10, 1));

        let p: Packet = ChannelOpen {
            num: 11,
            initial_window: 1000,
            max_packet: 1000,
            ty: ChannelOpenType::Unknown(UnknownReq {
                name: Unknown(b"x11"),
                data: &[],
            }),
        }
        .into();
        conn.dispatch(p).await.unwrap();
        let b = t.last();
        let Packet::ChannelOpenFailure(f) = packet_from_bytes(&b).unwrap() else { panic!() };
        assert_eq!((f.num, f.reason), (11, 3));

        let p: Packet = ChannelOpen {
            num: 12,
            initial_window: 1000,
            max_packet: 1000,
            ty: ChannelOpenType::Session,
        }
        .into();
        let r = conn.dispatch(p).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
        assert_eq!(conn.channel_count(), 0);
    }

    #[tokio::test]
    async fn global_requests() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());

        // refused peer request
        let p: Packet = GlobalRequest {
            want_reply: true,
            req: GlobalRequestMethod::Unknown(UnknownReq {
                name: Unknown(b"hostkeys-00@openssh.com"),
                data: &[],
            }),
        }
        .into();
        conn.dispatch(p).await.unwrap();
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_REQUEST_FAILURE), 1);

        let r = conn.dispatch(RequestFailure {}.into()).await;
        assert!(r.is_err());

        let n = t.count();
        let (r, _) = tokio::join!(conn.request_remote_forward("", 0, "localhost", 8000), async {
            t.wait_sent(n + 1).await;
            let port = 40022u32.to_be_bytes();
            conn.dispatch(RequestSuccess { data: &port }.into()).await.unwrap();
        });
        assert_eq!(r.unwrap(), 40022);

        let n = t.count();
        let (r, _) = tokio::join!(conn.cancel_remote_forward("", 40022), async {
            t.wait_sent(n + 1).await;
            conn.dispatch(RequestFailure {}.into()).await.unwrap();
        });
        assert!(matches!(r, Err(Error::GlobalRequestFailed { .. })));
    }

    #[tokio::test]
    async fn payload_entry() {
        init_test_log();
        let (conn, _t) = test_conn(ChanConfig::default());
        // unknown channel is ignored
        let b = write_ssh_vec(&Packet::from(ChannelEof { num: 77 })).unwrap();
        conn.dispatch_payload(&b).await.unwrap();
        assert!(conn.dispatch_payload(&[250, 0]).await.is_err());
        assert!(Conn::handles(94));
        assert!(!Conn::handles(20));
    }

    #[test]
    fn ids_wrap() {
        let ids = ChanIds::new(u32::MAX);
        assert_eq!(ids.next(), ChanNum(u32::MAX));
        assert_eq!(ids.next(), ChanNum(0));
    }
}
