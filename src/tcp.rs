//! TCP forwarding channels, `direct-tcpip` and `forwarded-tcpip`.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::Arc;

use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::{ChanCore, ChanHooks, ChanInner, ChanKind, ChanNum, Channel};
use crate::conn::{Conn, ConnShared, DispatchOpenError};
use crate::packets::{self, ChannelOpen, ChannelOpenType, ForwardedTcpip, GlobalRequestMethod};
use crate::sshnames::{ChanFail, SSH_GLOBAL_CANCEL_TCPIP_FORWARD, SSH_GLOBAL_TCPIP_FORWARD};

// read size for the local socket
const BRIDGE_BUF: usize = 32768;

// Queued data is bounded by the local window, it is only credited back
// once read.
struct TcpHooks {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChanHooks for TcpHooks {
    fn on_data(&mut self, data: &[u8]) -> Result<()> {
        match &self.tx {
            Some(tx) => tx.send(data.to_vec()).map_err(|_| Error::msg("TCP receiver dropped")),
            None => Ok(()),
        }
    }

    fn on_eof(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }

    fn on_close(&mut self) {
        self.tx = None;
    }

    fn credit_on_consume(&self) -> bool {
        true
    }
}

/// A TCP forwarding channel.
#[derive(Debug)]
pub struct TcpChannel {
    chan: Channel,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TcpChannel {
    pub fn channel(&self) -> &Channel {
        &self.chan
    }

    /// Returns data from the peer, `None` after EOF or close.
    ///
    /// The peer may only send more once data has been read.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        let d = self.rx.recv().await?;
        if let Err(e) = self.chan.consumed(d.len()).await {
            debug!("Channel {} window credit: {e}", self.chan.num());
        }
        Some(d)
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.chan.send_data(data).await
    }

    pub async fn send_eof(&self) -> Result<()> {
        self.chan.send_eof().await
    }

    /// Copies data both ways between the channel and a local stream.
    ///
    /// EOF is propagated in each direction. Returns once the channel
    /// is closed, which happens when either side fails or both reach EOF.
    pub async fn bridge<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let Self { chan, mut rx } = self;
        let num = chan.num();
        let (mut r, mut w) = tokio::io::split(stream);

        let up = async {
            let mut buf = vec![0u8; BRIDGE_BUF];
            loop {
                let n = r.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                chan.send_data(&buf[..n]).await?;
            }
            trace!("Channel {num} local EOF");
            chan.send_eof().await
        };

        let down = async {
            while let Some(d) = rx.recv().await {
                w.write_all(&d).await?;
                chan.consumed(d.len()).await?;
            }
            trace!("Channel {num} remote EOF");
            w.shutdown().await?;
            Ok::<_, Error>(())
        };

        // a failed direction closes the channel, ending the other
        let up = async {
            if let Err(e) = up.await {
                debug!("Channel {num} bridge upstream: {e}");
                chan.close().await;
            }
        };
        let down = async {
            if let Err(e) = down.await {
                debug!("Channel {num} bridge downstream: {e}");
                chan.close().await;
            }
        };

        match select(join(up, down), chan.closed()).await {
            Either::First(_) => {
                // both sides at EOF, wait for the peer's close
                chan.close().await;
            }
            Either::Second(_) => trace!("Channel {num} closed, bridge done"),
        }
        debug!("Channel {num} bridge finished");
        match chan.error().await {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A remote forward, listening on the server side.
#[derive(Debug, Clone, PartialEq)]
struct RemoteForward {
    bind_addr: String,
    bind_port: u32,
    host: String,
    port: u16,
}

/// Remote forwards requested by this client.
///
/// Incoming `forwarded-tcpip` opens are matched against these.
#[derive(Debug, Default)]
pub(crate) struct RemoteForwards {
    fwds: Vec<RemoteForward>,
}

impl RemoteForwards {
    pub(crate) fn add(&mut self, bind_addr: &str, bind_port: u32, host: &str, port: u16) {
        self.remove(bind_addr, bind_port);
        self.fwds.push(RemoteForward {
            bind_addr: bind_addr.into(),
            bind_port,
            host: host.into(),
            port,
        })
    }

    pub(crate) fn remove(&mut self, bind_addr: &str, bind_port: u32) -> bool {
        let l = self.fwds.len();
        self.fwds.retain(|f| !(f.bind_addr == bind_addr && f.bind_port == bind_port));
        self.fwds.len() != l
    }

    /// Returns the local target.
    ///
    /// Servers may report a different address to the one requested,
    /// such as "127.0.0.1" for "localhost", so the port alone matches
    /// when unambiguous.
    pub(crate) fn lookup(&self, addr: &str, port: u32) -> Option<(String, u16)> {
        let exact = self.fwds.iter().find(|f| f.bind_addr == addr && f.bind_port == port);
        let f = match exact {
            Some(f) => Some(f),
            None => {
                let mut by_port = self.fwds.iter().filter(|f| f.bind_port == port);
                match (by_port.next(), by_port.next()) {
                    (Some(f), None) => Some(f),
                    _ => None,
                }
            }
        };
        f.map(|f| (f.host.clone(), f.port))
    }
}

impl Conn {
    /// Opens a `direct-tcpip` channel to `host:port` from the server.
    ///
    /// `origin` is the address the connection originated from, reported
    /// to the server.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        origin: &str,
        origin_port: u16,
    ) -> Result<TcpChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let hooks = Box::new(TcpHooks { tx: Some(tx) });
        let ty = ChannelOpenType::DirectTcpip(packets::DirectTcpip {
            address: host.into(),
            port: port.into(),
            origin: origin.into(),
            origin_port: origin_port.into(),
        });
        let chan = self.open_channel(ty, ChanKind::DirectTcpip, hooks).await?;
        Ok(TcpChannel { chan, rx })
    }

    /// Forwards a local connection to `host:port` via the server.
    pub fn forward_stream(&self, stream: TcpStream, host: String, port: u16) -> JoinHandle<Result<()>> {
        let conn = self.clone();
        tokio::spawn(async move {
            let (origin, origin_port) = match stream.peer_addr() {
                Ok(a) => (a.ip().to_string(), a.port()),
                Err(_) => ("127.0.0.1".into(), 0),
            };
            let r = async {
                let ch = conn.open_direct_tcpip(&host, port, &origin, origin_port).await?;
                ch.bridge(stream).await
            }
            .await;
            if let Err(e) = &r {
                debug!("Forward from {origin}:{origin_port} to {host}:{port} ended: {e}");
            }
            r
        })
    }

    /// Accepts connections on `listener`, forwarding each to `host:port`
    /// via the server.
    ///
    /// Runs until the listener fails or the connection is lost.
    pub async fn local_forward(&self, listener: TcpListener, host: &str, port: u16) -> Result<()> {
        if let Ok(a) = listener.local_addr() {
            info!("Local forward listening on {a} -> {host}:{port}");
        }
        loop {
            if self.shared.is_lost() {
                return Ok(());
            }
            let (stream, from) = listener.accept().await?;
            debug!("Forwarding connection from {from}");
            // each forward runs independently, errors are logged in the task
            let _ = self.forward_stream(stream, host.into(), port);
        }
    }

    /// Asks the server to listen on `bind_addr:bind_port`, forwarding
    /// connections back to `local_host:local_port`.
    ///
    /// A `bind_port` of 0 lets the server choose, the listening port is
    /// returned.
    pub async fn request_remote_forward(
        &self,
        bind_addr: &str,
        bind_port: u32,
        local_host: &str,
        local_port: u16,
    ) -> Result<u32> {
        let req = GlobalRequestMethod::TcpipForward(packets::TcpipForward {
            address: bind_addr.into(),
            port: bind_port,
        });
        let reply = self.global_request(req, SSH_GLOBAL_TCPIP_FORWARD).await?;
        let port = match (bind_port, reply) {
            (0, Some(p)) => p,
            (0, None) => return Err(Error::msg("Server didn't allocate a port")),
            (p, _) => p,
        };
        info!("Remote forward {bind_addr}:{port} -> {local_host}:{local_port}");
        self.shared.forwards.lock(|f| f.borrow_mut().add(bind_addr, port, local_host, local_port));
        Ok(port)
    }

    /// Cancels a remote forward.
    ///
    /// Connections for the forward are refused from this point, even if
    /// the server fails the cancellation.
    pub async fn cancel_remote_forward(&self, bind_addr: &str, bind_port: u32) -> Result<()> {
        let known = self.shared.forwards.lock(|f| f.borrow_mut().remove(bind_addr, bind_port));
        if !known {
            debug!("Cancelling unknown remote forward {bind_addr}:{bind_port}");
        }
        let req = GlobalRequestMethod::CancelTcpipForward(packets::TcpipForward {
            address: bind_addr.into(),
            port: bind_port,
        });
        self.global_request(req, SSH_GLOBAL_CANCEL_TCPIP_FORWARD).await?;
        Ok(())
    }

    /// Handles a `forwarded-tcpip` open from the server.
    ///
    /// The channel is confirmed once the local connection succeeds.
    pub(crate) fn open_forwarded(
        &self,
        p: &ChannelOpen<'_>,
        t: &ForwardedTcpip<'_>,
    ) -> Result<(), DispatchOpenError> {
        let sh = &self.shared;
        if p.max_packet == 0 {
            return Err(Error::ProtocolViolation { num: ChanNum(p.num), msg: "zero max packet" }.into());
        }
        let addr = t.address.to_string_lossy();
        let Some((host, port)) = sh.forwards.lock(|f| f.borrow().lookup(&addr, t.port)) else {
            debug!("No remote forward for {addr}:{}", t.port);
            return Err(ChanFail::SSH_OPEN_ADMINISTRATIVELY_PROHIBITED.into());
        };
        let Some(permit) = sh.limiter().try_acquire() else {
            debug!("Channel limit reached, refusing forward");
            return Err(ChanFail::SSH_OPEN_RESOURCE_SHORTAGE.into());
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let hooks = Box::new(TcpHooks { tx: Some(tx) });
        let core = sh.insert_new(|num| {
            let inner = ChanInner::new_passive(sh.config.window, hooks, permit, p);
            ChanCore::new(num, ChanKind::ForwardedTcpip, inner)
        })?;
        debug!(
            "Channel {} forwarded from {}:{} to {host}:{port}",
            core.num(),
            t.origin.to_string_lossy(),
            t.origin_port
        );

        tokio::spawn(connect_forwarded(core, sh.clone(), host, port, rx));
        Ok(())
    }
}

async fn connect_forwarded(
    core: Arc<ChanCore>,
    sh: Arc<ConnShared>,
    host: String,
    port: u16,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let num = core.num();
    let c = tokio::time::timeout(sh.config.open_timeout, TcpStream::connect((host.as_str(), port)));
    let stream = match c.await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("Channel {num} connect to {host}:{port} failed: {e}");
            let mut inner = core.inner.lock().await;
            let reason = ChanFail::SSH_OPEN_CONNECT_FAILED as u32;
            if let Err(e) = core.reject_passive(&mut inner, reason, &e.to_string(), &sh) {
                debug!("Channel {num} reject failed: {e}");
            }
            return;
        }
        Err(_) => {
            debug!("Channel {num} connect to {host}:{port} timed out");
            let mut inner = core.inner.lock().await;
            let reason = ChanFail::SSH_OPEN_CONNECT_FAILED as u32;
            if let Err(e) = core.reject_passive(&mut inner, reason, "Connection timed out", &sh) {
                debug!("Channel {num} reject failed: {e}");
            }
            return;
        }
    };

    {
        let mut inner = core.inner.lock().await;
        if let Err(e) = core.accept_passive(&mut inner, &sh) {
            debug!("Channel {num} accept failed: {e}");
            core.finish(&mut inner, &sh, sh.is_lost());
            return;
        }
    }

    let chan = Channel::new(core, sh);
    if let Err(e) = (TcpChannel { chan, rx }).bridge(stream).await {
        debug!("Channel {num} forward ended: {e}");
    }
}
