//! Multiplexed channel state machine.
//!
//! Each channel has a [`ChanCore`] shared between the connection's inbound
//! dispatch and the application's [`Channel`] handle. Inbound messages update
//! windows and state, then call the kind-specific [`ChanHooks`].

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use heapless::Deque;
use tokio::sync::{watch, OwnedSemaphorePermit};

use crate::config::MAX_OUTSTANDING_REQS;
use crate::conn::ConnShared;
use crate::packets::{self, ChannelReqType, ChannelRequest, Packet};
use crate::sshwire::BinString;
use crate::sync::{Completion, SunsetMutex};

/// A local SSH protocol channel number
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
pub struct ChanNum(pub u32);

impl fmt::Display for ChanNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel lifecycle.
///
/// `Closed -> Opening -> Open -> Closing -> Closed`. A refused open may
/// stay in `Opening` while retrying, or move straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanState {
    Closed,
    Opening,
    Open,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChanKind {
    Session,
    DirectTcpip,
    ForwardedTcpip,
}

/// Kind specific handling of inbound channel messages.
///
/// Hooks run on the connection's dispatch path with the channel locked,
/// so must not block. An `Err` returned from a hook is recorded as the
/// channel's failure and the channel is closed, it is not returned
/// from [`Conn::dispatch()`](crate::Conn::dispatch).
#[allow(unused_variables)]
pub trait ChanHooks: Send {
    fn on_open_confirmation(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_open_failure(&mut self, reason: u32, desc: &str) {}

    fn on_data(&mut self, data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn on_extended_data(&mut self, code: u32, data: &[u8]) -> Result<()> {
        debug!("Ignoring extended data, code {code}");
        Ok(())
    }

    /// Returns whether the request succeeded. The default refuses all requests.
    fn on_request(&mut self, req: &ChannelReqType<'_>) -> Result<bool> {
        Ok(false)
    }

    fn on_success(&mut self) {}

    fn on_failure(&mut self) {}

    fn on_eof(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the channel reaches `Closed`, for any reason.
    fn on_close(&mut self) {}

    fn on_window_adjust(&mut self, remote_window: u32) {}

    /// Whether received data is credited back to the peer's window only
    /// once consumed, see [`Channel::consumed()`]. Otherwise it is
    /// credited on receipt.
    fn credit_on_consume(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub(crate) enum OpenOutcome {
    Confirmed,
    Failed { reason: u32, desc: String },
    Lost,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReqOutcome {
    Success,
    Failure,
    Closed,
    Lost,
}

/// Peer side channel variables, known once the open is confirmed
#[derive(Debug)]
struct ChanDir {
    /// The peer's channel number
    num: u32,
    max_packet: u32,
    window: u32,
}

pub(crate) struct ChanInner {
    state: ChanState,
    /// An open the caller stopped waiting for
    abandoned: bool,

    send: Option<ChanDir>,
    local_window: u32,
    initial_window: u32,
    // received and consumed, not yet adjusted
    consumed: u32,
    credit_on_consume: bool,

    sent_close: bool,
    sent_eof: bool,
    recv_eof: bool,
    lost: bool,

    pending_open: Option<Arc<Completion<OpenOutcome>>>,
    // replies arrive in request order
    pending_reqs: Deque<Arc<Completion<ReqOutcome>>, MAX_OUTSTANDING_REQS>,

    hooks: Box<dyn ChanHooks>,
    permit: Option<OwnedSemaphorePermit>,
    failure: Option<String>,
}

impl ChanInner {
    /// Local channel variables for an active open
    pub(crate) fn new(
        window: u32,
        hooks: Box<dyn ChanHooks>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            state: ChanState::Opening,
            abandoned: false,
            send: None,
            local_window: window,
            initial_window: window,
            consumed: 0,
            credit_on_consume: hooks.credit_on_consume(),
            sent_close: false,
            sent_eof: false,
            recv_eof: false,
            lost: false,
            pending_open: None,
            pending_reqs: Deque::new(),
            hooks,
            permit: Some(permit),
            failure: None,
        }
    }

    /// For a peer initiated open, the peer's variables are known immediately
    pub(crate) fn new_passive(
        window: u32,
        hooks: Box<dyn ChanHooks>,
        permit: OwnedSemaphorePermit,
        open: &packets::ChannelOpen<'_>,
    ) -> Self {
        let mut s = Self::new(window, hooks, permit);
        s.send = Some(ChanDir {
            num: open.num,
            max_packet: open.max_packet,
            window: open.initial_window,
        });
        s
    }
}

pub(crate) struct ChanCore {
    num: ChanNum,
    kind: ChanKind,
    pub(crate) inner: SunsetMutex<ChanInner>,
    close_done: Completion<()>,
    // bumped on window adjust and close, for blocked senders
    window_wake: watch::Sender<u64>,
    /// Handle dropped while the lock was busy, the connection sweeps it.
    pub(crate) disposed: AtomicBool,
}

impl ChanCore {
    pub(crate) fn new(num: ChanNum, kind: ChanKind, inner: ChanInner) -> Self {
        let (window_wake, _) = watch::channel(0);
        Self {
            num,
            kind,
            inner: SunsetMutex::new(inner),
            close_done: Completion::new(),
            window_wake,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn num(&self) -> ChanNum {
        self.num
    }

    fn violation(&self, msg: &'static str) -> Error {
        warn!("Channel {} protocol violation: {msg}", self.num);
        Error::ProtocolViolation { num: self.num, msg }
    }

    fn wake_senders(&self) {
        self.window_wake.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Sends an open request, the outcome is delivered to `done`.
    pub(crate) fn send_open(
        &self,
        inner: &mut ChanInner,
        ty: packets::ChannelOpenType<'_>,
        max_packet: u32,
        done: Arc<Completion<OpenOutcome>>,
        conn: &ConnShared,
    ) -> Result<()> {
        if inner.state != ChanState::Opening {
            return Err(Error::TransportLost { num: self.num });
        }
        inner.pending_open = Some(done);
        conn.send(packets::ChannelOpen {
            num: self.num.0,
            initial_window: inner.initial_window,
            max_packet,
            ty,
        })
    }

    /// Confirms a peer initiated open.
    pub(crate) fn accept_passive(&self, inner: &mut ChanInner, conn: &ConnShared) -> Result<()> {
        if inner.state != ChanState::Opening {
            return Err(Error::TransportLost { num: self.num });
        }
        let send = inner.send.as_ref().trap()?;
        conn.send(packets::ChannelOpenConfirmation {
            num: send.num,
            sender_num: self.num.0,
            initial_window: inner.initial_window,
            max_packet: conn.config.local_max_packet(),
        })?;
        inner.state = ChanState::Open;
        debug!("Channel {} {:?} accepted", self.num, self.kind);
        let r = inner.hooks.on_open_confirmation();
        self.hook_result(inner, r, conn)
    }

    /// Refuses a peer initiated open and removes the channel.
    pub(crate) fn reject_passive(
        &self,
        inner: &mut ChanInner,
        reason: u32,
        desc: &str,
        conn: &ConnShared,
    ) -> Result<()> {
        let r = match (&inner.send, inner.state) {
            (Some(send), ChanState::Opening) => conn.send(packets::ChannelOpenFailure {
                num: send.num,
                reason,
                desc: desc.into(),
                lang: "",
            }),
            _ => Ok(()),
        };
        self.finish(inner, conn, false);
        r
    }

    /// Marks an open as no longer waited on. A late reply closes the channel.
    pub(crate) fn abandon(&self, inner: &mut ChanInner) {
        inner.abandoned = true;
        inner.pending_open = None;
    }

    /// Sends close if not already sent.
    fn start_close(&self, inner: &mut ChanInner, conn: &ConnShared) -> Result<()> {
        if !inner.sent_close {
            if let Some(send) = &inner.send {
                conn.send(packets::ChannelClose { num: send.num })?;
                inner.sent_close = true;
                trace!("Channel {} sent close", self.num);
            }
        }
        if inner.state == ChanState::Open {
            inner.state = ChanState::Closing;
        }
        Ok(())
    }

    /// Moves to `Closed` and releases everything the channel holds.
    ///
    /// Idempotent. Waiters on open, close, requests, and window space
    /// are all released.
    pub(crate) fn finish(&self, inner: &mut ChanInner, conn: &ConnShared, lost: bool) {
        if inner.state == ChanState::Closed {
            return;
        }
        debug!("Channel {} {:?} closed{}", self.num, self.kind, if lost { ", transport lost" } else { "" });
        inner.state = ChanState::Closed;
        inner.lost |= lost;
        inner.permit = None;
        if let Some(o) = inner.pending_open.take() {
            o.complete(OpenOutcome::Lost);
        }
        let outcome = if lost { ReqOutcome::Lost } else { ReqOutcome::Closed };
        while let Some(r) = inner.pending_reqs.pop_front() {
            r.complete(outcome);
        }
        inner.hooks.on_close();
        self.close_done.complete(());
        self.wake_senders();
        conn.remove(self.num);
    }

    /// Releases the application's interest. Never fails.
    ///
    /// A channel still waiting on the peer is forced `Closed` after the
    /// close timeout.
    pub(crate) fn dispose(self: &Arc<Self>, inner: &mut ChanInner, conn: &Arc<ConnShared>) {
        self.disposed.store(false, Ordering::Release);
        match inner.state {
            ChanState::Open => {
                if let Err(e) = self.start_close(inner, conn) {
                    debug!("Channel {} dispose: {e}", self.num);
                    self.finish(inner, conn, true);
                }
            }
            ChanState::Opening => self.abandon(inner),
            ChanState::Closing | ChanState::Closed => (),
        }
        if inner.state != ChanState::Closed {
            expire(self.clone(), conn.clone());
        }
    }

    fn hook_failed(&self, inner: &mut ChanInner, e: Error, conn: &ConnShared) -> Result<()> {
        warn!("Channel {} hook failed: {e}", self.num);
        if inner.failure.is_none() {
            inner.failure = Some(e.to_string());
        }
        self.start_close(inner, conn)
    }

    fn hook_result(&self, inner: &mut ChanInner, r: Result<()>, conn: &ConnShared) -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) => self.hook_failed(inner, e, conn),
        }
    }

    /// Incoming channel packet handling.
    ///
    /// Returns `ProtocolViolation` for messages invalid in the current state.
    pub(crate) async fn dispatch(&self, p: Packet<'_>, conn: &ConnShared) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.dispatch_inner(&mut inner, p, conn)
    }

    fn dispatch_inner(&self, inner: &mut ChanInner, p: Packet<'_>, conn: &ConnShared) -> Result<()> {
        trace!("Channel {} {:?} in {:?}", self.num, p.message_num(), inner.state);
        if inner.state == ChanState::Closed {
            debug!("Ignoring {:?} for closed channel {}", p.message_num(), self.num);
            return Ok(());
        }

        match p {
            Packet::ChannelOpenConfirmation(p) => self.open_confirmed(inner, &p, conn),
            Packet::ChannelOpenFailure(p) => self.open_failed(inner, &p, conn),
            Packet::ChannelWindowAdjust(p) => {
                if inner.state == ChanState::Opening {
                    return Err(self.violation("window adjust before open"));
                }
                let send = inner.send.as_mut().trap()?;
                send.window = send
                    .window
                    .checked_add(p.adjust)
                    .ok_or_else(|| self.violation("window adjust overflow"))?;
                let w = send.window;
                trace!("Channel {} remote window {w}", self.num);
                inner.hooks.on_window_adjust(w);
                self.wake_senders();
                Ok(())
            }
            Packet::ChannelData(p) => self.data_in(inner, None, p.data.0, conn),
            Packet::ChannelDataExt(p) => self.data_in(inner, Some(p.code), p.data.0, conn),
            Packet::ChannelEof(_) => {
                if inner.state == ChanState::Opening {
                    return Err(self.violation("EOF before open"));
                }
                if inner.recv_eof {
                    debug!("Channel {} ignoring duplicate EOF", self.num);
                    return Ok(());
                }
                inner.recv_eof = true;
                let r = inner.hooks.on_eof();
                self.hook_result(inner, r, conn)
            }
            Packet::ChannelClose(_) => {
                if inner.state == ChanState::Opening {
                    return Err(self.violation("close before open"));
                }
                // reply before the channel number can be reused
                let r = self.start_close(inner, conn);
                self.finish(inner, conn, false);
                r
            }
            Packet::ChannelRequest(p) => self.request_in(inner, &p, conn),
            Packet::ChannelSuccess(_) => self.reply_in(inner, true),
            Packet::ChannelFailure(_) => self.reply_in(inner, false),
            _ => Error::bug_msg("non-channel packet"),
        }
    }

    fn open_confirmed(
        &self,
        inner: &mut ChanInner,
        p: &packets::ChannelOpenConfirmation,
        conn: &ConnShared,
    ) -> Result<()> {
        if inner.state != ChanState::Opening {
            return Err(self.violation("open confirmation when not opening"));
        }
        if !inner.abandoned && inner.pending_open.is_none() {
            return Err(self.violation("unexpected open confirmation"));
        }
        if p.max_packet == 0 {
            return Err(self.violation("zero max packet"));
        }
        inner.send = Some(ChanDir {
            num: p.sender_num,
            max_packet: p.max_packet,
            window: p.initial_window,
        });
        inner.state = ChanState::Open;

        if inner.abandoned {
            debug!("Channel {} late confirmation, closing", self.num);
            return self.start_close(inner, conn);
        }

        debug!("Channel {} {:?} open, peer {}", self.num, self.kind, p.sender_num);
        let r = inner.hooks.on_open_confirmation();
        if let Some(done) = inner.pending_open.take() {
            done.complete(OpenOutcome::Confirmed);
        }
        self.hook_result(inner, r, conn)
    }

    fn open_failed(
        &self,
        inner: &mut ChanInner,
        p: &packets::ChannelOpenFailure<'_>,
        conn: &ConnShared,
    ) -> Result<()> {
        if inner.state != ChanState::Opening {
            return Err(self.violation("open failure when not opening"));
        }
        let desc = p.desc.to_string_lossy();
        debug!("Channel {} open failed, reason {}: {desc}", self.num, p.reason);
        inner.hooks.on_open_failure(p.reason, &desc);

        if inner.abandoned {
            self.finish(inner, conn, false);
            return Ok(());
        }

        // stays Opening, the opener decides whether to retry
        match inner.pending_open.take() {
            Some(done) => {
                done.complete(OpenOutcome::Failed { reason: p.reason, desc });
                Ok(())
            }
            None => Err(self.violation("unexpected open failure")),
        }
    }

    fn data_in(
        &self,
        inner: &mut ChanInner,
        code: Option<u32>,
        data: &[u8],
        conn: &ConnShared,
    ) -> Result<()> {
        if inner.state == ChanState::Opening {
            return Err(self.violation("data before open"));
        }
        if inner.recv_eof {
            return Err(self.violation("data after EOF"));
        }
        let len = u32::try_from(data.len()).map_err(|_| self.violation("data too long"))?;
        if len > inner.local_window {
            return Err(self.violation("data exceeds window"));
        }
        if len > conn.config.local_max_packet() {
            return Err(self.violation("data exceeds max packet"));
        }
        inner.local_window -= len;
        if !inner.credit_on_consume || inner.state != ChanState::Open {
            inner.consumed += len;
        }

        if inner.state == ChanState::Open {
            let r = match code {
                None => inner.hooks.on_data(data),
                Some(c) => inner.hooks.on_extended_data(c, data),
            };
            self.hook_result(inner, r, conn)?;
        } else {
            trace!("Channel {} discarding {len} bytes while closing", self.num);
        }

        self.check_window_adjust(inner, conn)
    }

    /// Credits back consumed data once the window is below the low water mark.
    fn check_window_adjust(&self, inner: &mut ChanInner, conn: &ConnShared) -> Result<()> {
        if inner.local_window >= conn.config.low_water()
            || inner.consumed == 0
            || inner.sent_close
            || inner.recv_eof
        {
            return Ok(());
        }
        let adjust = inner.consumed;
        inner.consumed = 0;
        inner.local_window += adjust;
        let num = inner.send.as_ref().trap()?.num;
        trace!("Channel {} window adjust {adjust}", self.num);
        conn.send(packets::ChannelWindowAdjust { num, adjust })
    }

    pub(crate) fn consumed(&self, inner: &mut ChanInner, len: usize, conn: &ConnShared) -> Result<()> {
        if inner.state != ChanState::Open {
            return Ok(());
        }
        let len = u32::try_from(len).map_err(|_| Error::msg("Consumed more than received"))?;
        let outstanding = inner.initial_window - inner.local_window - inner.consumed;
        if len > outstanding {
            return Err(Error::msg("Consumed more than received"));
        }
        inner.consumed += len;
        self.check_window_adjust(inner, conn)
    }

    fn request_in(
        &self,
        inner: &mut ChanInner,
        p: &ChannelRequest<'_>,
        conn: &ConnShared,
    ) -> Result<()> {
        match inner.state {
            ChanState::Opening => return Err(self.violation("request before open")),
            ChanState::Open => (),
            _ => {
                debug!("Channel {} ignoring request \"{}\" while closing", self.num, p.req.name());
                return Ok(());
            }
        }

        let (ok, err) = match inner.hooks.on_request(&p.req) {
            Ok(ok) => (ok, None),
            Err(e) => (false, Some(e)),
        };

        if !ok {
            if let ChannelReqType::Unknown(u) = &p.req {
                debug!("Channel {} unknown request \"{}\"", self.num, u.name);
            } else {
                debug!("Channel {} refused request \"{}\"", self.num, p.req.name());
            }
        }

        if p.want_reply {
            let num = inner.send.as_ref().trap()?.num;
            if ok {
                conn.send(packets::ChannelSuccess { num })?;
            } else {
                conn.send(packets::ChannelFailure { num })?;
            }
        }

        match err {
            Some(e) => self.hook_failed(inner, e, conn),
            None => Ok(()),
        }
    }

    fn reply_in(&self, inner: &mut ChanInner, success: bool) -> Result<()> {
        if inner.state == ChanState::Opening {
            return Err(self.violation("request reply before open"));
        }
        let Some(r) = inner.pending_reqs.pop_front() else {
            return Err(self.violation("request reply with none outstanding"));
        };
        if success {
            r.complete(ReqOutcome::Success);
            inner.hooks.on_success();
        } else {
            r.complete(ReqOutcome::Failure);
            inner.hooks.on_failure();
        }
        Ok(())
    }
}

/// Forces a channel `Closed` if the peer hasn't finished it within the
/// close timeout, releasing its table entry and limiter permit.
pub(crate) fn expire(core: Arc<ChanCore>, conn: Arc<ConnShared>) {
    let Ok(rt) = tokio::runtime::Handle::try_current() else {
        debug!("Channel {} released outside a runtime, no close timeout", core.num);
        return;
    };
    rt.spawn(async move {
        let r = core.close_done.wait_timeout(conn.config.close_timeout).await;
        if !matches!(r, Ok(Some(()))) {
            let mut inner = core.inner.lock().await;
            if inner.state != ChanState::Closed {
                debug!("Channel {} peer close timed out", core.num);
            }
            core.finish(&mut inner, &conn, false);
        }
    });
}

/// An open channel.
///
/// Dropping the handle disposes of the channel: it is closed if still
/// open, and never blocks.
pub struct Channel {
    core: Arc<ChanCore>,
    conn: Arc<ConnShared>,
}

impl Channel {
    pub(crate) fn new(core: Arc<ChanCore>, conn: Arc<ConnShared>) -> Self {
        Self { core, conn }
    }

    /// Local channel number
    pub fn num(&self) -> ChanNum {
        self.core.num
    }

    pub fn kind(&self) -> ChanKind {
        self.core.kind
    }

    pub async fn state(&self) -> ChanState {
        self.core.inner.lock().await.state
    }

    /// The current send window.
    pub async fn remote_window(&self) -> u32 {
        let inner = self.core.inner.lock().await;
        inner.send.as_ref().map_or(0, |s| s.window)
    }

    /// The current receive window.
    pub async fn local_window(&self) -> u32 {
        self.core.inner.lock().await.local_window
    }

    /// Returns the channel's failure, if any.
    ///
    /// `HookFailed` for a captured hook error, `TransportLost` if the
    /// session went away.
    pub async fn error(&self) -> Option<Error> {
        let inner = self.core.inner.lock().await;
        let num = self.core.num;
        if inner.lost {
            Some(Error::TransportLost { num })
        } else {
            inner.failure.clone().map(|msg| Error::HookFailed { num, msg })
        }
    }

    /// Waits until the channel reaches `Closed`.
    pub async fn closed(&self) {
        let _ = self.core.close_done.wait().await;
    }

    fn can_send(&self, inner: &ChanInner) -> Result<()> {
        match inner.state {
            ChanState::Open if !inner.sent_eof && !inner.sent_close => Ok(()),
            ChanState::Closed if inner.lost => Err(Error::TransportLost { num: self.core.num }),
            _ => Err(Error::ChannelEOF),
        }
    }

    /// Sends all of `data`.
    ///
    /// Data is split into packets no larger than the peer's window or max
    /// packet size. Waits while the peer's window is exhausted.
    pub async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.send_inner(None, data).await
    }

    /// Sends extended data, such as `SSH_EXTENDED_DATA_STDERR`.
    pub async fn send_ext_data(&self, code: u32, data: &[u8]) -> Result<()> {
        self.send_inner(Some(code), data).await
    }

    async fn send_inner(&self, code: Option<u32>, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            // subscribed before checking the window so an adjust isn't missed
            let mut wake = self.core.window_wake.subscribe();
            {
                let mut inner = self.core.inner.lock().await;
                self.can_send(&inner)?;
                let send = inner.send.as_mut().trap()?;
                let max = send.window.min(send.max_packet) as usize;
                let n = data.len().min(max);
                if n > 0 {
                    let (chunk, rest) = data.split_at(n);
                    let num = send.num;
                    send.window -= n as u32;
                    let d = BinString(chunk);
                    match code {
                        None => self.conn.send(packets::ChannelData { num, data: d })?,
                        Some(code) => {
                            self.conn.send(packets::ChannelDataExt { num, code, data: d })?
                        }
                    }
                    data = rest;
                    continue;
                }
                trace!("Channel {} waiting for window", self.core.num);
            }
            wake.changed().await.trap()?;
        }
        Ok(())
    }

    /// Credits `len` bytes of received data back to the peer's window.
    ///
    /// Only needed when the channel's hooks
    /// [`credit_on_consume()`](ChanHooks::credit_on_consume).
    pub async fn consumed(&self, len: usize) -> Result<()> {
        let mut inner = self.core.inner.lock().await;
        self.core.consumed(&mut inner, len, &self.conn)
    }

    /// Sends EOF. Idempotent, no more data may be sent afterwards.
    pub async fn send_eof(&self) -> Result<()> {
        let mut inner = self.core.inner.lock().await;
        if inner.sent_eof {
            return Ok(());
        }
        self.can_send(&inner)?;
        let num = inner.send.as_ref().trap()?.num;
        self.conn.send(packets::ChannelEof { num })?;
        inner.sent_eof = true;
        Ok(())
    }

    /// Sends a request, with `want_reply` waits for the peer's reply.
    ///
    /// A `failure` reply returns `RequestFailed`.
    pub async fn request(&self, req: ChannelReqType<'_>, want_reply: bool) -> Result<()> {
        let num = self.core.num;
        let name = req.name();
        let done = {
            let mut inner = self.core.inner.lock().await;
            match inner.state {
                ChanState::Open if !inner.sent_close => (),
                ChanState::Closed if inner.lost => return Err(Error::TransportLost { num }),
                _ => return Err(Error::ChannelEOF),
            }
            let send_num = inner.send.as_ref().trap()?.num;
            let done = if want_reply {
                let d = Arc::new(Completion::new());
                inner.pending_reqs.push_back(d.clone()).map_err(|_| Error::NoRoom)?;
                Some(d)
            } else {
                None
            };
            trace!("Channel {num} request \"{name}\"");
            if let Err(e) = self.conn.send(ChannelRequest { num: send_num, want_reply, req }) {
                // no reply will come for it
                if done.is_some() {
                    inner.pending_reqs.pop_back();
                }
                return Err(e);
            }
            done
        };

        let Some(done) = done else {
            return Ok(());
        };

        match done.wait_timeout(self.conn.config.request_timeout).await? {
            Some(ReqOutcome::Success) => Ok(()),
            Some(ReqOutcome::Failure) => Err(Error::RequestFailed { num, req: name }),
            Some(ReqOutcome::Lost) => Err(Error::TransportLost { num }),
            Some(ReqOutcome::Closed) => Err(Error::ChannelEOF),
            None => Err(Error::Timeout { num, op: "request reply" }),
        }
    }

    /// Checks the peer is responsive. Either reply counts as alive.
    pub async fn keepalive(&self) -> Result<()> {
        match self.request(ChannelReqType::Keepalive, true).await {
            Ok(()) | Err(Error::RequestFailed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Closes the channel and waits for the peer's close.
    ///
    /// Waits at most the configured close timeout, after which the channel
    /// is forced `Closed`. Never fails, may be called repeatedly.
    pub async fn close(&self) {
        {
            let mut inner = self.core.inner.lock().await;
            match inner.state {
                ChanState::Closed => return,
                ChanState::Opening => self.core.abandon(&mut inner),
                ChanState::Open | ChanState::Closing => {
                    if let Err(e) = self.core.start_close(&mut inner, &self.conn) {
                        debug!("Channel {} close failed: {e}", self.core.num);
                        self.core.finish(&mut inner, &self.conn, true);
                        return;
                    }
                }
            }
        }

        let r = self.core.close_done.wait_timeout(self.conn.config.close_timeout).await;
        if !matches!(r, Ok(Some(()))) {
            debug!("Channel {} close timed out", self.core.num);
            let mut inner = self.core.inner.lock().await;
            self.core.finish(&mut inner, &self.conn, false);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("num", &self.core.num).field("kind", &self.core.kind).finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        match self.core.inner.try_lock() {
            Ok(mut inner) => self.core.dispose(&mut inner, &self.conn),
            Err(_) => {
                // swept by the next dispatch
                self.core.disposed.store(true, Ordering::Release);
                self.conn.sweep_needed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChanConfig;
    use crate::packets::*;
    use crate::sshwire::packet_from_bytes;
    use crate::test::*;

    struct FailingHooks;

    impl ChanHooks for FailingHooks {
        fn on_data(&mut self, _data: &[u8]) -> Result<()> {
            Err(Error::msg("sink broke"))
        }
    }

    #[tokio::test]
    async fn close_idempotent() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        let before = t.count();

        tokio::join!(ch.close(), async {
            t.wait_sent(before + 1).await;
            peer_close(&conn).await;
        });
        ch.close().await;
        ch.close().await;
        drop(ch);

        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        assert_eq!(conn.channel_count(), 0);
    }

    #[tokio::test]
    async fn peer_close_first() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        peer_close(&conn).await;
        assert_eq!(ch.state().await, ChanState::Closed);
        ch.close().await;
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        assert!(matches!(ch.send_data(b"x").await, Err(Error::ChannelEOF)));
    }

    #[tokio::test]
    async fn close_timeout_forces_closed() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.close_timeout = core::time::Duration::from_millis(20);
        config.max_channels = 1;
        let (conn, t) = test_conn(config);
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        ch.close().await;
        assert_eq!(ch.state().await, ChanState::Closed);
        assert_eq!(conn.channel_count(), 0);
        // the permit was released
        assert_eq!(conn.available_channels(), 1);
        // a late close from the peer is ignored
        peer_close(&conn).await;
    }

    #[tokio::test]
    async fn window_adjust_threshold() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.window = 1000;
        let (conn, t) = test_conn(config);
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        let base = t.count_of(MessageNumber::SSH_MSG_CHANNEL_WINDOW_ADJUST);

        peer_data(&conn, &[0; 400]).await;
        assert_eq!(ch.local_window().await, 600);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_WINDOW_ADJUST), base);

        peer_data(&conn, &[0; 101]).await;
        assert_eq!(ch.local_window().await, 1000);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_WINDOW_ADJUST), base + 1);
        let b = t.last();
        let p = packet_from_bytes(&b).unwrap();
        assert_eq!(p, Packet::from(ChannelWindowAdjust { num: PEER_NUM, adjust: 501 }));

        // exactly at the threshold is not below it
        peer_data(&conn, &[0; 500]).await;
        assert_eq!(ch.local_window().await, 500);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_WINDOW_ADJUST), base + 1);

        let r = conn.dispatch(ChannelData { num: 0, data: BinString(&[0; 501]) }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn unknown_request_refused() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        let req = ChannelRequest {
            num: ch.num().0,
            want_reply: true,
            req: ChannelReqType::Unknown(UnknownReq {
                name: Unknown(b"frobnicate@example.com"),
                data: &[1, 2, 3],
            }),
        };
        conn.dispatch(req.into()).await.unwrap();
        let b = t.last();
        let p = packet_from_bytes(&b).unwrap();
        assert_eq!(p, Packet::from(ChannelFailure { num: PEER_NUM }));
        assert_eq!(ch.state().await, ChanState::Open);
        assert!(ch.error().await.is_none());
    }

    #[tokio::test]
    async fn messages_before_open() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let c = conn.clone();
        let h = tokio::spawn(async move { c.open_session().await });
        t.wait_sent(1).await;

        let r = conn.dispatch(ChannelData { num: 0, data: BinString(b"early") }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { num: ChanNum(0), .. })));
        let r = conn.dispatch(ChannelSuccess { num: 0 }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));

        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        let ch = h.await.unwrap().unwrap();
        // no request outstanding
        let r = conn.dispatch(ChannelFailure { num: ch.channel().num().0 }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn hook_error_captured() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let c = conn.clone();
        let h = tokio::spawn(async move {
            c.open_channel(
                ChannelOpenType::Session,
                ChanKind::Session,
                Box::new(FailingHooks),
            )
            .await
        });
        t.wait_sent(1).await;
        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        let ch = h.await.unwrap().unwrap();

        // the dispatch loop is unaffected
        peer_data(&conn, b"boom").await;
        assert!(matches!(ch.error().await, Some(Error::HookFailed { .. })));
        assert_eq!(ch.state().await, ChanState::Closing);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
    }

    #[tokio::test]
    async fn request_reply() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        let n = t.count();
        let (r, _) = tokio::join!(
            ch.request(ChannelReqType::Subsystem(Subsystem { subsystem: "sftp".into() }), true),
            async {
                t.wait_sent(n + 1).await;
                conn.dispatch(ChannelFailure { num: 0 }.into()).await.unwrap();
            }
        );
        assert!(matches!(r, Err(Error::RequestFailed { num: ChanNum(0), .. })));

        let n = t.count();
        let (r, _) = tokio::join!(ch.keepalive(), async {
            t.wait_sent(n + 1).await;
            conn.dispatch(ChannelFailure { num: 0 }.into()).await.unwrap();
        });
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn send_blocks_on_window() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 10, 0x8000).await;
        let n = t.count();
        let (r, _) = tokio::join!(ch.send_data(b"0123456789abcdef"), async {
            t.wait_sent(n + 1).await;
            tokio::task::yield_now().await;
            // still waiting for window
            assert_eq!(t.count(), n + 1);
            conn.dispatch(ChannelWindowAdjust { num: 0, adjust: 100 }.into()).await.unwrap();
        });
        r.unwrap();
        assert_eq!(t.count(), n + 2);
        assert_eq!(ch.remote_window().await, 94);

        let r = conn.dispatch(ChannelWindowAdjust { num: 0, adjust: u32::MAX }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn eof_rules() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        ch.send_eof().await.unwrap();
        ch.send_eof().await.unwrap();
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_EOF), 1);
        assert!(matches!(ch.send_data(b"x").await, Err(Error::ChannelEOF)));

        conn.dispatch(ChannelEof { num: 0 }.into()).await.unwrap();
        conn.dispatch(ChannelEof { num: 0 }.into()).await.unwrap();
        let r = conn.dispatch(ChannelData { num: 0, data: BinString(b"late") }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn failed_request_send_not_pending() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        t.set_failing(true);
        assert!(ch.request(ChannelReqType::Shell, true).await.is_err());
        t.set_failing(false);

        // the reply belongs to the next request
        let n = t.count();
        let (r, _) = tokio::join!(
            ch.request(ChannelReqType::Subsystem(Subsystem { subsystem: "sftp".into() }), true),
            async {
                t.wait_sent(n + 1).await;
                conn.dispatch(ChannelSuccess { num: 0 }.into()).await.unwrap();
            }
        );
        r.unwrap();
        let r = conn.dispatch(ChannelSuccess { num: 0 }.into()).await;
        assert!(matches!(r, Err(Error::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn dropped_handle_expires() {
        init_test_log();
        let mut config = ChanConfig::default();
        config.close_timeout = core::time::Duration::from_millis(20);
        config.max_channels = 1;
        let (conn, t) = test_conn(config);
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        drop(ch);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        assert_eq!(conn.available_channels(), 0);

        // the peer never replies
        tokio::time::sleep(core::time::Duration::from_millis(200)).await;
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(conn.available_channels(), 1);
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        assert_eq!(ch.state().await, ChanState::Open);
    }

    #[tokio::test]
    async fn drop_sends_close() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let ch = open_chan(&conn, &t, 0x10000, 0x8000).await;
        drop(ch);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        assert_eq!(conn.channel_count(), 1);
        peer_close(&conn).await;
        assert_eq!(conn.channel_count(), 0);
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
    }
}
