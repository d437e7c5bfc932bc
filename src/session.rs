//! Session channels, for shells, commands and subsystems.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::cell::RefCell;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::channel::{ChanHooks, ChanKind, Channel};
use crate::conn::Conn;
use crate::packets::{self, ChannelOpenType, ChannelReqType};
use crate::request::{Pty, SessionCommand};
use crate::sshnames::SSH_EXTENDED_DATA_STDERR;
use crate::sync::{Completion, SunsetBlockingMutex};

/// How a remote command finished.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionExit {
    Status(u32),
    Signal { name: String, core: bool, message: String },
}

/// Streamed session output, see [`SessionChannel::stream()`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionData {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// The result of [`Conn::run()`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<SessionExit>,
}

impl ExecOutput {
    /// The exit status, `None` if killed by a signal or not reported.
    pub fn status(&self) -> Option<u32> {
        match self.exit {
            Some(SessionExit::Status(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Default)]
struct SessionOut {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit: Option<SessionExit>,
    xon_xoff: Option<bool>,
    eof: bool,
    closed: bool,
    stream: Option<mpsc::UnboundedSender<SessionData>>,
}

impl SessionOut {
    fn output(&mut self, d: SessionData) -> Result<()> {
        if let Some(tx) = &self.stream {
            return tx.send(d).map_err(|_| Error::msg("Session output receiver dropped"));
        }
        match d {
            SessionData::Stdout(d) => self.stdout.extend_from_slice(&d),
            SessionData::Stderr(d) => self.stderr.extend_from_slice(&d),
        }
        Ok(())
    }

    // EOF and exit status may arrive in either order. Close always completes.
    fn is_done(&self, expect_exit: bool) -> bool {
        self.closed || (self.eof && (self.exit.is_some() || !expect_exit))
    }
}

struct SessionShared {
    out: SunsetBlockingMutex<SessionOut>,
    expect_exit: AtomicBool,
    done: Completion<()>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            out: SunsetBlockingMutex::new(RefCell::new(SessionOut::default())),
            expect_exit: AtomicBool::new(false),
            done: Completion::new(),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionOut) -> R) -> R {
        let expect_exit = self.expect_exit.load(Ordering::Acquire);
        let (r, done) = self.out.lock(|o| {
            let mut o = o.borrow_mut();
            let r = f(&mut o);
            (r, o.is_done(expect_exit))
        });
        // after the exit status is latched
        if done {
            self.done.complete(());
        }
        r
    }
}

struct SessionHooks {
    shared: Arc<SessionShared>,
}

impl ChanHooks for SessionHooks {
    fn on_data(&mut self, data: &[u8]) -> Result<()> {
        self.shared.update(|o| o.output(SessionData::Stdout(data.to_vec())))
    }

    fn on_extended_data(&mut self, code: u32, data: &[u8]) -> Result<()> {
        if code == SSH_EXTENDED_DATA_STDERR {
            self.shared.update(|o| o.output(SessionData::Stderr(data.to_vec())))
        } else {
            debug!("Ignoring extended data, code {code}");
            Ok(())
        }
    }

    fn on_request(&mut self, req: &ChannelReqType<'_>) -> Result<bool> {
        match req {
            ChannelReqType::ExitStatus(e) => {
                debug!("exit status {}", e.status);
                self.shared.update(|o| {
                    o.exit.get_or_insert(SessionExit::Status(e.status));
                });
                Ok(true)
            }
            ChannelReqType::ExitSignal(s) => {
                debug!("exit signal {}", s.signal);
                let exit = SessionExit::Signal {
                    name: s.signal.into(),
                    core: s.core,
                    message: s.error.to_string_lossy(),
                };
                self.shared.update(|o| {
                    o.exit.get_or_insert(exit);
                });
                Ok(true)
            }
            ChannelReqType::XonXoff(x) => {
                self.shared.update(|o| o.xon_xoff = Some(x.client_can_do));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn on_eof(&mut self) -> Result<()> {
        self.shared.update(|o| {
            o.eof = true;
            // ends a stream receiver
            o.stream = None;
        });
        Ok(())
    }

    fn on_close(&mut self) {
        self.shared.update(|o| {
            o.closed = true;
            o.stream = None;
        })
    }
}

/// A session channel.
///
/// Output is buffered until [`output()`](Self::output), or delivered
/// through [`stream()`](Self::stream).
pub struct SessionChannel {
    chan: Channel,
    shared: Arc<SessionShared>,
}

impl core::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SessionChannel").field("chan", &self.chan).finish_non_exhaustive()
    }
}

impl SessionChannel {
    pub fn channel(&self) -> &Channel {
        &self.chan
    }

    pub fn into_channel(self) -> Channel {
        self.chan
    }

    /// Starts a shell, command or subsystem. Waits for the peer's reply.
    pub async fn start<S: AsRef<str>>(&self, cmd: &SessionCommand<S>) -> Result<()> {
        if cmd.expects_exit() {
            self.shared.expect_exit.store(true, Ordering::Release);
        }
        self.chan.request(cmd.request(), true).await
    }

    pub async fn exec(&self, command: &str) -> Result<()> {
        self.start(&SessionCommand::Exec(command)).await
    }

    pub async fn shell(&self) -> Result<()> {
        self.start(&SessionCommand::<&str>::Shell).await
    }

    pub async fn subsystem(&self, name: &str) -> Result<()> {
        self.start(&SessionCommand::Subsystem(name)).await
    }

    /// Requests a pseudo-terminal, before starting a shell or command.
    pub async fn pty(&self, pty: &Pty) -> Result<()> {
        let modes = pty.modes_blob()?;
        self.chan.request(ChannelReqType::Pty(pty.req(&modes)), true).await
    }

    /// Sets an environment variable. Servers commonly refuse these.
    pub async fn env(&self, name: &str, value: &str) -> Result<()> {
        let req = packets::Env { name: name.into(), value: value.into() };
        self.chan.request(ChannelReqType::Env(req), true).await
    }

    pub async fn window_change(&self, cols: u32, rows: u32, width: u32, height: u32) -> Result<()> {
        let req = packets::WinChange { cols, rows, width, height };
        self.chan.request(ChannelReqType::WinChange(req), false).await
    }

    /// Sends a signal, `sig` is a name without "SIG" such as "INT".
    pub async fn signal(&self, sig: &str) -> Result<()> {
        let req = packets::Signal { sig };
        self.chan.request(ChannelReqType::Signal(req), false).await
    }

    /// Sends a break of `length` milliseconds.
    pub async fn send_break(&self, length: u32) -> Result<()> {
        let req = packets::Break { length };
        self.chan.request(ChannelReqType::Break(req), true).await
    }

    /// Tells the peer no more data will be written, keeping the channel open
    /// for reading.
    pub async fn eow(&self) -> Result<()> {
        self.chan.request(ChannelReqType::Eow, false).await
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.chan.send_data(data).await
    }

    pub async fn send_eof(&self) -> Result<()> {
        self.chan.send_eof().await
    }

    /// Returns a receiver for output instead of buffering it.
    ///
    /// Output already buffered is delivered first. The receiver ends at EOF.
    pub fn stream(&self) -> mpsc::UnboundedReceiver<SessionData> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.update(|o| {
            let stdout = mem::take(&mut o.stdout);
            let stderr = mem::take(&mut o.stderr);
            // receiver is held here, sends can't fail
            if !stdout.is_empty() {
                let _ = tx.send(SessionData::Stdout(stdout));
            }
            if !stderr.is_empty() {
                let _ = tx.send(SessionData::Stderr(stderr));
            }
            if !o.eof && !o.closed {
                o.stream = Some(tx);
            }
        });
        rx
    }

    pub fn take_stdout(&self) -> Vec<u8> {
        self.shared.update(|o| mem::take(&mut o.stdout))
    }

    pub fn take_stderr(&self) -> Vec<u8> {
        self.shared.update(|o| mem::take(&mut o.stderr))
    }

    /// The exit status or signal, once received.
    pub fn exit(&self) -> Option<SessionExit> {
        self.shared.update(|o| o.exit.clone())
    }

    /// Whether the peer allows client flow control, from `xon-xoff`.
    pub fn xon_xoff(&self) -> Option<bool> {
        self.shared.update(|o| o.xon_xoff)
    }

    /// Waits for the session to complete then closes the channel.
    ///
    /// Complete is EOF (with the exit status for a command) or
    /// the peer's close.
    pub async fn wait(&self) -> Result<Option<SessionExit>> {
        self.shared.done.wait().await?;
        self.chan.close().await;
        if let Some(e) = self.chan.error().await {
            return Err(e);
        }
        Ok(self.exit())
    }

    /// Waits for completion and returns the buffered output.
    pub async fn output(&self) -> Result<ExecOutput> {
        let exit = self.wait().await?;
        Ok(ExecOutput { stdout: self.take_stdout(), stderr: self.take_stderr(), exit })
    }
}

impl Conn {
    /// Opens a session channel without starting anything.
    pub async fn open_session(&self) -> Result<SessionChannel> {
        let shared = Arc::new(SessionShared::new());
        let hooks = Box::new(SessionHooks { shared: shared.clone() });
        let chan = self.open_channel(ChannelOpenType::Session, ChanKind::Session, hooks).await?;
        Ok(SessionChannel { chan, shared })
    }

    pub async fn open_exec(&self, command: &str) -> Result<SessionChannel> {
        let s = self.open_session().await?;
        s.exec(command).await?;
        Ok(s)
    }

    /// Opens a shell, with an optional pty.
    pub async fn open_shell(&self, pty: Option<&Pty>) -> Result<SessionChannel> {
        let s = self.open_session().await?;
        if let Some(pty) = pty {
            s.pty(pty).await?;
        }
        s.shell().await?;
        Ok(s)
    }

    /// Opens a subsystem such as "sftp". Output is streamed.
    pub async fn open_subsystem(
        &self,
        name: &str,
    ) -> Result<(SessionChannel, mpsc::UnboundedReceiver<SessionData>)> {
        let s = self.open_session().await?;
        let rx = s.stream();
        s.subsystem(name).await?;
        Ok((s, rx))
    }

    /// Runs a command to completion and returns its output.
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        let s = self.open_exec(command).await?;
        s.output().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChanConfig;
    use crate::packets::*;
    use crate::sshwire::{packet_from_bytes, BinString};
    use crate::test::*;

    async fn peer_req(conn: &Conn, req: ChannelReqType<'_>) {
        conn.dispatch(ChannelRequest { num: 0, want_reply: false, req }.into()).await.unwrap();
    }

    #[tokio::test]
    async fn exec_echo() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let c = conn.clone();
        let h = tokio::spawn(async move { c.run("echo hi").await });

        t.wait_sent(1).await;
        confirm_open(&conn, 0, 0x10000, 0x8000).await;
        t.wait_sent(2).await;
        let b = t.last();
        let p = packet_from_bytes(&b).unwrap();
        assert_eq!(
            p,
            Packet::from(ChannelRequest {
                num: PEER_NUM,
                want_reply: true,
                req: ChannelReqType::Exec(Exec { command: "echo hi".into() }),
            })
        );
        conn.dispatch(ChannelSuccess { num: 0 }.into()).await.unwrap();

        peer_data(&conn, b"hi\n").await;
        peer_req(&conn, ChannelReqType::ExitStatus(ExitStatus { status: 0 })).await;
        conn.dispatch(ChannelEof { num: 0 }.into()).await.unwrap();
        peer_close(&conn).await;

        let out = h.await.unwrap().unwrap();
        assert_eq!(out.stdout, b"hi\n");
        assert!(out.stderr.is_empty());
        assert_eq!(out.exit, Some(SessionExit::Status(0)));
        assert_eq!(out.status(), Some(0));
        assert_eq!(t.count_of(MessageNumber::SSH_MSG_CHANNEL_CLOSE), 1);
        assert_eq!(conn.channel_count(), 0);
    }

    #[tokio::test]
    async fn exit_after_eof() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let s = open_session_chan(&conn, &t).await;
        s.shared.expect_exit.store(true, Ordering::Release);

        conn.dispatch(ChannelDataExt {
            num: 0,
            code: SSH_EXTENDED_DATA_STDERR,
            data: BinString(b"oops\n"),
        }.into()).await.unwrap();
        conn.dispatch(ChannelEof { num: 0 }.into()).await.unwrap();
        // not complete without the exit status
        assert!(!s.shared.done.is_complete());
        let sig = ExitSignal { signal: "KILL", core: false, error: "".into(), lang: "" };
        peer_req(&conn, ChannelReqType::ExitSignal(sig)).await;
        assert!(s.shared.done.is_complete());
        // a later exit status doesn't replace the first
        peer_req(&conn, ChannelReqType::ExitStatus(ExitStatus { status: 1 })).await;

        let n = t.count();
        let (out, _) = tokio::join!(s.output(), async {
            t.wait_sent(n + 1).await;
            peer_close(&conn).await;
        });
        let out = out.unwrap();
        assert_eq!(out.stderr, b"oops\n");
        assert_eq!(
            out.exit,
            Some(SessionExit::Signal { name: "KILL".into(), core: false, message: "".into() })
        );
        assert_eq!(out.status(), None);
    }

    #[tokio::test]
    async fn shell_ends_at_eof() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let s = open_session_chan(&conn, &t).await;
        conn.dispatch(ChannelEof { num: 0 }.into()).await.unwrap();
        assert!(s.shared.done.is_complete());
        assert_eq!(s.exit(), None);
    }

    #[tokio::test]
    async fn streamed_output() -> anyhow::Result<()> {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let s = open_session_chan(&conn, &t).await;
        peer_data(&conn, b"one").await;
        let mut rx = s.stream();
        peer_data(&conn, b"two").await;
        let req = ChannelReqType::XonXoff(XonXoff { client_can_do: true });
        conn.dispatch(ChannelRequest { num: 0, want_reply: false, req }.into()).await?;
        conn.dispatch(ChannelEof { num: 0 }.into()).await?;

        assert_eq!(rx.recv().await, Some(SessionData::Stdout(b"one".to_vec())));
        assert_eq!(rx.recv().await, Some(SessionData::Stdout(b"two".to_vec())));
        assert_eq!(rx.recv().await, None);
        assert!(s.take_stdout().is_empty());
        assert_eq!(s.xon_xoff(), Some(true));
        Ok(())
    }

    #[tokio::test]
    async fn session_requests() {
        init_test_log();
        let (conn, t) = test_conn(ChanConfig::default());
        let s = open_session_chan(&conn, &t).await;

        let n = t.count();
        s.window_change(100, 40, 0, 0).await.unwrap();
        s.signal("INT").await.unwrap();
        s.eow().await.unwrap();
        assert_eq!(t.count(), n + 3);
        let b = t.last();
        let p = packet_from_bytes(&b).unwrap();
        assert_eq!(
            p,
            Packet::from(ChannelRequest { num: PEER_NUM, want_reply: false, req: ChannelReqType::Eow })
        );

        let pty = Pty::with_size(80, 24).unwrap();
        let n = t.count();
        let (r, _) = tokio::join!(s.pty(&pty), async {
            t.wait_sent(n + 1).await;
            conn.dispatch(ChannelSuccess { num: 0 }.into()).await.unwrap();
        });
        r.unwrap();

        let n = t.count();
        let (r, _) = tokio::join!(s.env("LANG", "C"), async {
            t.wait_sent(n + 1).await;
            conn.dispatch(ChannelFailure { num: 0 }.into()).await.unwrap();
        });
        assert!(matches!(r, Err(Error::RequestFailed { .. })));
    }
}
