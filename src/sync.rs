//! One-shot completions and the channel limiter.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;

use embassy_sync::blocking_mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

pub type SunsetRawMutex = CriticalSectionRawMutex;

pub type SunsetMutex<T> = Mutex<SunsetRawMutex, T>;

/// For short non-async access, such as the channel table.
/// Must not be held while calling out to other code.
pub type SunsetBlockingMutex<T> = blocking_mutex::Mutex<SunsetRawMutex, RefCell<T>>;

/// A value that is set once, and waited on by any number of tasks.
///
/// Later calls to [`complete()`](Self::complete) are ignored, so every
/// path that may finish an operation can call it unconditionally.
#[derive(Debug)]
pub struct Completion<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Sets the value and wakes waiters. Returns `false` if it was
    /// already complete.
    pub fn complete(&self, v: T) -> bool {
        let mut v = Some(v);
        self.tx.send_if_modified(|cur| {
            if cur.is_none() {
                *cur = v.take();
                true
            } else {
                false
            }
        })
    }

    pub fn is_complete(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.tx.subscribe();
        // the sender is owned by self, can't close while borrowed
        let v = rx.wait_for(Option::is_some).await.trap()?.clone();
        v.trap()
    }

    /// Returns `None` on timeout.
    pub async fn wait_timeout(&self, dur: Duration) -> Result<Option<T>> {
        match tokio::time::timeout(dur, self.wait()).await {
            Ok(r) => r.map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Bounds the number of concurrently open channels.
///
/// A permit is held by each channel from open until it reaches `Closed`.
#[derive(Debug, Clone)]
pub struct ChanLimiter {
    sem: Arc<Semaphore>,
}

impl ChanLimiter {
    pub fn new(max_channels: usize) -> Self {
        Self { sem: Arc::new(Semaphore::new(max_channels)) }
    }

    /// Waits up to `dur` for a free slot.
    ///
    /// Fails with [`Error::NoChannels`] on timeout, or
    /// [`Error::Disconnected`] once the limiter is closed.
    pub async fn acquire(&self, dur: Duration) -> Result<OwnedSemaphorePermit> {
        let a = self.sem.clone().acquire_owned();
        match tokio::time::timeout(dur, a).await {
            Ok(Ok(p)) => Ok(p),
            Ok(Err(_closed)) => Err(Error::Disconnected),
            Err(_) => Err(Error::NoChannels),
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.sem.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        self.sem.close()
    }
}

#[cfg(test)]
mod tests {
    use crate::sync::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn complete_once() {
        let c = Arc::new(Completion::<u32>::new());
        let c2 = c.clone();
        let w = tokio::spawn(async move { c2.wait().await.unwrap() });
        tokio::task::yield_now().await;
        assert!(c.complete(3));
        assert!(!c.complete(4));
        assert_eq!(w.await.unwrap(), 3);
        // already complete, returns immediately
        assert_eq!(c.wait().await.unwrap(), 3);
        assert_eq!(c.peek(), Some(3));
    }

    #[tokio::test]
    async fn completion_timeout() {
        let c = Completion::<()>::new();
        let r = c.wait_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(r.is_none());
        assert!(!c.is_complete());
    }

    #[tokio::test]
    async fn limiter() {
        let l = ChanLimiter::new(1);
        let p = l.acquire(Duration::from_millis(10)).await.unwrap();
        assert!(l.try_acquire().is_none());
        let r = l.acquire(Duration::from_millis(10)).await;
        assert!(matches!(r, Err(Error::NoChannels)));
        drop(p);
        assert_eq!(l.available(), 1);
        l.close();
        let r = l.acquire(Duration::from_millis(10)).await;
        assert!(matches!(r, Err(Error::Disconnected)));
    }
}
