//! One-shot cancellation signal.
//!
//! Blocking awaits (device reads, transport receives, accepts) are raced
//! against [`ShutdownListener::wait`] in `tokio::select!`, which is how a
//! stop request unblocks them.  The signal is level-triggered: a listener
//! created after [`Shutdown::trigger`] resolves immediately.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
        }
    }

    /// Raise the signal.  Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once the signal is raised or its [`Shutdown`] is dropped.
    /// Cancel safe.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|raised| *raised).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_listener_sees_trigger() {
        let s = Shutdown::new();
        s.trigger();
        s.trigger();
        let mut l = s.listener();
        assert!(l.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), l.wait()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_blocks_until_trigger() {
        let s = Shutdown::new();
        let mut l = s.listener();
        assert!(tokio::time::timeout(Duration::from_millis(50), l.wait()).await.is_err());
        let task = tokio::spawn(async move { l.wait().await });
        s.trigger();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_releases_waiters() {
        let s = Shutdown::new();
        let mut l = s.listener();
        drop(s);
        tokio::time::timeout(Duration::from_secs(1), l.wait()).await.unwrap();
    }
}
