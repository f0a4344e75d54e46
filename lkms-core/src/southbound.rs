//! Southbound adapter: the seam to the external QKD key source
//!
//! The session manager never assumes southbound delivery is instantaneous.
//! It sees the link only through [`KeySource`]: a non-blocking pull that may
//! return zero octets without that being an error, plus a status probe. The
//! reactor pulls on behalf of all sessions in priority order; no session
//! ever touches the source directly.
//!
//! [`ChannelKeySource`] is the production implementation: an async feeder
//! (see `link`) pushes raw key octets and link-state updates in, the reactor
//! drains them out on its own thread.

use tokio::sync::{mpsc, watch};
use zeroize::Zeroize;

/// Observed state of the southbound QKD link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// Link is delivering key material
    Available,
    /// Link is faulting but expected to recover; sessions stay Active
    Degraded,
    /// Link is permanently down; sessions touching it transition to Failed
    Unavailable,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkStatus::Available => "available",
            LinkStatus::Degraded => "degraded",
            LinkStatus::Unavailable => "unavailable",
        };
        write!(f, "{name}")
    }
}

/// Pull interface over the external key source
pub trait KeySource {
    /// Pull up to `max_octets` of raw key material without blocking
    ///
    /// A short or empty return is normal; the next call resumes where this
    /// one stopped. Every octet is produced exactly once.
    fn pull(&mut self, max_octets: usize) -> Vec<u8>;

    /// Probe the link state
    fn status(&self) -> LinkStatus;
}

/// Producer handle feeding a [`ChannelKeySource`]
#[derive(Clone)]
pub struct KeyFeed {
    tx: mpsc::Sender<Vec<u8>>,
    status: watch::Sender<LinkStatus>,
}

impl KeyFeed {
    /// Feed raw key octets; waits when the hand-off queue is full
    pub async fn send(&self, octets: Vec<u8>) -> crate::Result<()> {
        self.tx
            .send(octets)
            .await
            .map_err(|_| crate::Error::Source("key source consumer gone".to_string()))
    }

    /// Publish a link-state change
    pub fn set_status(&self, status: LinkStatus) {
        // Receiver dropping just means the reactor is gone; nothing to do.
        let _ = self.status.send(status);
    }

    /// Subscribe to link-state changes (for status reporting)
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }
}

/// Channel-backed key source drained by the reactor
pub struct ChannelKeySource {
    rx: mpsc::Receiver<Vec<u8>>,
    status: watch::Receiver<LinkStatus>,
    stash: Vec<u8>,
}

/// Create a feed/source pair with the given hand-off depth (in chunks)
pub fn channel(depth: usize) -> (KeyFeed, ChannelKeySource) {
    let (tx, rx) = mpsc::channel(depth);
    let (status_tx, status_rx) = watch::channel(LinkStatus::Available);
    (
        KeyFeed {
            tx,
            status: status_tx,
        },
        ChannelKeySource {
            rx,
            status: status_rx,
            stash: Vec::new(),
        },
    )
}

impl KeySource for ChannelKeySource {
    fn pull(&mut self, max_octets: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < max_octets {
            if self.stash.is_empty() {
                match self.rx.try_recv() {
                    Ok(chunk) => self.stash = chunk,
                    Err(_) => break,
                }
            }
            let want = (max_octets - out.len()).min(self.stash.len());
            let rest = self.stash.split_off(want);
            out.extend_from_slice(&self.stash);
            self.stash.zeroize();
            self.stash = rest;
        }
        out
    }

    fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }
}

impl Drop for ChannelKeySource {
    fn drop(&mut self) {
        self.stash.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_is_non_blocking() {
        let (_feed, mut source) = channel(8);
        assert!(source.pull(32).is_empty());
        assert_eq!(source.status(), LinkStatus::Available);
    }

    #[tokio::test]
    async fn test_pull_resumes_across_calls() {
        let (feed, mut source) = channel(8);
        feed.send(vec![1, 2, 3, 4, 5, 6]).await.unwrap();
        feed.send(vec![7, 8]).await.unwrap();

        assert_eq!(source.pull(4), vec![1, 2, 3, 4]);
        assert_eq!(source.pull(4), vec![5, 6, 7, 8]);
        assert!(source.pull(4).is_empty());
    }

    #[tokio::test]
    async fn test_status_propagates() {
        let (feed, source) = channel(8);
        feed.set_status(LinkStatus::Degraded);
        assert_eq!(source.status(), LinkStatus::Degraded);
        feed.set_status(LinkStatus::Unavailable);
        assert_eq!(source.status(), LinkStatus::Unavailable);
    }
}
