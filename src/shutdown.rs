//! Cooperative cancellation shared by every long-running loop.
//!
//! A [`Shutdown`] is a cloneable flag backed by a `tokio::sync::watch` channel.
//! Loops observe it at their suspension points via [`Shutdown::cancelled`].
//! A [`child`](Shutdown::child) signal fires when either it or its parent is
//! triggered, which lets a single component be stopped without tearing down
//! the whole process.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal observed by background tasks.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    // Own receiver first, then one per ancestor.
    watched: Vec<watch::Receiver<bool>>,
}

impl Shutdown {
    /// Creates a new, untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            watched: vec![rx],
        }
    }

    /// Creates a signal that is also triggered whenever `self` is.
    ///
    /// Triggering the child does not affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut child = Self::new();
        child.watched.extend(self.watched.iter().cloned());
        child
    }

    /// Raises the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once this signal or any ancestor has been triggered.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.watched.iter().any(|rx| *rx.borrow())
    }

    /// Completes once this signal or any ancestor has been triggered.
    pub async fn cancelled(&self) {
        let waits = self
            .watched
            .iter()
            .cloned()
            .map(|rx| Box::pin(wait_raised(rx)));

        futures::future::select_all(waits).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_raised(mut rx: watch::Receiver<bool>) {
    // The sender lives as long as any clone of the signal, so an error here
    // means nobody can ever trigger it.
    if rx.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}
