// src/engine/abort.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

/// The global abort flag.
///
/// Set when a relevant filesystem change arrives mid-run. Jobs check it at
/// every suspend point; worker batches wait on it to forward an abort
/// message. It never interrupts a task function that is already executing.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    inner: Arc<Inner>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn reset(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_on_trigger() {
        let token = AbortToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        token.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        token.reset();
        assert!(!token.is_triggered());
    }
}
