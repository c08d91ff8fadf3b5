//! Listener task lifecycle: explicit two-phase init/teardown.
//!
//! The pattern-subscription listener is the only long-lived task in the
//! core. Its cancellation token and join handle live here so that teardown
//! can cancel AND join it -- an unjoined listener would leak a task still
//! holding a broker connection.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct Lifecycle {
    initialized: AtomicBool,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Record a started listener and mark the system initialized. Any
    /// previously installed listener is torn down first, so a double install
    /// cannot leak a task.
    pub async fn install(&self, cancel: CancellationToken, task: JoinHandle<()>) {
        let previous = self.listener.lock().await.replace((cancel, task));
        if let Some((old_cancel, old_task)) = previous {
            old_cancel.cancel();
            let _ = old_task.await;
        }
        self.initialized.store(true, Ordering::Release);
    }

    /// Cancel the listener, wait for it to finish, and reset the initialized
    /// flag. Safe to call repeatedly and safe to call when nothing was ever
    /// installed.
    pub async fn cleanup(&self) {
        self.initialized.store(false, Ordering::Release);
        let taken = self.listener.lock().await.take();
        if let Some((cancel, task)) = taken {
            cancel.cancel();
            if let Err(err) = task.await {
                // Panic in the listener; already over, just record it.
                tracing::error!("listener task ended abnormally: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_idle_listener(lifecycle: &Lifecycle) -> CancellationToken {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        lifecycle.install(cancel.clone(), task).await;
        cancel
    }

    #[tokio::test]
    async fn starts_uninitialized() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_initialized());
    }

    #[tokio::test]
    async fn install_marks_initialized() {
        let lifecycle = Lifecycle::new();
        spawn_idle_listener(&lifecycle).await;
        assert!(lifecycle.is_initialized());
        lifecycle.cleanup().await;
    }

    #[tokio::test]
    async fn cleanup_joins_listener_and_resets() {
        let lifecycle = Lifecycle::new();
        let cancel = spawn_idle_listener(&lifecycle).await;
        lifecycle.cleanup().await;
        assert!(!lifecycle.is_initialized());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_without_install_is_noop() {
        let lifecycle = Lifecycle::new();
        lifecycle.cleanup().await;
        lifecycle.cleanup().await;
        assert!(!lifecycle.is_initialized());
    }

    #[tokio::test]
    async fn double_cleanup_is_noop() {
        let lifecycle = Lifecycle::new();
        spawn_idle_listener(&lifecycle).await;
        lifecycle.cleanup().await;
        lifecycle.cleanup().await;
        assert!(!lifecycle.is_initialized());
    }

    #[tokio::test]
    async fn reinstall_tears_down_previous_listener() {
        let lifecycle = Lifecycle::new();
        let first = spawn_idle_listener(&lifecycle).await;
        let _second = spawn_idle_listener(&lifecycle).await;
        assert!(first.is_cancelled());
        assert!(lifecycle.is_initialized());
        lifecycle.cleanup().await;
    }
}
