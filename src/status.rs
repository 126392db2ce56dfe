//! Status publisher
//!
//! A single-lock snapshot of the current run. All writers go through the
//! setters; readers take a full copy under the lock. Status updates are
//! best-effort and never block job transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

use crate::models::TransferProgress;

/// Process-wide stop signal.
///
/// Checked before each attempt, between attempts, between jobs, and inside
/// the transfer progress callback; `notified()` lets in-flight awaits race
/// against it.
#[derive(Clone, Default)]
pub struct StopEvent {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves when the stop flag is set (immediately if already set).
    pub async fn wait(&self) {
        if self.is_set() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_set() {
            return;
        }
        notified.await;
    }

    /// Re-arm for a fresh run.
    pub fn clear(&self) {
        self.inner.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LastCompleted {
    pub name: Option<String>,
    pub at: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientDeliveryInfo {
    pub id: Option<String>,
    pub filename: Option<String>,
    pub expires_at: Option<String>,
    pub mode: Option<String>,
}

/// Everything `/api/status` exposes about the run in flight.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub run_successes: Vec<String>,
    pub run_failures: Vec<String>,
    pub runtime_warned: bool,
    pub single_download_ok: Option<bool>,
    pub current_playlist_id: Option<String>,
    pub current_item_id: Option<String>,
    pub current_item_title: Option<String>,
    pub current_phase: Option<String>,
    pub progress_current: Option<u32>,
    pub progress_total: Option<u32>,
    pub progress_percent: Option<u32>,
    pub item_progress: TransferProgress,
    pub last_completed: LastCompleted,
    pub last_error_message: Option<String>,
    pub client_delivery: ClientDeliveryInfo,
}

/// The mutable singleton behind the status API. Pass it around as an
/// explicit collaborator; nothing reaches it through globals.
#[derive(Default)]
pub struct EngineStatus {
    inner: Mutex<StatusSnapshot>,
}

impl EngineStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().expect("status lock poisoned").clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut StatusSnapshot) -> R) -> R {
        f(&mut self.inner.lock().expect("status lock poisoned"))
    }

    pub fn push_success(&self, name: impl Into<String>) {
        self.with(|s| s.run_successes.push(name.into()));
    }

    pub fn push_failure(&self, label: impl Into<String>) {
        self.with(|s| s.run_failures.push(label.into()));
    }

    pub fn set_last_error(&self, message: Option<String>) {
        self.with(|s| s.last_error_message = message);
    }

    pub fn set_runtime_warned(&self) {
        self.with(|s| s.runtime_warned = true);
    }

    pub fn runtime_warned(&self) -> bool {
        self.with(|s| s.runtime_warned)
    }

    pub fn set_single_download_ok(&self, ok: Option<bool>) {
        self.with(|s| s.single_download_ok = ok);
    }

    pub fn set_current_playlist(&self, playlist_id: Option<String>) {
        self.with(|s| s.current_playlist_id = playlist_id);
    }

    pub fn set_current_item(&self, item_id: Option<String>, title: Option<String>) {
        self.with(|s| {
            s.current_item_id = item_id;
            s.current_item_title = title;
        });
    }

    pub fn set_phase(&self, phase: Option<&str>) {
        self.with(|s| s.current_phase = phase.map(str::to_string));
    }

    pub fn set_progress(&self, current: Option<u32>, total: Option<u32>) {
        self.with(|s| {
            s.progress_current = current;
            s.progress_total = total;
            s.progress_percent = match (current, total) {
                (Some(c), Some(t)) if t > 0 => Some(((c * 100) / t).min(100)),
                _ => None,
            };
        });
    }

    /// Increment the run progress counter by one completed job.
    pub fn bump_progress(&self) {
        self.with(|s| {
            let current = s.progress_current.unwrap_or(0) + 1;
            s.progress_current = Some(current);
            if let Some(total) = s.progress_total.filter(|t| *t > 0) {
                s.progress_percent = Some(((current * 100) / total).min(100));
            }
        });
    }

    pub fn set_item_progress(&self, progress: TransferProgress) {
        self.with(|s| s.item_progress = progress);
    }

    pub fn reset_item_progress(&self) {
        self.with(|s| s.item_progress = TransferProgress::default());
    }

    pub fn set_last_completed(&self, name: Option<String>, at: Option<String>, path: Option<String>) {
        self.with(|s| {
            s.last_completed = LastCompleted { name, at, path };
        });
    }

    pub fn set_client_delivery(&self, info: ClientDeliveryInfo) {
        self.with(|s| s.client_delivery = info);
    }

    /// Wipe per-run fields at run start; the last_completed and delivery
    /// fields survive across runs on purpose.
    pub fn reset_for_run(&self) {
        self.with(|s| {
            s.run_successes.clear();
            s.run_failures.clear();
            s.single_download_ok = None;
            s.current_playlist_id = None;
            s.current_item_id = None;
            s.current_item_title = None;
            s.current_phase = None;
            s.progress_current = None;
            s.progress_total = None;
            s.progress_percent = None;
            s.item_progress = TransferProgress::default();
            s.last_error_message = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_lists() {
        let status = EngineStatus::new();
        status.push_success("a.webm");
        status.push_failure("b (auth)");
        let snap = status.snapshot();
        assert_eq!(snap.run_successes, vec!["a.webm"]);
        assert_eq!(snap.run_failures, vec!["b (auth)"]);

        status.push_success("c.webm");
        // Earlier snapshot is unaffected.
        assert_eq!(snap.run_successes.len(), 1);
    }

    #[test]
    fn test_progress_percent_math() {
        let status = EngineStatus::new();
        status.set_progress(Some(0), Some(4));
        status.bump_progress();
        status.bump_progress();
        let snap = status.snapshot();
        assert_eq!(snap.progress_current, Some(2));
        assert_eq!(snap.progress_percent, Some(50));
    }

    #[test]
    fn test_reset_for_run_keeps_last_completed() {
        let status = EngineStatus::new();
        status.set_last_completed(Some("x.webm".into()), None, None);
        status.push_success("x.webm");
        status.reset_for_run();
        let snap = status.snapshot();
        assert!(snap.run_successes.is_empty());
        assert_eq!(snap.last_completed.name.as_deref(), Some("x.webm"));
    }

    #[tokio::test]
    async fn test_stop_event_wait() {
        let stop = StopEvent::new();
        assert!(!stop.is_set());
        let waiter = stop.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            true
        });
        stop.set();
        assert!(handle.await.unwrap());
        assert!(stop.is_set());
    }
}
