//! Worker engine
//!
//! A supervisor loop dispatches one worker per source; the per-source
//! single-permit semaphore makes the source the concurrency unit (remote
//! rate limits are per-source). Within a worker, jobs run one at a time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::DEFAULT_JOB_RETRY_DELAY_SECONDS;
use crate::db::{format_ts, parse_ts, utc_now_string, HistoryStore};
use crate::executor::{CanceledError, Executor};
use crate::jobs::{DownloadJob, JobOrigin, JobStore};
use crate::status::{EngineStatus, StopEvent};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Message-substring retry classification.
///
/// Fatal tokens win over retryable ones; anything matching neither bucket is
/// treated as non-retryable. The lists track the upstream toolkit's error
/// strings, so drift shows up here first.
const NON_RETRYABLE_TOKENS: &[&str] = &[
    "drm",
    "http error 403",
    "http error 404",
    "403 forbidden",
    "404 not found",
    "private video",
    "video unavailable",
    "not available",
];

const RETRYABLE_TOKENS: &[&str] = &[
    "timeout",
    "timed out",
    "temporary failure",
    "connection reset",
    "connection aborted",
    "connection refused",
    "network is unreachable",
    "remote end closed connection",
    "http error 429",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
    "extractor error",
    "ssl",
    "tls",
    "eof",
];

pub fn is_retryable_error(message: &str) -> bool {
    if message.is_empty() {
        return false;
    }
    let lowered = message.to_lowercase();
    if NON_RETRYABLE_TOKENS.iter().any(|t| lowered.contains(t)) {
        return false;
    }
    RETRYABLE_TOKENS.iter().any(|t| lowered.contains(t))
}

/// Per-source execution seam. The production adapter is the download
/// executor; tests plug in fakes.
pub trait JobAdapter: Send + Sync {
    fn execute<'a>(&'a self, job: &'a DownloadJob, stop: &'a StopEvent) -> BoxFuture<'a, Result<()>>;
}

impl JobAdapter for Executor {
    fn execute<'a>(&'a self, job: &'a DownloadJob, stop: &'a StopEvent) -> BoxFuture<'a, Result<()>> {
        Executor::execute(self, job, stop).boxed()
    }
}

struct EngineInner {
    store: JobStore,
    history: HistoryStore,
    status: Arc<EngineStatus>,
    stop: StopEvent,
    adapters: HashMap<String, Arc<dyn JobAdapter>>,
    retry_delay: Duration,
    poll_interval: Duration,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    workers: Mutex<HashMap<String, JoinHandle<()>>>,
}

pub struct WorkerEngine {
    inner: Arc<EngineInner>,
}

impl WorkerEngine {
    pub fn new(
        store: JobStore,
        history: HistoryStore,
        status: Arc<EngineStatus>,
        stop: StopEvent,
        adapters: HashMap<String, Arc<dyn JobAdapter>>,
        retry_delay_seconds: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                history,
                status,
                stop,
                adapters,
                retry_delay: Duration::from_secs(
                    retry_delay_seconds.unwrap_or(DEFAULT_JOB_RETRY_DELAY_SECONDS),
                ),
                poll_interval: DEFAULT_POLL_INTERVAL,
                semaphores: Mutex::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Drive workers until no queued jobs remain and every worker has
    /// exited, or the stop event fires.
    pub async fn run_until_idle(&self) {
        loop {
            if self.inner.stop.is_set() {
                break;
            }

            let now = utc_now_string();
            let sources = match self.inner.store.list_ready_sources(Some(&now)) {
                Ok(sources) => sources,
                Err(err) => {
                    log::error!("Failed to list ready sources: {err:#}");
                    break;
                }
            };

            let mut started_any = false;
            for source in &sources {
                if self.try_start_worker(source) {
                    started_any = true;
                }
            }

            if sources.is_empty() && !self.any_active_workers() {
                match self.inner.store.next_ready_time(Some(&now)) {
                    Ok(None) | Err(_) => break,
                    Ok(Some(next_ready)) => {
                        self.sleep_until(&next_ready).await;
                        continue;
                    }
                }
            }

            if !started_any {
                self.bounded_sleep(self.inner.poll_interval).await;
            }
        }
        self.join_workers().await;
    }

    /// Sleep until the next scheduled retry, bounded by the poll interval
    /// and broken by the stop event.
    async fn sleep_until(&self, next_ready: &str) {
        let delay = parse_ts(next_ready)
            .and_then(|at| (at - chrono::Utc::now()).to_std().ok())
            .unwrap_or(self.inner.poll_interval);
        self.bounded_sleep(delay.min(self.inner.poll_interval.max(Duration::from_millis(10))))
            .await;
    }

    async fn bounded_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.inner.stop.wait() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Start a worker for `source` unless one already holds its permit.
    fn try_start_worker(&self, source: &str) -> bool {
        let semaphore = {
            let mut semaphores = self.inner.semaphores.lock().expect("semaphore lock");
            Arc::clone(
                semaphores
                    .entry(source.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        let Ok(permit) = semaphore.try_acquire_owned() else {
            return false;
        };

        let inner = Arc::clone(&self.inner);
        let source_owned = source.to_string();
        let handle = tokio::spawn(async move {
            worker_loop(inner, source_owned, permit).await;
        });

        let mut workers = self.inner.workers.lock().expect("workers lock");
        workers.retain(|_, h| !h.is_finished());
        workers.insert(source.to_string(), handle);
        true
    }

    fn any_active_workers(&self) -> bool {
        self.inner
            .workers
            .lock()
            .expect("workers lock")
            .values()
            .any(|h| !h.is_finished())
    }

    async fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.inner.workers.lock().expect("workers lock");
            workers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Drain `claim_next` for one source until empty, then release the permit.
async fn worker_loop(inner: Arc<EngineInner>, source: String, _permit: OwnedSemaphorePermit) {
    loop {
        if inner.stop.is_set() {
            break;
        }
        let job = match inner.store.claim_next(&source, None) {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(err) => {
                log::error!("claim_next failed for {source}: {err:#}");
                break;
            }
        };
        log::info!(
            "{}",
            serde_json::json!({
                "event": "job_running",
                "job_id": job.id,
                "trace_id": job.trace_id,
                "source": job.source,
                "status": "running",
            })
        );
        execute_job(&inner, &job).await;
    }
}

async fn execute_job(inner: &EngineInner, job: &DownloadJob) {
    if inner.stop.is_set() {
        if inner
            .store
            .mark_canceled(job, "canceled before start")
            .unwrap_or(false)
        {
            inner.status.bump_progress();
        }
        return;
    }

    let Some(adapter) = inner.adapters.get(&job.source) else {
        let error = format!("no adapter registered for source={}", job.source);
        if inner.store.mark_failed(job, &error, None, None).unwrap_or(false) {
            record_failure(inner, job, &error);
            inner.status.bump_progress();
        }
        return;
    };

    match adapter.execute(job, &inner.stop).await {
        Ok(()) => {
            if inner.store.mark_completed(job).unwrap_or(false) {
                inner.status.bump_progress();
            }
        }
        Err(err) => handle_job_error(inner, job, err),
    }
}

fn handle_job_error(inner: &EngineInner, job: &DownloadJob, err: anyhow::Error) {
    if err.is::<CanceledError>() || inner.stop.is_set() {
        if inner.store.mark_canceled(job, "canceled").unwrap_or(false) {
            inner.status.bump_progress();
        }
        return;
    }

    let message = err.to_string();
    let attempts = job.attempts + 1;
    let retryable = is_retryable_error(&message);

    if retryable && attempts < job.max_attempts {
        let retry_at = format_ts(
            chrono::Utc::now()
                + chrono::Duration::from_std(inner.retry_delay).unwrap_or_default(),
        );
        let _ = inner
            .store
            .mark_failed(job, &message, Some(&retry_at), Some(attempts));
        return;
    }

    if inner
        .store
        .mark_failed(job, &message, None, Some(attempts))
        .unwrap_or(false)
    {
        record_failure(inner, job, &message);
        inner.status.bump_progress();
    }
}

/// Terminal-failure bookkeeping: run failure label, last error, and for
/// playlist-origin jobs the watch-row error record.
fn record_failure(inner: &EngineInner, job: &DownloadJob, message: &str) {
    let label = job
        .context
        .metadata
        .as_ref()
        .and_then(|m| m.title.clone())
        .or_else(|| job.context.item_id.clone())
        .unwrap_or_else(|| job.id.clone());
    inner.status.push_failure(label);
    inner.status.set_last_error(Some(message.to_string()));

    if job.origin == JobOrigin::Playlist {
        if let Err(err) = inner.history.record_playlist_error(&job.origin_id, message) {
            log::error!(
                "{}",
                serde_json::json!({
                    "event": "playlist_error_record_failed",
                    "job_id": job.id,
                    "trace_id": job.trace_id,
                    "source": job.source,
                    "error": err.to_string(),
                })
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobContext, MediaIntent, MediaType, NewJob};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_classifier_fatal() {
        assert!(!is_retryable_error("ERROR: This video is DRM protected"));
        assert!(!is_retryable_error("HTTP Error 403: Forbidden"));
        assert!(!is_retryable_error("HTTP Error 404: Not Found"));
        assert!(!is_retryable_error("Private video. Sign in if you've been granted access"));
        assert!(!is_retryable_error("Video unavailable"));
    }

    #[test]
    fn test_classifier_retryable() {
        assert!(is_retryable_error("The read operation timed out"));
        assert!(is_retryable_error("Connection reset by peer"));
        assert!(is_retryable_error("HTTP Error 429: Too Many Requests"));
        assert!(is_retryable_error("HTTP Error 503: Service Unavailable"));
        assert!(is_retryable_error("ssl handshake failure"));
        assert!(is_retryable_error("Unexpected EOF while reading"));
        assert!(is_retryable_error("youtube: Extractor error"));
    }

    #[test]
    fn test_classifier_unknown_is_fatal() {
        assert!(!is_retryable_error(""));
        assert!(!is_retryable_error("something nobody has seen before"));
    }

    #[test]
    fn test_classifier_fatal_wins_over_retryable() {
        // Both token families present: fatal classification wins.
        assert!(!is_retryable_error("HTTP Error 403 after connection reset"));
    }

    struct ScriptedAdapter {
        errors: Vec<Option<String>>,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(errors: Vec<Option<String>>) -> Arc<Self> {
            Arc::new(Self {
                errors,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    impl JobAdapter for ScriptedAdapter {
        fn execute<'a>(
            &'a self,
            job: &'a DownloadJob,
            _stop: &'a StopEvent,
        ) -> BoxFuture<'a, Result<()>> {
            async move {
                let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_concurrent.fetch_max(current, Ordering::SeqCst);
                self.order.lock().unwrap().push(job.url.clone());
                tokio::time::sleep(Duration::from_millis(10)).await;
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                match self.errors.get(call).cloned().flatten() {
                    Some(message) => Err(anyhow::anyhow!("{message}")),
                    None => Ok(()),
                }
            }
            .boxed()
        }
    }

    fn test_engine(
        adapter: Arc<ScriptedAdapter>,
        retry_delay: u64,
    ) -> (tempfile::TempDir, JobStore, WorkerEngine) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JobStore::new(tmp.path().join("main.db"));
        let history = HistoryStore::new(tmp.path().join("main.db"));
        let mut adapters: HashMap<String, Arc<dyn JobAdapter>> = HashMap::new();
        adapters.insert("youtube".to_string(), adapter);
        let engine = WorkerEngine::new(
            store.clone(),
            history,
            EngineStatus::new(),
            StopEvent::new(),
            adapters,
            Some(retry_delay),
        );
        (tmp, store, engine)
    }

    fn job(url: &str) -> NewJob {
        NewJob {
            origin: crate::jobs::JobOrigin::Playlist,
            origin_id: "PL1".into(),
            media_type: MediaType::Video,
            media_intent: MediaIntent::Playlist,
            source: "youtube".into(),
            url: url.into(),
            output_template: None,
            output_dir: PathBuf::from("/tmp"),
            context: JobContext::default(),
            max_attempts: None,
            trace_id: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_processes_fifo_with_one_worker() {
        let adapter = ScriptedAdapter::new(vec![None, None, None]);
        let (_tmp, store, engine) = test_engine(Arc::clone(&adapter), 0);

        let a = store.enqueue(job("https://e/a")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.enqueue(job("https://e/b")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        store.enqueue(job("https://e/c")).unwrap();

        engine.run_until_idle().await;

        let order = adapter.order.lock().unwrap().clone();
        assert_eq!(order, vec!["https://e/a", "https://e/b", "https://e/c"]);
        assert_eq!(adapter.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_job(&a).unwrap().unwrap().status,
            crate::jobs::JobStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_retries_then_fails_terminally() {
        let adapter = ScriptedAdapter::new(vec![
            Some("connection reset by peer".into()),
            Some("connection reset by peer".into()),
            Some("connection reset by peer".into()),
        ]);
        let (_tmp, store, engine) = test_engine(Arc::clone(&adapter), 0);
        let id = store.enqueue(job("https://e/a")).unwrap();

        engine.run_until_idle().await;

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
        let final_job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(final_job.status, crate::jobs::JobStatus::Failed);
        assert_eq!(final_job.attempts, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_fatal_error_does_not_retry() {
        let adapter = ScriptedAdapter::new(vec![Some("HTTP Error 404: Not Found".into())]);
        let (_tmp, store, engine) = test_engine(Arc::clone(&adapter), 0);
        let id = store.enqueue(job("https://e/a")).unwrap();

        engine.run_until_idle().await;

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        let final_job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(final_job.status, crate::jobs::JobStatus::Failed);
        assert_eq!(final_job.attempts, 1);
        assert_eq!(
            final_job.last_error.as_deref(),
            Some("HTTP Error 404: Not Found")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_recovers_after_retryable_failure() {
        let adapter =
            ScriptedAdapter::new(vec![Some("The read operation timed out".into()), None]);
        let (_tmp, store, engine) = test_engine(Arc::clone(&adapter), 0);
        let id = store.enqueue(job("https://e/a")).unwrap();

        engine.run_until_idle().await;

        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        let final_job = store.get_job(&id).unwrap().unwrap();
        assert_eq!(final_job.status, crate::jobs::JobStatus::Completed);
    }
}
