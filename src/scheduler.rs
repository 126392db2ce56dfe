//! Scheduler
//!
//! A single-instance interval trigger plus the downtime window. Applying a
//! config replaces the existing job wholesale; the first fire after a
//! reconfiguration is never immediate. Missed fires coalesce.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;

use crate::config::{parse_hhmm, DowntimeConfig, ScheduleConfig};
use crate::db::HistoryStore;
use crate::status::StopEvent;

/// Downtime waits poll in slices so a stop event is observed promptly.
const DOWNTIME_SLICE: Duration = Duration::from_secs(60);

/// Handler invoked on each fire; returns whether a run actually started.
pub type TickHandler = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct SchedulerInner {
    task: Option<JoinHandle<()>>,
    last_run: Option<String>,
    next_run: Option<String>,
}

/// Interval trigger. Logically a singleton; owned by the app state and
/// passed around explicitly.
pub struct Scheduler {
    history: HistoryStore,
    inner: Arc<Mutex<SchedulerInner>>,
}

impl Scheduler {
    pub fn new(history: HistoryStore) -> Self {
        let last_run = history.get_schedule_value("last_run").ok().flatten();
        let next_run = history.get_schedule_value("next_run").ok().flatten();
        Self {
            history,
            inner: Arc::new(Mutex::new(SchedulerInner {
                task: None,
                last_run,
                next_run,
            })),
        }
    }

    pub fn state(&self) -> (Option<String>, Option<String>) {
        let inner = self.inner.lock().expect("scheduler lock");
        (inner.last_run.clone(), inner.next_run.clone())
    }

    pub fn record_last_run(&self, at: DateTime<Utc>) {
        let value = at.to_rfc3339();
        self.inner.lock().expect("scheduler lock").last_run = Some(value.clone());
        let _ = self.history.set_schedule_value("last_run", Some(&value));
    }

    fn record_next_run(&self, at: Option<DateTime<Utc>>) {
        let value = at.map(|t| t.to_rfc3339());
        self.inner.lock().expect("scheduler lock").next_run = value.clone();
        let _ = self
            .history
            .set_schedule_value("next_run", value.as_deref());
    }

    /// Replace the interval job with one matching `schedule` (or remove it
    /// when disabled). The next fire is `now + interval_hours`; a
    /// reconfiguration never fires immediately.
    pub fn apply(&self, schedule: &ScheduleConfig, on_tick: TickHandler) {
        {
            let mut inner = self.inner.lock().expect("scheduler lock");
            if let Some(task) = inner.task.take() {
                task.abort();
            }
        }

        if !schedule.enabled {
            self.record_next_run(None);
            return;
        }

        let interval_hours = schedule.interval_hours.unwrap_or(1).max(1) as u64;
        let period = Duration::from_secs(interval_hours * 3600);
        self.record_next_run(Some(Utc::now() + chrono::Duration::hours(interval_hours as i64)));

        let scheduler_inner = Arc::clone(&self.inner);
        let history = self.history.clone();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            // Collapse missed fires into one.
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let started = on_tick().await;
                let now = Utc::now();
                let next = now + chrono::Duration::hours(interval_hours as i64);
                {
                    let mut inner = scheduler_inner.lock().expect("scheduler lock");
                    if started {
                        inner.last_run = Some(now.to_rfc3339());
                    }
                    inner.next_run = Some(next.to_rfc3339());
                }
                if started {
                    let _ = history.set_schedule_value("last_run", Some(&now.to_rfc3339()));
                }
                let _ = history.set_schedule_value("next_run", Some(&next.to_rfc3339()));
            }
        });

        self.inner.lock().expect("scheduler lock").task = Some(task);
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.inner.lock().expect("scheduler lock").task.take() {
            task.abort();
        }
    }
}

/// Parsed downtime window: `[start, end)` local wall-clock, wrapping
/// midnight when start > end.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DowntimeWindow {
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

/// Parse the configured window. An invalid timezone name falls back to UTC;
/// missing or malformed times yield None (no downtime).
pub fn parse_downtime(config: &DowntimeConfig) -> Option<DowntimeWindow> {
    if !config.enabled {
        return None;
    }
    let (sh, sm) = parse_hhmm(config.start.as_deref()?)?;
    let (eh, em) = parse_hhmm(config.end.as_deref()?)?;
    let tz = match config.timezone.as_deref() {
        None | Some("") => Tz::UTC,
        Some(name) => Tz::from_str(name).unwrap_or_else(|_| {
            log::warn!("Invalid downtime timezone '{name}'; falling back to UTC");
            Tz::UTC
        }),
    };
    Some(DowntimeWindow {
        start: NaiveTime::from_hms_opt(sh, sm, 0)?,
        end: NaiveTime::from_hms_opt(eh, em, 0)?,
        tz,
    })
}

impl DowntimeWindow {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz).time();
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// The next instant at which the window ends, from `now`.
    pub fn end_instant(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.tz);
        let mut candidate_date = local_now.date_naive();
        loop {
            let naive = candidate_date.and_time(self.end);
            let candidate = match self.tz.from_local_datetime(&naive).earliest() {
                Some(dt) => dt.with_timezone(&Utc),
                None => {
                    candidate_date = candidate_date.succ_opt().unwrap_or(candidate_date);
                    continue;
                }
            };
            if candidate > now {
                return candidate;
            }
            candidate_date = match candidate_date.succ_opt() {
                Some(next) => next,
                None => return candidate,
            };
        }
    }
}

/// Block (in stop-aware slices) until the downtime window has passed.
/// Returns immediately when no window is active.
pub async fn wait_out_downtime(window: Option<DowntimeWindow>, stop: &StopEvent) {
    let Some(window) = window else {
        return;
    };
    loop {
        let now = Utc::now();
        if stop.is_set() || !window.contains(now) {
            return;
        }
        let end = window.end_instant(now);
        let remaining = (end - now).to_std().unwrap_or(Duration::ZERO);
        let slice = remaining.min(DOWNTIME_SLICE);
        log::info!(
            "Downtime active until {}; waiting {}s",
            end.to_rfc3339(),
            slice.as_secs()
        );
        tokio::select! {
            _ = stop.wait() => return,
            _ = tokio::time::sleep(slice) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downtime(start: &str, end: &str, tz: Option<&str>) -> DowntimeConfig {
        DowntimeConfig {
            enabled: true,
            start: Some(start.to_string()),
            end: Some(end.to_string()),
            timezone: tz.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_downtime_disabled() {
        let mut config = downtime("23:00", "07:00", None);
        config.enabled = false;
        assert!(parse_downtime(&config).is_none());
    }

    #[test]
    fn test_parse_downtime_bad_timezone_falls_back_to_utc() {
        let window = parse_downtime(&downtime("23:00", "07:00", Some("Not/AZone"))).unwrap();
        assert_eq!(window.tz, Tz::UTC);
    }

    #[test]
    fn test_window_simple_range() {
        let window = parse_downtime(&downtime("09:00", "17:00", None)).unwrap();
        let inside = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2026, 3, 2, 8, 59, 0).unwrap();
        let at_end = Utc.with_ymd_and_hms(2026, 3, 2, 17, 0, 0).unwrap();
        assert!(window.contains(inside));
        assert!(!window.contains(before));
        // End is exclusive.
        assert!(!window.contains(at_end));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let window = parse_downtime(&downtime("23:00", "07:00", None)).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert!(window.contains(late));
        assert!(window.contains(early));
        assert!(!window.contains(midday));
    }

    #[test]
    fn test_end_instant_crosses_midnight() {
        let window = parse_downtime(&downtime("23:00", "07:00", None)).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 23, 30, 0).unwrap();
        let end = window.end_instant(late);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 3, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_window_respects_timezone() {
        // 09:00-17:00 in UTC+13 (Pacific/Auckland, NZDT in March... use a
        // fixed-offset zone instead to keep the assertion stable).
        let window = parse_downtime(&downtime("09:00", "17:00", Some("Etc/GMT-13"))).unwrap();
        // 22:00 UTC == 11:00 local (UTC+13): inside the window.
        let utc_evening = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        assert!(window.contains(utc_evening));
        // 12:00 UTC == 01:00 local: outside.
        let utc_noon = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert!(!window.contains(utc_noon));
    }

    #[tokio::test]
    async fn test_wait_out_downtime_breaks_on_stop() {
        let window = parse_downtime(&downtime("00:00", "23:59", None));
        let stop = StopEvent::new();
        stop.set();
        // Would otherwise wait most of a day.
        tokio::time::timeout(Duration::from_secs(1), wait_out_downtime(window, &stop))
            .await
            .expect("wait did not observe stop");
    }

    #[tokio::test]
    async fn test_scheduler_apply_sets_next_run() {
        let tmp = tempfile::tempdir().unwrap();
        let history = HistoryStore::new(tmp.path().join("main.db"));
        let scheduler = Scheduler::new(history);

        let schedule = ScheduleConfig {
            enabled: true,
            interval_hours: Some(6),
            ..Default::default()
        };
        scheduler.apply(&schedule, Arc::new(|| Box::pin(async { false })));

        let (_, next_run) = scheduler.state();
        let next = DateTime::parse_from_rfc3339(&next_run.unwrap()).unwrap();
        let delta = next.with_timezone(&Utc) - Utc::now();
        assert!(delta > chrono::Duration::hours(5));
        assert!(delta <= chrono::Duration::hours(6));

        // Disabling removes the job and clears next_run.
        scheduler.apply(&ScheduleConfig::default(), Arc::new(|| Box::pin(async { false })));
        let (_, next_run) = scheduler.state();
        assert!(next_run.is_none());
        scheduler.shutdown();
    }
}
