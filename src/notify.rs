//! Telegram notification channel
//!
//! One outbound GET per message, best-effort with a 10 s timeout. The run
//! summary tightens its per-bucket item count until it fits the channel's
//! length limit.

use std::time::Duration;

use crate::config::Config;

const MESSAGE_MAX_LEN: usize = 4000;
const SUMMARY_MAX_ITEMS: usize = 20;

pub async fn telegram_notify(config: &Config, message: &str) {
    let Some(tg) = &config.telegram else {
        return;
    };
    let (Some(token), Some(chat_id)) = (tg.bot_token.as_deref(), tg.chat_id.as_deref()) else {
        return;
    };
    if token.is_empty() || chat_id.is_empty() {
        return;
    }

    let url = format!("https://api.telegram.org/bot{token}/sendMessage");
    let client = reqwest::Client::new();
    let result = client
        .get(&url)
        .query(&[("chat_id", chat_id), ("text", message)])
        .timeout(Duration::from_secs(10))
        .send()
        .await;
    match result {
        Ok(response) if !response.status().is_success() => {
            log::error!("Telegram notify failed: HTTP {}", response.status());
        }
        Ok(_) => {}
        Err(err) => log::error!("Telegram notify failed: {err}"),
    }
}

pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn render_summary(
    successes: &[String],
    failures: &[String],
    duration_seconds: u64,
    limit: usize,
) -> String {
    let status_label = if failures.is_empty() {
        "completed"
    } else {
        "completed with errors"
    };

    let mut parts = vec![
        "Mediavault Summary".to_string(),
        format!("Status: {status_label}"),
        format!("✔ Success: {}", successes.len()),
        format!("✖ Failed: {}", failures.len()),
        format!("Duration: {}", format_duration(duration_seconds)),
        String::new(),
    ];

    if !successes.is_empty() {
        parts.push("Downloaded:".to_string());
        for title in successes.iter().take(limit) {
            parts.push(format!("• {title}"));
        }
        if successes.len() > limit {
            parts.push(format!("• (+{} more)", successes.len() - limit));
        }
    }
    if !failures.is_empty() {
        if !successes.is_empty() {
            parts.push(String::new());
        }
        parts.push("Failed:".to_string());
        for title in failures.iter().take(limit) {
            parts.push(format!("• {title}"));
        }
        if failures.len() > limit {
            parts.push(format!("• (+{} more)", failures.len() - limit));
        }
    }
    parts.join("\n")
}

/// Build the end-of-run summary, shrinking the per-bucket listing until the
/// message fits the channel limit.
pub fn build_run_summary(
    successes: &[String],
    failures: &[String],
    duration_seconds: u64,
) -> Option<String> {
    if successes.is_empty() && failures.is_empty() {
        return None;
    }
    let mut limit = SUMMARY_MAX_ITEMS;
    let mut message = render_summary(successes, failures, duration_seconds, limit);
    let mut truncated = successes.len() > limit || failures.len() > limit;

    while message.len() > MESSAGE_MAX_LEN && limit > 0 {
        limit -= 1;
        truncated = true;
        message = render_summary(successes, failures, duration_seconds, limit);
    }
    if truncated {
        log::warn!("Run summary truncated to fit message limits.");
    }
    Some(message)
}

pub async fn send_run_summary(
    config: &Config,
    successes: &[String],
    failures: &[String],
    duration_seconds: u64,
) {
    if let Some(message) = build_run_summary(successes, failures, duration_seconds) {
        telegram_notify(config, &message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(12), "12s");
        assert_eq!(format_duration(330), "5m 30s");
        assert_eq!(format_duration(3930), "1h 5m 30s");
    }

    #[test]
    fn test_no_summary_for_empty_run() {
        assert!(build_run_summary(&[], &[], 10).is_none());
    }

    #[test]
    fn test_summary_status_label() {
        let ok = build_run_summary(&["a.webm".into()], &[], 10).unwrap();
        assert!(ok.contains("Status: completed\n"));
        assert!(ok.contains("• a.webm"));

        let failed = build_run_summary(&["a.webm".into()], &["b (auth)".into()], 10).unwrap();
        assert!(failed.contains("Status: completed with errors"));
        assert!(failed.contains("Failed:"));
    }

    #[test]
    fn test_summary_tightens_to_limit() {
        let successes: Vec<String> = (0..500).map(|i| format!("a very long title {i}")).collect();
        let message = build_run_summary(&successes, &[], 10).unwrap();
        assert!(message.len() <= MESSAGE_MAX_LEN);
        assert!(message.contains("more)"));
        assert!(message.contains("✔ Success: 500"));
    }
}
