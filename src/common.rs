use reqwest::StatusCode;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
    time::{SystemTime, UNIX_EPOCH},
};

pub fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn default_report_paths(portal_id: &str, data_dir: &Path) -> (PathBuf, PathBuf) {
    (
        data_dir.join(format!("{portal_id}-run-report.csv")),
        data_dir.join(format!("{portal_id}-run-report.json")),
    )
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Portals answer expired-session API calls with their login page. An HTML
/// body where JSON was expected is the strongest expiry signal we have.
pub fn is_html_document(body: &str) -> bool {
    let head = body.trim_start();
    let lowered = head
        .get(..head.len().min(32))
        .unwrap_or_default()
        .to_ascii_lowercase();
    lowered.starts_with("<!doctype html") || lowered.starts_with("<html")
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        trimmed.to_string()
    } else {
        format!("{}...", &trimmed[..max_len])
    }
}

pub fn install_ctrlc_handler(shutdown_requested: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let was_set = shutdown_requested.swap(true, Ordering::SeqCst);
            if !was_set {
                eprintln!(
                    "\nReceived Ctrl-C. Finishing in-flight extractions, then writing the report..."
                );
            }
        }
    });
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_parses_whole_seconds() {
        let value = HeaderValue::from_static("7");
        assert_eq!(
            parse_retry_after(Some(&value)),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn retry_after_rejects_http_dates() {
        let value = HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&value)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn html_sniffing_matches_login_pages() {
        assert!(is_html_document("<!DOCTYPE html><html><body>Sign in</body>"));
        assert!(is_html_document("  <html lang=\"en\">"));
        assert!(!is_html_document("{\"members\":[]}"));
        assert!(!is_html_document(""));
    }

    #[test]
    fn truncation_keeps_short_bodies_intact() {
        assert_eq!(truncate_for_log("  ok  "), "ok");
        let long = "x".repeat(400);
        let truncated = truncate_for_log(&long);
        assert_eq!(truncated.len(), 303);
        assert!(truncated.ends_with("..."));
    }
}
