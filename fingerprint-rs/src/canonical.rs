//! Alert canonicalization.
//!
//! Numerically varying repeats of the same alert ("CPU at 91%" / "CPU at
//! 94%") must collapse to one key. The title has its volatile figures
//! replaced by fixed tokens, then the alert is reduced to an ordered list
//! of components that is joined, lowercased, filtered to `[a-z0-9|-]` and
//! truncated.

use std::collections::BTreeSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::alert::Alert;

pub const MAX_FINGERPRINT_LEN: usize = 64;
const DELIMITER: &str = "|";

static ISO_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?)?",
    )
    .expect("timestamp pattern is valid")
});

static RELATIVE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d+\s*(?:seconds?|secs?|minutes?|mins?|hours?|hrs?|days?|weeks?)\s+ago\b",
    )
    .expect("relative time pattern is valid")
});

static PERCENTAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?\s*%").expect("percentage pattern is valid"));

static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:\.\d+)?\s*(?:ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?|d|days?)\b",
    )
    .expect("duration pattern is valid")
});

/// Kebab-case identifiers such as `crm-customer-information`.
static SERVICE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-z][a-z0-9]*(?:-[a-z0-9]+)+\b").expect("service pattern is valid")
});

static ERROR_TAGS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        (
            "connection",
            r"connection (?:refused|reset|closed|error|failed)|econnrefused|econnreset|unreachable",
        ),
        ("timeout", r"timeout|timed out|deadline exceeded"),
        (
            "auth",
            r"\b401\b|\b403\b|unauthori[sz]ed|forbidden|authentication|invalid client|token expired",
        ),
        (
            "server",
            r"\b5\d\d\b|internal server error|bad gateway|service unavailable",
        ),
    ]
    .into_iter()
    .map(|(tag, pattern)| {
        let re = Regex::new(&format!("(?i){}", pattern)).expect("error tag pattern is valid");
        (tag, re)
    })
    .collect()
});

/// Canonical dedup key: at most 64 chars from `[a-z0-9|-]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already canonical string, e.g. one read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replace timestamps, relative times, percentages and durations with the
/// fixed tokens `ts`, `ago`, `pct` and `dur`.
pub fn clean_title(title: &str) -> String {
    let s = ISO_TIMESTAMP.replace_all(title, "ts");
    let s = RELATIVE_TIME.replace_all(&s, "ago");
    let s = PERCENTAGE.replace_all(&s, "pct");
    let s = DURATION.replace_all(&s, "dur");
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sorted, deduplicated service names from the body plus explicit labels.
pub fn extract_services(alert: &Alert) -> Vec<String> {
    let body = alert.body.to_lowercase();
    let mut services: BTreeSet<String> = SERVICE_NAME
        .find_iter(&body)
        .map(|m| m.as_str().to_string())
        .collect();
    services.extend(
        alert
            .services
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty()),
    );
    services.into_iter().collect()
}

/// Error tags detected in the body, in fixed order. The title already
/// contributes through its cleaned form.
pub fn detect_error_tags(alert: &Alert) -> Vec<&'static str> {
    ERROR_TAGS
        .iter()
        .filter(|(_, re)| re.is_match(&alert.body))
        .map(|(tag, _)| *tag)
        .collect()
}

/// Ordered components: source, cleaned title, priority, services, error tags.
pub fn canonical_components(alert: &Alert) -> Vec<String> {
    let mut components = vec![
        alert.source.trim().to_string(),
        clean_title(&alert.title),
        alert.priority.to_string(),
    ];
    components.extend(extract_services(alert));
    components.extend(detect_error_tags(alert).into_iter().map(str::to_string));
    components
}

/// Full canonical string before truncation.
pub fn canonicalize(alert: &Alert) -> String {
    canonical_components(alert)
        .join(DELIMITER)
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '|' || *c == '-')
        .collect()
}

/// Pure and deterministic: depends only on the alert's content.
pub fn fingerprint(alert: &Alert) -> Fingerprint {
    let mut canonical = canonicalize(alert);
    canonical.truncate(MAX_FINGERPRINT_LEN);
    Fingerprint(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Priority;

    fn alert(title: &str) -> Alert {
        Alert::new("prometheus", title, Priority::High)
            .with_body("crm-customer-information returned 503 service unavailable")
    }

    #[test]
    fn title_cleaning_replaces_volatile_figures() {
        assert_eq!(
            clean_title("CPU at 93.5% since 2024-05-01T10:00:00Z for 15 min"),
            "CPU at pct since ts for dur"
        );
        assert_eq!(clean_title("Disk alert raised 5 minutes ago"), "Disk alert raised ago");
        assert_eq!(clean_title("p99 latency 850ms"), "p99 latency dur");
    }

    #[test]
    fn volatile_title_figures_do_not_change_fingerprint() {
        let a = alert("CPU at 91% on node for 5m (2024-05-01 10:00:00)");
        let b = alert("CPU at 97.2% on node for 12m (2024-06-11 22:41:09)");
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = alert("Queue stalled 3 minutes ago");
        let d = alert("Queue stalled 45 minutes ago");
        assert_eq!(fingerprint(&c), fingerprint(&d));
    }

    #[test]
    fn receipt_time_and_labels_do_not_change_fingerprint() {
        let a = alert("Auth failures");
        let mut b = a.clone();
        b.received_at = a.received_at + chrono::Duration::hours(3);
        b.labels.insert("env".to_string(), "prod".to_string());
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn source_and_title_change_fingerprint() {
        let a = alert("Auth failures");
        let mut other_source = a.clone();
        other_source.source = "datadog".to_string();
        assert_ne!(fingerprint(&a), fingerprint(&other_source));

        let other_title = alert("Payment failures");
        assert_ne!(fingerprint(&a), fingerprint(&other_title));
    }

    #[test]
    fn services_are_sorted_and_deduplicated() {
        let a = Alert::new("prom", "Errors", Priority::Low)
            .with_body("billing-api and auth-service and billing-api")
            .with_services(["Auth-Service"]);
        assert_eq!(extract_services(&a), vec!["auth-service", "billing-api"]);
    }

    #[test]
    fn error_tags_follow_fixed_order() {
        let a = Alert::new("prom", "Errors", Priority::Low)
            .with_body("502 bad gateway after request timed out; connection refused");
        assert_eq!(detect_error_tags(&a), vec!["connection", "timeout", "server"]);
    }

    #[test]
    fn error_tags_ignore_the_title() {
        let a = Alert::new("prom", "Login timeout after 401", Priority::Low)
            .with_body("connection refused");
        assert_eq!(detect_error_tags(&a), vec!["connection"]);
    }

    #[test]
    fn fingerprint_is_bounded_and_filtered() {
        let a = Alert::new(
            "Grafana Cloud!",
            "A very long title with Ünïcode, punctuation; and more words than fit in sixty four",
            Priority::Critical,
        );
        let fp = fingerprint(&a);
        assert!(fp.as_str().len() <= MAX_FINGERPRINT_LEN);
        assert!(fp
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '|' || c == '-'));
        assert!(fp.as_str().starts_with("grafanacloud|"));
    }
}
