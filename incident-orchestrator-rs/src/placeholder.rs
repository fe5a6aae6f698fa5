// incident-orchestrator-rs/src/placeholder.rs
// Detection of mock / example data in collaborator output. The heuristics
// sit behind a trait so they can be swapped and tested on their own.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Written in place of a placeholder when no verified value is known.
pub const UNVERIFIED: &str = "unverified";

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

static TEMPLATE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{.*\}\}|\$\{.*\}").expect("template pattern is valid"));

/// `true` for context ids that are sentinels rather than real ids.
pub fn is_placeholder_context_id(value: &str) -> bool {
    let v = value.trim();
    let lowered = v.to_ascii_lowercase();
    v.is_empty()
        || matches!(
            lowered.as_str(),
            "undefined" | "null" | "none" | "unknown" | "default" | "n/a" | "nan"
        )
        || lowered == NIL_UUID
        || TEMPLATE_MARKER.is_match(v)
}

/// A placeholder found inside a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderHit {
    /// JSON pointer to the value.
    pub path: String,
    pub value: String,
}

pub trait PlaceholderDetector: Send + Sync {
    fn is_placeholder(&self, value: &str) -> bool;

    /// Every string in `doc` that looks like a placeholder. Keys in
    /// `skip_keys` are not descended into.
    fn scan(&self, doc: &Value, skip_keys: &[&str]) -> Vec<PlaceholderHit> {
        let mut hits = Vec::new();
        walk(doc, String::new(), skip_keys, &mut |path: &str, s: &str| {
            if self.is_placeholder(s) {
                hits.push(PlaceholderHit {
                    path: path.to_string(),
                    value: s.to_string(),
                });
            }
        });
        hits
    }
}

fn walk(value: &Value, path: String, skip_keys: &[&str], visit: &mut dyn FnMut(&str, &str)) {
    match value {
        Value::String(s) => visit(&path, s),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, format!("{}/{}", path, i), skip_keys, visit);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if skip_keys.contains(&key.as_str()) {
                    continue;
                }
                walk(item, format!("{}/{}", path, escape_pointer(key)), skip_keys, visit);
            }
        }
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Pattern-based detector for the identifiers collaborators tend to invent
/// when they have no real data: `example.com` hosts, `service-a`,
/// `my-service`, `foo`/`bar`, lorem ipsum, template markers and the nil UUID.
///
/// Identifier patterns only apply to values without whitespace, so prose
/// such as "Sample rate misconfigured" is left alone.
pub struct HeuristicPlaceholderDetector {
    anywhere: RegexSet,
    identifiers: RegexSet,
}

impl HeuristicPlaceholderDetector {
    /// Matched against any string value.
    pub const DEFAULT_PATTERNS: &'static [&'static str] = &[
        r"(?i)\bexample\.(com|org|net)\b",
        r"(?i)lorem ipsum",
        r"\{\{.*\}\}",
        r"^00000000-0000-0000-0000-000000000000$",
        r"^<[^<>]+>$",
    ];

    /// Matched only against single-token values.
    pub const DEFAULT_IDENTIFIER_PATTERNS: &'static [&'static str] = &[
        r"(?i)^(service|svc|host|server|app|node)[-_]?([a-d]|x|y|z|[0-9]|123|name)$",
        r"(?i)^(your|my)[-_]?(service|app|host|cluster|namespace)(-name)?$",
        r"(?i)^(foo|bar|baz|qux|dummy|mock|sample|placeholder|lorem)([-_][a-z0-9]+)*$",
        r"(?i)^x{3,}$",
        r"(?i)^(todo|tbd|n/a|null|undefined)$",
    ];

    pub fn new() -> Self {
        Self::with_patterns(Self::DEFAULT_PATTERNS, Self::DEFAULT_IDENTIFIER_PATTERNS)
            .unwrap_or_else(|_| Self {
                anywhere: RegexSet::empty(),
                identifiers: RegexSet::empty(),
            })
    }

    pub fn with_patterns<I, J, S>(anywhere: I, identifiers: J) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            anywhere: RegexSet::new(anywhere)?,
            identifiers: RegexSet::new(identifiers)?,
        })
    }
}

impl Default for HeuristicPlaceholderDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderDetector for HeuristicPlaceholderDetector {
    fn is_placeholder(&self, value: &str) -> bool {
        let v = value.trim();
        if v.is_empty() {
            return false;
        }
        self.anywhere.is_match(v)
            || (!v.contains(char::is_whitespace) && self.identifiers.is_match(v))
    }
}

/// A placeholder that was replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
    pub path: String,
    pub original: String,
    pub replacement: String,
}

/// Replace placeholders in `doc`. Values under a key mentioning "service"
/// get `verified_service` when one is known; everything else becomes
/// [`UNVERIFIED`].
pub fn substitute_placeholders(
    detector: &dyn PlaceholderDetector,
    doc: &mut Value,
    skip_keys: &[&str],
    verified_service: Option<&str>,
) -> Vec<Substitution> {
    let hits = detector.scan(doc, skip_keys);
    let mut applied = Vec::with_capacity(hits.len());

    for hit in hits {
        let replacement = match verified_service {
            Some(service) if path_mentions_service(&hit.path) => service.to_string(),
            _ => UNVERIFIED.to_string(),
        };
        if let Some(slot) = doc.pointer_mut(&hit.path) {
            *slot = Value::String(replacement.clone());
            applied.push(Substitution {
                path: hit.path,
                original: hit.value,
                replacement,
            });
        }
    }
    applied
}

fn path_mentions_service(path: &str) -> bool {
    path.split('/')
        .filter(|seg| seg.parse::<usize>().is_err())
        .last()
        .map(|key| key.to_ascii_lowercase().contains("service"))
        .unwrap_or(false)
}
