//! Log search index (part of C7).
//!
//! Per-container metadata: level counts, keyword -> offsets, sorted
//! timestamps, normalized error-pattern -> count, performance-metric
//! samples. Rebuilt from persisted logs and refreshed on an interval. Spec
//! section 4.7.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use regex::Regex;
use serde::Serialize;

use super::{LogEntry, LogLevel, StreamKind};

const CACHE_CAPACITY: usize = 100;
const CACHE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerIndex {
    pub level_counts: HashMap<String, usize>,
    pub keyword_offsets: HashMap<String, HashSet<usize>>,
    pub timestamps: Vec<i64>,
    pub error_patterns: HashMap<String, usize>,
    pub perf_samples: Vec<PerfSample>,
    pub entries: Vec<LogEntry>,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerfSample {
    pub kind: String,
    pub value: f64,
    pub unit: String,
    pub at_offset: usize,
}

const ERROR_ANCHORS: &[&str] = &[
    "Error:",
    "Exception:",
    "Failed to",
    "Cannot",
    "Unable to",
    "Timeout",
];

/// Normalizes dynamic bits from a matched error line: numbers -> `N`,
/// quoted strings -> `STR`, truncated to 100 chars.
pub fn normalize_error_pattern(message: &str) -> Option<String> {
    let anchor = ERROR_ANCHORS.iter().find(|a| message.contains(**a))?;
    let idx = message.find(anchor).unwrap();
    let tail: String = message[idx..].chars().take(100).collect();

    let number_re = Regex::new(r"\d+").unwrap();
    let quoted_re = Regex::new(r#"'[^']*'|"[^"]*""#).unwrap();

    let normalized = quoted_re.replace_all(&tail, "STR");
    let normalized = number_re.replace_all(&normalized, "N");
    Some(normalized.to_string())
}

/// Recognizes "response time/latency/duration N (ms|s)", "memory N
/// (KB|MB|GB)", "cpu N %", and "requests|queries N".
pub fn extract_perf_samples(message: &str, offset: usize) -> Vec<PerfSample> {
    let mut out = Vec::new();
    let patterns: &[(&str, &str, &str)] = &[
        (
            r"(?i)(?:response time|latency|duration)\D{0,5}(\d+(?:\.\d+)?)\s*(ms|s)\b",
            "response_time",
            "",
        ),
        (r"(?i)memory\D{0,5}(\d+(?:\.\d+)?)\s*(KB|MB|GB)\b", "memory", ""),
        (r"(?i)cpu\D{0,5}(\d+(?:\.\d+)?)\s*%", "cpu", "%"),
        (r"(?i)(?:requests|queries)\D{0,5}(\d+(?:\.\d+)?)\b", "throughput", ""),
    ];
    for (pattern, kind, fixed_unit) in patterns {
        let re = Regex::new(pattern).unwrap();
        if let Some(caps) = re.captures(message) {
            if let Ok(value) = caps[1].parse::<f64>() {
                let unit = caps
                    .get(2)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| fixed_unit.to_string());
                out.push(PerfSample {
                    kind: kind.to_string(),
                    value,
                    unit,
                    at_offset: offset,
                });
            }
        }
    }
    out
}

fn tokenize(message: &str) -> Vec<String> {
    message
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

impl ContainerIndex {
    pub fn build(entries: Vec<LogEntry>) -> Self {
        let mut index = ContainerIndex {
            entries: entries.clone(),
            built_at: Some(Utc::now()),
            ..Default::default()
        };
        for (offset, entry) in entries.iter().enumerate() {
            *index
                .level_counts
                .entry(format!("{:?}", entry.level).to_lowercase())
                .or_insert(0) += 1;
            index.timestamps.push(entry.timestamp_ms);

            for token in tokenize(&entry.message) {
                index.keyword_offsets.entry(token).or_default().insert(offset);
            }

            if let Some(pattern) = normalize_error_pattern(&entry.message) {
                *index.error_patterns.entry(pattern).or_insert(0) += 1;
            }

            index.perf_samples.extend(extract_perf_samples(&entry.message, offset));
        }
        index.timestamps.sort_unstable();
        index
    }

    /// Offsets of entries at or after `since_ms`, found by binary search over
    /// the sorted timestamp array rather than scanning every entry.
    fn offsets_since(&self, since_ms: i64) -> std::ops::RangeFrom<usize> {
        self.timestamps.partition_point(|&t| t < since_ms)..
    }

    /// Candidate offsets for a query's keyword terms, or `None` when the
    /// query has no single-word terms to look up (phrases, regex-only, or
    /// filter-only queries fall back to a full scan in `search`).
    fn candidate_offsets(&self, query: &ParsedQuery) -> Option<HashSet<usize>> {
        if query.regex.is_some() {
            return None;
        }
        let lookup = |term: &str| -> Option<&HashSet<usize>> {
            if term.contains(' ') {
                None
            } else {
                self.keyword_offsets.get(term)
            }
        };

        let mut candidates: Option<HashSet<usize>> = None;
        for term in &query.required {
            let hits = lookup(term).cloned().unwrap_or_default();
            candidates = Some(match candidates {
                Some(prev) => prev.intersection(&hits).copied().collect(),
                None => hits,
            });
        }
        if candidates.is_none() && !query.optional.is_empty() {
            let mut union = HashSet::new();
            let mut any_lookup = false;
            for term in &query.optional {
                if let Some(hits) = lookup(term) {
                    any_lookup = true;
                    union.extend(hits.iter().copied());
                }
            }
            if any_lookup {
                candidates = Some(union);
            }
        }
        candidates
    }
}

/// A parsed search query: whitespace-separated terms, `key:value` filters,
/// `-term` excludes, `+term` required, quoted phrases, and `/regex/`
/// whole-query mode.
#[derive(Debug, Default)]
pub struct ParsedQuery {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub excluded: Vec<String>,
    pub level: Option<LogLevel>,
    pub stream: Option<StreamKind>,
    pub regex: Option<Regex>,
    pub since_ms: Option<i64>,
}

pub fn parse_query(raw: &str) -> ParsedQuery {
    let trimmed = raw.trim();
    if trimmed.len() > 1 && trimmed.starts_with('/') && trimmed.ends_with('/') {
        let pattern = &trimmed[1..trimmed.len() - 1];
        return ParsedQuery {
            regex: Regex::new(pattern).ok(),
            ..Default::default()
        };
    }

    let mut query = ParsedQuery::default();
    let mut chars = trimmed.chars().peekable();
    let mut current = String::new();
    let mut tokens = Vec::new();
    let mut in_quotes = false;

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if in_quotes {
                    tokens.push(current.clone());
                    current.clear();
                    in_quotes = false;
                } else {
                    if !current.is_empty() {
                        tokens.push(current.clone());
                        current.clear();
                    }
                    in_quotes = true;
                }
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(current.clone());
                    current.clear();
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    for token in tokens {
        if let Some(value) = token.strip_prefix("level:") {
            query.level = Some(LogLevel::from_label(value));
        } else if let Some(value) = token.strip_prefix("stream:") {
            query.stream = match value.to_lowercase().as_str() {
                "stderr" => Some(StreamKind::Stderr),
                _ => Some(StreamKind::Stdout),
            };
        } else if let Some(value) = token.strip_prefix("since:") {
            query.since_ms = value.parse().ok();
        } else if let Some(value) = token.strip_prefix('-') {
            query.excluded.push(value.to_lowercase());
        } else if let Some(value) = token.strip_prefix('+') {
            query.required.push(value.to_lowercase());
        } else if !token.is_empty() {
            query.optional.push(token.to_lowercase());
        }
    }

    query
}

pub fn entry_matches(entry: &LogEntry, query: &ParsedQuery) -> bool {
    if let Some(ref re) = query.regex {
        return re.is_match(&entry.message);
    }
    if let Some(level) = query.level {
        if entry.level != level {
            return false;
        }
    }
    if let Some(stream) = query.stream {
        if entry.stream != stream {
            return false;
        }
    }
    if let Some(since_ms) = query.since_ms {
        if entry.timestamp_ms < since_ms {
            return false;
        }
    }
    let lower = entry.message.to_lowercase();
    for term in &query.required {
        if !lower.contains(term.as_str()) {
            return false;
        }
    }
    for term in &query.excluded {
        if lower.contains(term.as_str()) {
            return false;
        }
    }
    if !query.optional.is_empty() && !query.required.is_empty() {
        return true;
    }
    if !query.optional.is_empty() {
        return query.optional.iter().any(|t| lower.contains(t.as_str()));
    }
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchFacets {
    pub containers: Vec<String>,
    pub levels: HashMap<String, usize>,
    pub top_error_patterns: Vec<(String, usize)>,
}

#[derive(Clone)]
struct CacheEntry {
    results: Vec<LogEntry>,
    cached_at: DateTime<Utc>,
}

pub struct LogSearchIndex {
    logs_dir: PathBuf,
    indices: dashmap::DashMap<String, ContainerIndex>,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl LogSearchIndex {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            indices: dashmap::DashMap::new(),
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// Rebuilds the index for `container_name` by reading its persisted
    /// per-day files from disk.
    pub fn refresh(&self, container_name: &str) -> std::io::Result<()> {
        let dir = self.logs_dir.join(container_name);
        let mut entries = Vec::new();
        if dir.exists() {
            let mut paths: Vec<_> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
            paths.sort_by_key(|e| e.file_name());
            for entry in paths {
                let content = std::fs::read_to_string(entry.path())?;
                for line in content.lines() {
                    if let Ok(parsed) = serde_json::from_str::<LogEntry>(line) {
                        entries.push(parsed);
                    }
                }
            }
        }
        self.indices.insert(container_name.to_string(), ContainerIndex::build(entries));
        Ok(())
    }

    pub fn is_stale(&self, container_name: &str, refresh_period: chrono::Duration) -> bool {
        match self.indices.get(container_name).and_then(|i| i.built_at) {
            Some(built_at) => Utc::now().signed_duration_since(built_at) > refresh_period,
            None => true,
        }
    }

    pub fn search(
        &self,
        container_name: &str,
        raw_query: &str,
    ) -> Vec<LogEntry> {
        let cache_key = format!("{container_name}:{raw_query}");
        if let Some(entry) = self.cache.lock().unwrap().get(&cache_key) {
            if Utc::now().signed_duration_since(entry.cached_at).num_seconds() < CACHE_TTL_SECS {
                return entry.results.clone();
            }
        }

        let query = parse_query(raw_query);
        let results = match self.indices.get(container_name) {
            Some(index) => {
                let time_floor = query.since_ms.map(|s| index.offsets_since(s).start).unwrap_or(0);
                match index.candidate_offsets(&query) {
                    // Keyword lookup narrows to candidate offsets; entry_matches
                    // still confirms each one (tokenized keywords and the
                    // substring/regex checks in entry_matches aren't the same
                    // semantics).
                    Some(offsets) => offsets
                        .into_iter()
                        .filter(|&offset| offset >= time_floor)
                        .filter_map(|offset| index.entries.get(offset))
                        .filter(|e| entry_matches(e, &query))
                        .cloned()
                        .collect::<Vec<_>>(),
                    // No usable keyword terms (phrase/regex/filter-only query):
                    // full scan, restricted to entries at or after since_ms.
                    None => index
                        .entries
                        .iter()
                        .skip(time_floor)
                        .filter(|e| entry_matches(e, &query))
                        .cloned()
                        .collect::<Vec<_>>(),
                }
            }
            None => Vec::new(),
        };

        self.cache.lock().unwrap().put(
            cache_key,
            CacheEntry {
                results: results.clone(),
                cached_at: Utc::now(),
            },
        );
        results
    }

    pub fn facets(&self, container_name: &str) -> SearchFacets {
        let index = self.indices.get(container_name);
        let levels = index
            .as_ref()
            .map(|i| i.level_counts.clone())
            .unwrap_or_default();
        let mut top: Vec<(String, usize)> = index
            .as_ref()
            .map(|i| i.error_patterns.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(10);
        SearchFacets {
            containers: self.indices.iter().map(|e| e.key().clone()).collect(),
            levels,
            top_error_patterns: top,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(msg: &str) -> LogEntry {
        LogEntry {
            timestamp_ms: 0,
            level: LogLevel::Info,
            stream: StreamKind::Stdout,
            message: msg.to_string(),
            container_name: "c".into(),
        }
    }

    #[test]
    fn error_pattern_normalizes_numbers_and_strings() {
        let pattern = normalize_error_pattern("Error: failed to load '/tmp/42.json' after 3 tries")
            .unwrap();
        assert!(pattern.contains("Error:"));
        assert!(pattern.contains("STR"));
        assert!(pattern.contains('N'));
    }

    #[test]
    fn perf_extraction_finds_response_time() {
        let samples = extract_perf_samples("request completed, response time 120ms", 0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, "response_time");
        assert_eq!(samples[0].value, 120.0);
    }

    #[test]
    fn query_parses_filters_and_excludes() {
        let query = parse_query("level:error -timeout +database \"connection reset\"");
        assert_eq!(query.level, Some(LogLevel::Error));
        assert!(query.excluded.contains(&"timeout".to_string()));
        assert!(query.required.contains(&"database".to_string()));
        assert!(query.optional.iter().any(|t| t == "connection reset"));
    }

    #[test]
    fn regex_mode_matches_whole_query() {
        let query = parse_query("/fail\\d+/");
        assert!(entry_matches(&entry("fail42 occurred"), &query));
        assert!(!entry_matches(&entry("all good"), &query));
    }

    #[test]
    fn index_build_counts_levels() {
        let entries = vec![entry("ok"), entry("ok"), {
            let mut e = entry("ERROR: boom");
            e.level = LogLevel::Error;
            e
        }];
        let index = ContainerIndex::build(entries);
        assert_eq!(index.level_counts.get("info"), Some(&2));
        assert_eq!(index.level_counts.get("error"), Some(&1));
    }
}
