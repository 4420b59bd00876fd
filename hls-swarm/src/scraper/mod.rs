//! Segment-size scraper: periodically polls an origin JSON
//! file index and maintains a bounded rolling-window cache, keyed by
//! filename, that the Event Parser joins against to credit segment
//! throughput.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::parser::SegmentSizeLookup;

#[derive(Debug, Deserialize)]
struct RemoteEntry {
    name: String,
    #[serde(default, rename = "type")]
    #[allow(dead_code)]
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    mtime: String,
    size: u64,
}

/// Parse the embedded segment number from a filename by scanning
/// backward from just before the extension over a contiguous digit run
///.
/// Robust across `seg00017.ts`, `segment_123.ts`, `chunk-42.ts`.
/// Filenames with no trailing digit run (e.g. `stream.m3u8`) return
/// `None` and are treated as manifests.
pub fn parse_segment_number(filename: &str) -> Option<u64> {
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(filename);
    let digits: String = stem.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let digits: String = digits.chars().rev().collect();
    digits.parse().ok()
}

/// Process-wide filename→size cache, written by exactly one scraper and
/// read by every client's event parser.
pub struct SegmentSizeScraper {
    cache: DashMap<String, u64>,
    highest_segment: AtomicU64,
    window: u64,
    http: reqwest::Client,
    url: String,
    response_cap_bytes: usize,
    request_timeout: Duration,
    refresh_notify: Notify,
    refresh_errors: AtomicU64,
    rng: AsyncMutex<StdRng>,
}

impl SegmentSizeScraper {
    pub fn new(
        url: String,
        window: u64,
        request_timeout: Duration,
        response_cap_bytes: usize,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            cache: DashMap::new(),
            highest_segment: AtomicU64::new(0),
            window,
            http,
            url,
            response_cap_bytes,
            request_timeout,
            refresh_notify: Notify::new(),
            refresh_errors: AtomicU64::new(0),
            // Scraper-local RNG, deliberately independent of the
            // per-client seeded RNGs: jitter here has no determinism
            // requirement, only the need to avoid a global-RNG lock on
            // every tick.
            rng: AsyncMutex::new(StdRng::from_entropy()),
        })
    }

    pub fn highest_segment(&self) -> u64 {
        self.highest_segment.load(Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn refresh_error_count(&self) -> u64 {
        self.refresh_errors.load(Ordering::Relaxed)
    }

    /// One refresh cycle: fetch, parse, populate cache, advance the
    /// highest-segment watermark, evict.
    pub async fn refresh_once(&self) -> anyhow::Result<usize> {
        let body = self.fetch_capped().await?;
        let entries: Vec<RemoteEntry> = serde_json::from_slice(&body)?;

        let mut max_seen = self.highest_segment.load(Ordering::Relaxed);
        for entry in &entries {
            self.cache.insert(entry.name.clone(), entry.size);
            if let Some(n) = parse_segment_number(&entry.name) {
                max_seen = max_seen.max(n);
            }
        }
        self.highest_segment.store(max_seen, Ordering::Relaxed);
        self.evict(max_seen);

        self.refresh_notify.notify_waiters();
        Ok(entries.len())
    }

    /// Fetch the index with a hard cap on response size, enforced on the byte stream directly
    /// rather than trusting `Content-Length`.
    async fn fetch_capped(&self) -> anyhow::Result<Vec<u8>> {
        use futures::StreamExt;

        let resp = self.http.get(&self.url).send().await?.error_for_status()?;
        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > self.response_cap_bytes {
                anyhow::bail!(
                    "segment-size index exceeded cap of {} bytes",
                    self.response_cap_bytes
                );
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf)
    }

    /// After each refresh: delete every entry whose parsed number is
    /// strictly below `highest - window + 1`. Manifests (no embedded
    /// number) are never evicted.
    fn evict(&self, highest: u64) {
        let threshold = highest.saturating_sub(self.window).saturating_add(1);
        self.cache.retain(|name, _| match parse_segment_number(name) {
            Some(n) => n >= threshold,
            None => true,
        });
    }

    /// Bounded wait for the first successful refresh, used by the
    /// Orchestrator's cold-start sequence.
    pub async fn wait_for_first_refresh(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.refresh_notify.notified())
            .await
            .is_ok()
    }

    async fn next_jitter(&self, jitter: Duration) -> Duration {
        if jitter.is_zero() {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().await;
        let millis = jitter.as_millis().max(1) as u64;
        Duration::from_millis(rng.gen_range(0..=millis))
    }

    /// Run the poll loop until `cancel` fires. Uses a single reusable
    /// sleep future reset each iteration rather than allocating a fresh
    /// timer per cycle, and its own RNG so jitter draws never contend
    /// with a process-global source.
    pub async fn run(self: Arc<Self>, interval: Duration, jitter: Duration, cancel: CancellationToken) {
        loop {
            let this_jitter = self.next_jitter(jitter).await;
            let delay = interval + this_jitter;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            match self.refresh_once().await {
                Ok(n) => debug!(entries = n, "segment-size index refreshed"),
                Err(e) => {
                    self.refresh_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "segment-size refresh failed, retrying next tick");
                }
            }
        }
    }
}

impl SegmentSizeLookup for SegmentSizeScraper {
    fn size_of(&self, filename: &str) -> Option<u64> {
        self.cache.get(filename).map(|v| *v)
    }
}

/// Derive the segment-size index URL: an explicit override takes
/// precedence; otherwise it is derived from the origin host.
pub fn resolve_segment_sizes_url(origin_host: &str, explicit: Option<&str>) -> Option<String> {
    if let Some(url) = explicit {
        return Some(url.to_string());
    }
    if origin_host.is_empty() {
        return None;
    }
    let trimmed = origin_host.trim_end_matches('/');
    Some(format!("{trimmed}/segment-sizes.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backward_digit_scan_across_naming_schemes() {
        assert_eq!(parse_segment_number("seg00017.ts"), Some(17));
        assert_eq!(parse_segment_number("segment_123.ts"), Some(123));
        assert_eq!(parse_segment_number("chunk-42.ts"), Some(42));
        assert_eq!(parse_segment_number("stream.m3u8"), None);
    }

    #[test]
    fn eviction_math_matches_window_five_scenario() {
        let cache: DashMap<String, u64> = DashMap::new();
        for i in 1..=8u64 {
            cache.insert(format!("seg{i}.ts"), 1000);
        }
        cache.insert("stream.m3u8".to_string(), 500);

        let window = 5u64;
        let highest = 8u64;
        let threshold = highest.saturating_sub(window).saturating_add(1);
        cache.retain(|name, _| match parse_segment_number(name) {
            Some(n) => n >= threshold,
            None => true,
        });

        let mut remaining: Vec<String> = cache.iter().map(|e| e.key().clone()).collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "seg4.ts".to_string(),
                "seg5.ts".to_string(),
                "seg6.ts".to_string(),
                "seg7.ts".to_string(),
                "seg8.ts".to_string(),
                "stream.m3u8".to_string(),
            ]
        );
    }

    #[test]
    fn resolve_url_prefers_explicit_override() {
        assert_eq!(
            resolve_segment_sizes_url("https://origin.example", Some("https://override/idx.json")),
            Some("https://override/idx.json".to_string())
        );
        assert_eq!(
            resolve_segment_sizes_url("https://origin.example/", None),
            Some("https://origin.example/segment-sizes.json".to_string())
        );
        assert_eq!(resolve_segment_sizes_url("", None), None);
    }
}
