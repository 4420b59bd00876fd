//! Event parser: classifies child stderr lines, tracks
//! in-flight requests, and feeds inferred latency + counters into a
//! client's stats.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;

/// Classification of a request URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    Manifest,
    Segment,
    Init,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFailReason {
    Refused,
    Timeout,
    Error,
}

/// Tagged union of parsed events.
#[derive(Debug, Clone)]
pub enum Event {
    HlsRequest { url: String, kind: UrlKind },
    HttpOpen { url: String },
    HttpRequestGet { path: String },
    TcpStart { ip: String, port: u16 },
    TcpConnected { ip: String, port: u16 },
    TcpFailed { ip: String, port: u16, reason: TcpFailReason },
    HttpError { code: u16 },
    Reconnect,
    SegmentFailed { id: u64 },
    SegmentSkipped { id: u64 },
    PlaylistFailed { id: u64 },
    SegmentsExpired { skip: u64 },
    SequenceChange { old: u64, new: u64 },
    ManifestBandwidth { bps: u64 },
}

/// Consumer-facing counters interface: the event parser only
/// needs to push observations, never read back client state, so it is
/// expressed against a trait rather than `ClientStats` directly. This lets
/// test doubles replace it without introducing a reverse dependency from
/// `stats` back to `parser`.
pub trait EventSink: Send + Sync {
    fn record_request(&self, kind: UrlKind);
    fn record_http_error(&self, code: u16);
    fn record_timeout(&self);
    fn record_reconnect(&self);
    fn observe_inferred_latency(&self, kind: UrlKind, latency: Duration);
    fn credit_segment_bytes(&self, bytes: u64);
    fn credit_segment_throughput(&self, bytes: u64, wall_time: Duration);
}

/// Read-only lookup into the process-wide segment-size cache,
/// joined against event completions by filename.
pub trait SegmentSizeLookup: Send + Sync {
    fn size_of(&self, filename: &str) -> Option<u64>;
}

/// Strip the query/fragment and return the basename of a URL or path.
pub fn basename(url_or_path: &str) -> &str {
    let without_query = url_or_path.split(['?', '#']).next().unwrap_or(url_or_path);
    without_query.rsplit('/').next().unwrap_or(without_query)
}

/// Classify a URL into manifest, segment, init, or unknown. Init-segment detection is checked before
/// the generic `.ts`/`.mp4`/`.m4s` bucket, since init segments commonly
/// share those same extensions and would otherwise be miscounted as
/// regular segments.
pub fn classify_url(url: &str) -> UrlKind {
    let name = basename(url).to_ascii_lowercase();
    if name.ends_with(".m3u8") {
        return UrlKind::Manifest;
    }
    if is_init_marker(&name) {
        return UrlKind::Init;
    }
    if name.ends_with(".ts") || name.ends_with(".mp4") || name.ends_with(".m4s") {
        return UrlKind::Segment;
    }
    UrlKind::Unknown
}

fn is_init_marker(lower_name: &str) -> bool {
    (lower_name.ends_with(".mp4") || lower_name.ends_with(".m4s"))
        && (lower_name.contains("init") || lower_name.starts_with("0-"))
}

struct Patterns {
    hls_request: Regex,
    opening: Regex,
    http_get: Regex,
    tcp_start: Regex,
    tcp_connected: Regex,
    tcp_failed: Regex,
    http_error: Regex,
    reconnect: Regex,
    segment_failed: Regex,
    segment_skipped: Regex,
    playlist_failed: Regex,
    segments_expired: Regex,
    sequence_change: Regex,
    bandwidth: Regex,
}

impl Patterns {
    fn compile() -> Self {
        Self {
            hls_request: Regex::new(
                r"HLS request for url '([^']+)', offset (\d+), playlist (\d+)",
            )
            .unwrap(),
            opening: Regex::new(r"Opening '([^']+)' for reading").unwrap(),
            http_get: Regex::new(r"request:\s*GET\s+(\S+)\s+HTTP/1\.1").unwrap(),
            tcp_start: Regex::new(r"Starting connection attempt to ([0-9a-fA-F.:]+) port (\d+)")
                .unwrap(),
            tcp_connected: Regex::new(
                r"Successfully connected to ([0-9a-fA-F.:]+) port (\d+)",
            )
            .unwrap(),
            tcp_failed: Regex::new(
                r"(?:Connection|connect)(?:ion)? to ([0-9a-fA-F.:]+) port (\d+) failed(?:: (.*))?",
            )
            .unwrap(),
            http_error: Regex::new(r"HTTP error (\d{3})").unwrap(),
            reconnect: Regex::new(r"Will reconnect.*in (\d+) second").unwrap(),
            segment_failed: Regex::new(r"Failed to open segment (\d+) of playlist (\d+)")
                .unwrap(),
            segment_skipped: Regex::new(
                r"Segment (\d+) of playlist (\d+) failed too many times, skipping",
            )
            .unwrap(),
            playlist_failed: Regex::new(r"Failed to reload playlist (\d+)").unwrap(),
            segments_expired: Regex::new(
                r"skipping (\d+) segments ahead, expired from playlists",
            )
            .unwrap(),
            sequence_change: Regex::new(r"Media sequence change \((\d+) -> (\d+)\)").unwrap(),
            bandwidth: Regex::new(r"BANDWIDTH=(\d+)").unwrap(),
        }
    }
}

/// Per-client event classifier and in-flight-request tracker.
pub struct EventParser {
    patterns: Patterns,
    /// filename -> request-open time. Lock-free reads/removals via
    /// `dashmap`; single logical writer per client (this parser).
    inflight: DashMap<String, Instant>,
    /// Most recently opened filename + kind, used to finalize the prior
    /// entry once a distinct filename opens.
    current: Mutex<Option<(String, UrlKind)>>,
    ttl: Duration,
    size_lookup: Arc<dyn SegmentSizeLookup>,
}

impl EventParser {
    pub fn new(inflight_ttl: Duration, size_lookup: Arc<dyn SegmentSizeLookup>) -> Self {
        Self {
            patterns: Patterns::compile(),
            inflight: DashMap::new(),
            current: Mutex::new(None),
            ttl: inflight_ttl,
            size_lookup,
        }
    }

    /// Classify one stderr line, update `sink`, and return the event if
    /// the line was recognized.
    pub fn parse_line(&self, sink: &dyn EventSink, line: &str) -> Option<Event> {
        let now = Instant::now();

        if let Some(c) = self.patterns.hls_request.captures(line) {
            let url = c[1].to_string();
            let kind = classify_url(&url);
            sink.record_request(kind);
            self.open(&url, now, sink, kind);
            return Some(Event::HlsRequest { url, kind });
        }

        if let Some(c) = self.patterns.opening.captures(line) {
            let url = c[1].to_string();
            let kind = classify_url(&url);
            self.open(&url, now, sink, kind);
            return Some(Event::HttpOpen { url });
        }

        if let Some(c) = self.patterns.http_get.captures(line) {
            let path = c[1].to_string();
            let kind = classify_url(&path);
            self.open(&path, now, sink, kind);
            return Some(Event::HttpRequestGet { path });
        }

        if let Some(c) = self.patterns.tcp_start.captures(line) {
            return Some(Event::TcpStart {
                ip: c[1].to_string(),
                port: c[2].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.tcp_connected.captures(line) {
            return Some(Event::TcpConnected {
                ip: c[1].to_string(),
                port: c[2].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.tcp_failed.captures(line) {
            let reason_text = c.get(3).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
            let reason = if reason_text.contains("refused") {
                TcpFailReason::Refused
            } else if reason_text.contains("timeout") || reason_text.contains("timed out") {
                TcpFailReason::Timeout
            } else {
                TcpFailReason::Error
            };
            if reason == TcpFailReason::Timeout {
                sink.record_timeout();
            }
            return Some(Event::TcpFailed {
                ip: c[1].to_string(),
                port: c[2].parse().unwrap_or(0),
                reason,
            });
        }

        if let Some(c) = self.patterns.http_error.captures(line) {
            let code: u16 = c[1].parse().unwrap_or(0);
            sink.record_http_error(code);
            return Some(Event::HttpError { code });
        }

        if self.patterns.reconnect.is_match(line) {
            sink.record_reconnect();
            return Some(Event::Reconnect);
        }

        if let Some(c) = self.patterns.segment_failed.captures(line) {
            return Some(Event::SegmentFailed {
                id: c[1].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.segment_skipped.captures(line) {
            return Some(Event::SegmentSkipped {
                id: c[1].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.playlist_failed.captures(line) {
            return Some(Event::PlaylistFailed {
                id: c[1].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.segments_expired.captures(line) {
            return Some(Event::SegmentsExpired {
                skip: c[1].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.sequence_change.captures(line) {
            return Some(Event::SequenceChange {
                old: c[1].parse().unwrap_or(0),
                new: c[2].parse().unwrap_or(0),
            });
        }

        if let Some(c) = self.patterns.bandwidth.captures(line) {
            return Some(Event::ManifestBandwidth {
                bps: c[1].parse().unwrap_or(0),
            });
        }

        None
    }

    /// Record (or rebind) an in-flight request, finalizing whichever
    /// distinct filename was previously the most recently opened one.
    ///
    /// Identity is by extracted filename, never by timing — a historical
    /// defect used a 1ms wall-time guard to distinguish "same request" from
    /// "new request", which dropped legitimate fast completions. Filename
    /// equality is the only discriminator.
    fn open(&self, url_or_path: &str, now: Instant, sink: &dyn EventSink, kind: UrlKind) {
        let name = basename(url_or_path).to_string();

        if let Some(prev) = self.inflight.get(&name) {
            let started_at = *prev;
            drop(prev);
            // Same-segment rebind: update timestamp only, no completion.
            self.inflight.insert(name, now);
            let _ = started_at; // rebind does not emit a latency sample
            return;
        }

        let previous = self.current.lock().replace((name.clone(), kind));
        if let Some((prev_name, prev_kind)) = previous {
            if prev_name != name {
                self.complete(&prev_name, sink, prev_kind);
            }
        }
        self.inflight.insert(name, now);
    }

    /// Explicitly complete an in-flight request by filename: on the next
    /// distinct filename's opening, or directly when a caller observes an
    /// end-of-statistics line. Feeds the inferred latency into the sink
    /// and credits segment bytes and throughput via the size cache join.
    pub fn complete(&self, filename: &str, sink: &dyn EventSink, kind: UrlKind) {
        if let Some((_, started_at)) = self.inflight.remove(filename) {
            let latency = Instant::now().saturating_duration_since(started_at);
            sink.observe_inferred_latency(kind, latency);
            if kind == UrlKind::Segment {
                if let Some(size) = self.size_lookup.size_of(filename) {
                    sink.credit_segment_bytes(size);
                    sink.credit_segment_throughput(size, latency);
                }
            }
        }
    }

    /// Sweep in-flight entries older than the hanging-request TTL
    /// (default 60s).
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let ttl = self.ttl;
        self.inflight
            .retain(|_, started_at| now.saturating_duration_since(*started_at) < ttl);
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct TestSink {
        requests: AtomicU64,
        http_errors: AtomicU64,
        timeouts: AtomicU64,
        reconnects: AtomicU64,
        segment_bytes: AtomicU64,
        throughput_samples: AtomicU64,
    }

    impl EventSink for TestSink {
        fn record_request(&self, _kind: UrlKind) {
            self.requests.fetch_add(1, Ordering::Relaxed);
        }
        fn record_http_error(&self, _code: u16) {
            self.http_errors.fetch_add(1, Ordering::Relaxed);
        }
        fn record_timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
        fn record_reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        fn observe_inferred_latency(&self, _kind: UrlKind, _latency: Duration) {}
        fn credit_segment_bytes(&self, bytes: u64) {
            self.segment_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        fn credit_segment_throughput(&self, _bytes: u64, _wall_time: Duration) {
            self.throughput_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct TestSizeLookup;
    impl SegmentSizeLookup for TestSizeLookup {
        fn size_of(&self, filename: &str) -> Option<u64> {
            if filename == "seg00017.ts" {
                Some(123_456)
            } else {
                None
            }
        }
    }

    fn parser() -> EventParser {
        EventParser::new(Duration::from_secs(60), Arc::new(TestSizeLookup))
    }

    #[test]
    fn classifies_manifest_segment_and_unknown() {
        assert_eq!(classify_url("https://cdn/live/stream.m3u8"), UrlKind::Manifest);
        assert_eq!(classify_url("https://cdn/live/seg00017.ts?auth=1"), UrlKind::Segment);
        assert_eq!(classify_url("https://cdn/live/whatever"), UrlKind::Unknown);
    }

    #[test]
    fn classifies_init_segment_before_generic_mp4() {
        assert_eq!(classify_url("https://cdn/live/init.mp4"), UrlKind::Init);
        assert_eq!(classify_url("https://cdn/live/chunk_1.m4s"), UrlKind::Segment);
    }

    #[test]
    fn parses_hls_request_line() {
        let p = parser();
        let sink = TestSink::default();
        let event = p
            .parse_line(&sink, "[hls @ 0x1234] HLS request for url 'https://cdn/seg1.ts', offset 0, playlist 5")
            .unwrap();
        match event {
            Event::HlsRequest { url, kind } => {
                assert_eq!(url, "https://cdn/seg1.ts");
                assert_eq!(kind, UrlKind::Segment);
            }
            _ => panic!("wrong event"),
        }
        assert_eq!(sink.requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn keep_alive_joins_on_basename() {
        let p = parser();
        let sink = TestSink::default();
        p.parse_line(&sink, "[http @ 0x1] Opening 'https://cdn/seg00017.ts' for reading");
        assert_eq!(p.inflight_count(), 1);

        p.parse_line(&sink, "[http @ 0x1] request: GET /live/seg00018.ts HTTP/1.1");
        assert_eq!(sink.segment_bytes.load(Ordering::Relaxed), 123_456);
        assert_eq!(p.inflight_count(), 1, "the new open finalized the previous entry");

        p.complete("seg00018.ts", &sink, UrlKind::Segment);
        assert_eq!(p.inflight_count(), 0);
    }

    #[test]
    fn a_distinct_opening_autocompletes_the_prior_entry() {
        let p = parser();
        let sink = TestSink::default();
        p.open("https://cdn/seg00017.ts", Instant::now(), &sink, UrlKind::Segment);
        p.open("https://cdn/seg00018.ts", Instant::now(), &sink, UrlKind::Segment);

        assert_eq!(sink.segment_bytes.load(Ordering::Relaxed), 123_456);
        assert_eq!(sink.throughput_samples.load(Ordering::Relaxed), 1);
        assert_eq!(p.inflight_count(), 1, "only the still-open seg00018 entry remains");
    }

    #[test]
    fn repeated_opening_of_same_segment_is_a_rebind_not_a_new_entry() {
        let p = parser();
        let sink = TestSink::default();
        p.open("https://cdn/seg1.ts", Instant::now(), &sink, UrlKind::Segment);
        assert_eq!(p.inflight_count(), 1);
        p.open("https://cdn/seg1.ts", Instant::now(), &sink, UrlKind::Segment);
        assert_eq!(p.inflight_count(), 1, "rebind must not create a second entry");
    }

    #[test]
    fn http_error_and_reconnect_counters() {
        let p = parser();
        let sink = TestSink::default();
        p.parse_line(&sink, "[http @ 0x1] HTTP error 404 Not Found");
        p.parse_line(&sink, "Will reconnect at 12:00:00 in 2 second(s)");
        assert_eq!(sink.http_errors.load(Ordering::Relaxed), 1);
        assert_eq!(sink.reconnects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sweep_expires_hanging_requests() {
        let p = EventParser::new(Duration::from_millis(1), Arc::new(TestSizeLookup));
        let sink = TestSink::default();
        p.open("https://cdn/seg1.ts", Instant::now(), &sink, UrlKind::Segment);
        std::thread::sleep(Duration::from_millis(5));
        p.sweep_expired();
        assert_eq!(p.inflight_count(), 0);
    }

    #[test]
    fn sequence_change_and_bandwidth_parse() {
        let p = parser();
        let sink = TestSink::default();
        let ev = p
            .parse_line(&sink, "[hls @ 0x1] Media sequence change (10 -> 15)")
            .unwrap();
        assert!(matches!(ev, Event::SequenceChange { old: 10, new: 15 }));

        let ev = p.parse_line(&sink, "BANDWIDTH=2500000").unwrap();
        assert!(matches!(ev, Event::ManifestBandwidth { bps: 2_500_000 }));
    }
}
