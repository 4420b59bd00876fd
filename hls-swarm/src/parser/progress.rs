//! Progress parser: consumes `key=value` blocks terminated by
//! `progress=continue|end`.

use std::time::{Duration, Instant};

/// Terminal marker of a progress block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Continue,
    End,
}

/// One completed progress block.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub total_size: Option<i64>,
    pub out_time_us: Option<i64>,
    pub speed: Option<f64>,
    pub progress: ProgressState,
    pub received_at: Instant,
}

impl ProgressUpdate {
    pub fn is_end(&self) -> bool {
        matches!(self.progress, ProgressState::End)
    }

    /// `0 < speed < threshold` is the stalling signal; `speed == threshold`
    /// is NOT stalling.
    pub fn is_stalling(&self, threshold: f64) -> bool {
        self.speed.is_some_and(|s| s > 0.0 && s < threshold)
    }

    pub fn out_time(&self) -> Option<Duration> {
        self.out_time_us
            .map(|us| Duration::from_micros(us.max(0) as u64))
    }
}

/// Incremental block builder. One instance per client's progress channel.
#[derive(Default)]
pub struct ProgressParser {
    total_size: Option<i64>,
    out_time_us: Option<i64>,
    speed: Option<f64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `key=value` line. Returns `Some(update)` when the line
    /// was the terminating `progress=continue|end` marker of a block.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        let (key, value) = line.split_once('=')?;
        let key = key.trim();
        let value = value.trim();

        match key {
            "total_size" => {
                if value != "N/A" {
                    self.total_size = value.parse().ok();
                }
                None
            }
            "out_time_us" => {
                if value != "N/A" {
                    self.out_time_us = value.parse().ok();
                }
                None
            }
            "speed" => {
                if value != "N/A" {
                    self.speed = value.trim_end_matches('x').parse().ok();
                }
                None
            }
            "progress" => {
                let state = match value {
                    "continue" => ProgressState::Continue,
                    "end" => ProgressState::End,
                    _ => return None,
                };
                let update = ProgressUpdate {
                    total_size: self.total_size.take(),
                    out_time_us: self.out_time_us.take(),
                    speed: self.speed.take(),
                    progress: state,
                    received_at: Instant::now(),
                };
                Some(update)
            }
            // Unknown keys are ignored silently.
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_block(parser: &mut ProgressParser, lines: &[&str]) -> ProgressUpdate {
        let mut last = None;
        for line in lines {
            last = parser.feed_line(line);
        }
        last.expect("block should terminate with a progress= line")
    }

    #[test]
    fn every_key_in_block_is_reflected() {
        let mut parser = ProgressParser::new();
        let update = feed_block(
            &mut parser,
            &[
                "total_size=5000000",
                "out_time_us=1200000",
                "speed=1.02x",
                "progress=continue",
            ],
        );
        assert_eq!(update.total_size, Some(5_000_000));
        assert_eq!(update.out_time_us, Some(1_200_000));
        assert_eq!(update.speed, Some(1.02));
        assert!(!update.is_end());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut parser = ProgressParser::new();
        let update = feed_block(
            &mut parser,
            &["bitrate=128kbits/s", "frame=120", "progress=end"],
        );
        assert_eq!(update.total_size, None);
        assert!(update.is_end());
    }

    #[test]
    fn na_values_are_ignored() {
        let mut parser = ProgressParser::new();
        let update = feed_block(
            &mut parser,
            &["total_size=N/A", "speed=N/A", "progress=continue"],
        );
        assert_eq!(update.total_size, None);
        assert_eq!(update.speed, None);
    }

    #[test]
    fn speed_exactly_threshold_is_not_stalling() {
        let mut parser = ProgressParser::new();
        let update = feed_block(&mut parser, &["speed=0.9x", "progress=continue"]);
        assert!(!update.is_stalling(0.9));
    }

    #[test]
    fn speed_below_threshold_is_stalling() {
        let mut parser = ProgressParser::new();
        let update = feed_block(&mut parser, &["speed=0.5x", "progress=continue"]);
        assert!(update.is_stalling(0.9));
    }

    #[test]
    fn builder_resets_between_blocks() {
        let mut parser = ProgressParser::new();
        let first = feed_block(&mut parser, &["total_size=100", "progress=continue"]);
        assert_eq!(first.total_size, Some(100));

        let second = feed_block(&mut parser, &["progress=continue"]);
        assert_eq!(second.total_size, None, "block must not leak into the next");
    }
}
