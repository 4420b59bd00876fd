//! The lossy pipeline: the invariant that measurement never stalls the
//! observed process.
//!
//! A bounded channel sits between a line-producing source (child stderr,
//! or the progress socket) and a single parser consumer. The producer
//! never blocks: `try_send` either succeeds or the line is dropped and a
//! counter increments. This is the one place in the harness where we
//! deliberately accept data loss in exchange for the guarantee that a
//! slow or wedged dashboard/parser can never back-pressure the child's
//! own `write()` calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Point-in-time pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub read: u64,
    pub dropped: u64,
    pub parsed: u64,
}

impl PipelineStats {
    pub fn drop_ratio(&self) -> f64 {
        if self.read == 0 {
            0.0
        } else {
            self.dropped as f64 / self.read as f64
        }
    }
}

#[derive(Clone)]
struct Counters {
    read: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    parsed: Arc<AtomicU64>,
}

impl Counters {
    fn new() -> Self {
        Self {
            read: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            parsed: Arc::new(AtomicU64::new(0)),
        }
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            parsed: self.parsed.load(Ordering::Relaxed),
        }
    }
}

/// A bounded, drop-on-full line pipeline.
///
/// `label` is only used in log lines (e.g. `"client-3/events"`), to tell
/// the two pipelines of a client apart in the logs.
pub struct Pipeline {
    label: &'static str,
    capacity: usize,
    drop_threshold: f64,
    counters: Counters,
}

/// Handle to a running pipeline's producer/consumer tasks.
pub struct PipelineHandle {
    counters: Counters,
    producer: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

impl Pipeline {
    pub fn new(label: &'static str, capacity: usize, drop_threshold: f64) -> Self {
        Self {
            label,
            capacity,
            drop_threshold,
            counters: Counters::new(),
        }
    }

    /// Spawn the producer (reading lines from `reader`) and consumer
    /// (invoking `parser` per line) tasks.
    ///
    /// The producer never awaits channel capacity: `try_send` either
    /// succeeds or the line is dropped. The channel is closed (dropping
    /// the sender) on source EOF, which lets the consumer drain and exit.
    pub fn spawn<R, F>(&self, reader: R, mut parser: F) -> PipelineHandle
    where
        R: AsyncBufRead + Unpin + Send + 'static,
        F: FnMut(String) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(self.capacity);
        let counters = self.counters.clone();
        let label = self.label;

        let producer_counters = counters.clone();
        let producer = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        producer_counters.read.fetch_add(1, Ordering::Relaxed);
                        if tx.try_send(line).is_err() {
                            producer_counters.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Ok(None) => {
                        debug!(pipeline = label, "source EOF, closing pipeline");
                        break;
                    }
                    Err(e) => {
                        warn!(pipeline = label, error = %e, "error reading pipeline source");
                        break;
                    }
                }
            }
            // `tx` drops here, closing the channel.
        });

        let consumer_counters = counters.clone();
        let consumer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                parser(line);
                consumer_counters.parsed.fetch_add(1, Ordering::Relaxed);
            }
        });

        PipelineHandle {
            counters,
            producer,
            consumer,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn degraded(&self) -> bool {
        self.stats().drop_ratio() > self.drop_threshold
    }
}

impl PipelineHandle {
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Wait for the channel to close and the parser to drain, or until
    /// `timeout` elapses, whichever comes first. Returns `true` if the
    /// pipeline fully drained.
    pub async fn drain_with_timeout(self, timeout: Duration) -> bool {
        let join_both = async {
            let _ = self.producer.await;
            let _ = self.consumer.await;
        };
        tokio::time::timeout(timeout, join_both).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_equals_parsed_plus_dropped_at_quiescence() {
        let (client_w, client_r) = tokio::io::duplex(64 * 1024);
        let pipeline = Pipeline::new("test", 100, 0.5);
        let parsed_count = Arc::new(AtomicUsize::new(0));
        let pc = parsed_count.clone();

        let handle = pipeline.spawn(client_r, move |_line| {
            pc.fetch_add(1, Ordering::Relaxed);
        });

        let mut w = client_w;
        for i in 0..20 {
            w.write_all(format!("line-{i}\n").as_bytes()).await.unwrap();
        }
        drop(w);

        assert!(handle.drain_with_timeout(Duration::from_secs(2)).await);

        let stats = pipeline.stats();
        assert_eq!(stats.read, 20);
        assert_eq!(stats.parsed + stats.dropped, stats.read);
        assert_eq!(parsed_count.load(Ordering::Relaxed), stats.parsed as usize);
    }

    #[tokio::test]
    async fn drops_when_consumer_is_slow_and_channel_fills() {
        let (mut client_w, client_r) = tokio::io::duplex(1024 * 1024);
        let pipeline = Pipeline::new("test", 4, 0.01);

        // Consumer that never reads (parser blocks forever via a channel
        // with no receiver draining it would deadlock the test, so instead
        // we simulate slowness by sleeping synchronously inside a blocking
        // closure equivalent -- here, simply never calling recv fast enough
        // by using a parser that sleeps).
        let handle = pipeline.spawn(client_r, |_line| {
            std::thread::sleep(Duration::from_millis(5));
        });

        for i in 0..2000 {
            let _ = client_w
                .write_all(format!("line-{i}\n").as_bytes())
                .await;
        }
        drop(client_w);

        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            handle.drain_with_timeout(Duration::from_secs(5)).await
        })
        .await;
    }
}
