use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Token bucket shared by every HTTP transfer of one orchestrator, so the
/// limit applies to the aggregate rate rather than per task.
#[derive(Debug)]
pub struct BandwidthLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        Self {
            rate,
            burst: rate * 2.0,
            bucket: Mutex::new(Bucket {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.rate as u64
    }

    /// Waits until `amount` bytes may be written. Requests larger than the
    /// burst size are admitted once the bucket is full.
    pub async fn consume(&self, amount: usize) {
        let wanted = (amount as f64).min(self.burst);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.refilled_at.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.refilled_at = Instant::now();

                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    return;
                }
                ((wanted - bucket.tokens) / self.rate).max(0.01)
            };
            sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_tokens_are_available_immediately() {
        let limiter = BandwidthLimiter::new(1_000_000);
        let start = Instant::now();
        limiter.consume(500_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exhausted_bucket_delays_consumers() {
        let limiter = BandwidthLimiter::new(10_000);
        limiter.consume(10_000).await;
        let start = Instant::now();
        limiter.consume(1_000).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
