// =============================================================================
// Clock — injectable time source and sleeper
// =============================================================================
//
// Every timed decision in the engine (cooldown gating, retry delays,
// subscription throttling) goes through this trait so tests can run against
// virtual time and assert on the sleeps that were requested.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    /// Current Unix time in seconds.
    fn now(&self) -> i64;

    async fn sleep(&self, duration: Duration);
}

/// Wall-clock time with Tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_records_and_advances() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_secs(5)).await;
        clock.sleep(Duration::from_millis(500)).await;
        assert_eq!(clock.now(), 1_005);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(5), Duration::from_millis(500)]
        );
    }
}
