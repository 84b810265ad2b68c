//! Sleep and monotonic clock bridges.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::block_on::wait_for;
use crate::bridge::{NowBridge, SleepBridge};

/// Largest value the engine can represent as a signed 31-bit integer; clock
/// readings wrap at this bound.
const CLOCK_WRAP: u64 = 2_147_483_647;

/// Host sleep capability.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Blanket implementation for async closures.
#[async_trait]
impl<F, Fut> Sleeper for F
where
    F: Fn(Duration) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn sleep(&self, duration: Duration) {
        self(duration).await;
    }
}

/// Host clock: milliseconds on some monotonic scale.
pub(crate) type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

static CLOCK_ANCHOR: LazyLock<Instant> = LazyLock::new(Instant::now);

fn monotonic_ms() -> u64 {
    CLOCK_ANCHOR.elapsed().as_millis() as u64
}

fn default_sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    let bridged = wait_for(async move {
        tokio::time::sleep(duration).await;
        Ok(())
    });
    if bridged.is_err() {
        // No blocking-wait support here; busy-poll the monotonic clock.
        let start = Instant::now();
        while start.elapsed() < duration {
            std::thread::yield_now();
        }
    }
}

/// Build the sleep bridge closure for one engine call.
///
/// The bridge never raises: failures in a configured sleeper come back as an
/// error string, success as an empty string.
pub(crate) fn make_sleep_bridge(sleeper: Option<Arc<dyn Sleeper>>) -> SleepBridge {
    Arc::new(move |duration_ms: u64| {
        let duration = Duration::from_millis(duration_ms);
        match &sleeper {
            Some(custom) => {
                let custom = Arc::clone(custom);
                match wait_for(async move {
                    custom.sleep(duration).await;
                    Ok(())
                }) {
                    Ok(()) => String::new(),
                    Err(error) => error.to_string(),
                }
            }
            None => {
                default_sleep(duration);
                String::new()
            }
        }
    })
}

/// Build the clock bridge closure for one engine call.
///
/// Readings are clamped into a positive 31-bit range so the engine's integer
/// representation cannot overflow.
pub(crate) fn make_now_bridge(clock: Option<Clock>) -> NowBridge {
    Arc::new(move || {
        let millis = match &clock {
            Some(clock) => clock(),
            None => monotonic_ms(),
        };
        (millis % CLOCK_WRAP) as i64
    })
}
