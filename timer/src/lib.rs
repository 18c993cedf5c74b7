//! Interval pacer for clocking outgoing media frames.
//!
//! A thin policy wrapper over the tokio interval timer: the first tick
//! lands one full period after creation (a frame loop has nothing to send
//! at t=0), and a tick missed because the loop ran long reschedules from
//! the present instead of firing a burst of catch-up frames, which would
//! only stress the peer's jitter buffer.

use std::time::Duration;

use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

pub struct Pacer {
    interval: Interval,
}

impl Pacer {
    pub fn new(period: Duration) -> Pacer {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Pacer { interval }
    }

    /// Wait for the next frame deadline.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_tick_waits_a_period() {
        let mut pacer = Pacer::new(Duration::from_millis(20));
        let start = std::time::Instant::now();
        pacer.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_pacer_ticks() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        let start = std::time::Instant::now();
        for _ in 0..3 {
            pacer.tick().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_missed_ticks_do_not_burst() {
        let mut pacer = Pacer::new(Duration::from_millis(10));
        pacer.tick().await;
        // Oversleep two whole periods; the next two ticks must still be
        // spaced out rather than firing back to back.
        tokio::time::sleep(Duration::from_millis(25)).await;
        pacer.tick().await;
        let start = std::time::Instant::now();
        pacer.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
