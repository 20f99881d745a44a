use std::time::{Duration, Instant};

/// Paces a loop to a fixed rate, e.g. rendering at `render_fps`.
#[derive(Clone, Debug)]
pub struct RateTimer {
    interval: Duration,
    last: Instant,
}

impl RateTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// Non-positive or non-finite rates never wait.
    pub fn from_hz(hz: f64) -> Self {
        let interval = if hz.is_finite() && hz > 0.0 {
            Duration::from_secs_f64(1.0 / hz)
        } else {
            Duration::ZERO
        };
        Self::new(interval)
    }

    pub fn wait_until_ready(&mut self) {
        let passed = self.last.elapsed();
        if passed < self.interval {
            std::thread::sleep(self.interval - passed);
        }
        self.ready();
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        let ready = (now - self.last) >= self.interval;

        if ready {
            self.last += self.interval;
            if self.last < now {
                self.last = now;
            }
        }

        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paces_to_interval() {
        let mut timer = RateTimer::from_hz(100.0);
        let start = Instant::now();
        for _ in 0..3 {
            timer.wait_until_ready();
        }
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_zero_rate_never_waits() {
        let mut timer = RateTimer::from_hz(0.0);
        assert!(timer.ready());
        assert!(timer.ready());
    }
}
