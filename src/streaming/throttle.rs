// Minimum-interval emission gate
//
// Given a maximum rate r (Hz), a frame is accepted only if at least 1000/r ms
// have passed since the last accepted frame. Rejected frames are dropped,
// never queued.

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    min_interval_ms: Option<f64>,
    last_accepted_at: Option<f64>,
}

impl RateLimiter {
    /// `None`, zero, negative or non-finite rates disable throttling
    pub fn new(max_emit_hz: Option<f64>) -> Self {
        let min_interval_ms = max_emit_hz
            .filter(|hz| hz.is_finite() && *hz > 0.0)
            .map(|hz| 1000.0 / hz);

        Self {
            min_interval_ms,
            last_accepted_at: None,
        }
    }

    pub fn is_throttling(&self) -> bool {
        self.min_interval_ms.is_some()
    }

    pub fn min_interval_ms(&self) -> Option<f64> {
        self.min_interval_ms
    }

    /// Decide whether a frame arriving at `now_ms` may be emitted
    pub fn accept(&mut self, now_ms: f64) -> bool {
        let Some(interval) = self.min_interval_ms else {
            return true;
        };

        if let Some(last) = self.last_accepted_at {
            if now_ms - last < interval {
                return false;
            }
        }

        self.last_accepted_at = Some(now_ms);
        true
    }

    pub fn reset(&mut self) {
        self.last_accepted_at = None;
    }
}
