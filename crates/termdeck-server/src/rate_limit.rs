use std::time::Instant;

/// Frames a socket may send in one burst.
pub const INPUT_BURST: u32 = 200;
/// Sustained frames per second once the burst is spent.
pub const INPUT_REFILL_PER_SEC: f64 = 100.0;

/// Token bucket guarding one socket's inbound frames.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// - `capacity`: max burst size
    /// - `refill_per_sec`: tokens added per second
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn for_input() -> Self {
        Self::new(INPUT_BURST, INPUT_REFILL_PER_SEC)
    }

    /// Try to consume one token. Returns `true` if allowed.
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
