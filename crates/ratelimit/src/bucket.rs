//! Fixed-window request counter packed into one atomic word.
//!
//! Layout: high 32 bits = window index (truncated), low 32 bits = requests
//! admitted in that window. Every admission is a single compare-and-swap, so
//! concurrent callers on the same key can never admit more than the budget.

use std::sync::atomic::{AtomicU64, Ordering};

/// Result of one [`WindowCounter::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Window the request was counted against. Ahead of the caller's window
    /// when another caller already moved the counter forward.
    pub window: u64,
    /// Budget left after this request; `None` when refused
    pub remaining: Option<u32>,
}

#[derive(Debug, Default)]
pub struct WindowCounter {
    state: AtomicU64,
}

fn pack(window: u32, count: u32) -> u64 {
    ((window as u64) << 32) | count as u64
}

fn unpack(state: u64) -> (u32, u32) {
    ((state >> 32) as u32, state as u32)
}

impl WindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one request in `window` if fewer than `limit` were admitted.
    ///
    /// On refusal the counter is left untouched.
    pub fn try_acquire(&self, window: u64, limit: u32) -> Admission {
        let full = window;
        let window = window as u32;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let (stored, count) = unpack(current);
            // A caller with a slightly older clock counts against the newer window.
            let (target, used) = if stored == window {
                (window, count)
            } else if current != 0 && (window.wrapping_sub(stored) as i32) < 0 {
                (stored, count)
            } else {
                (window, 0)
            };

            let counted = full + target.wrapping_sub(window) as u64;

            if used >= limit {
                return Admission {
                    window: counted,
                    remaining: None,
                };
            }

            let next = pack(target, used + 1);
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return Admission {
                        window: counted,
                        remaining: Some(limit - used - 1),
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Requests admitted in `window` so far.
    pub fn used(&self, window: u64) -> u32 {
        let (stored, count) = unpack(self.state.load(Ordering::Acquire));
        if stored == window as u32 { count } else { 0 }
    }

    /// Whether the counter holds nothing for `window` or later.
    pub fn is_stale(&self, window: u64) -> bool {
        let state = self.state.load(Ordering::Acquire);
        let (stored, _) = unpack(state);
        state == 0 || ((window as u32).wrapping_sub(stored) as i32) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left(c: &WindowCounter, window: u64, limit: u32) -> Option<u32> {
        c.try_acquire(window, limit).remaining
    }

    #[test]
    fn admits_exactly_limit_per_window() {
        let c = WindowCounter::new();
        assert_eq!(left(&c, 7, 3), Some(2));
        assert_eq!(left(&c, 7, 3), Some(1));
        assert_eq!(left(&c, 7, 3), Some(0));
        assert_eq!(left(&c, 7, 3), None);
        assert_eq!(c.used(7), 3);

        // Next window starts fresh
        assert_eq!(left(&c, 8, 3), Some(2));
        assert_eq!(c.used(8), 1);
    }

    #[test]
    fn refusal_does_not_consume() {
        let c = WindowCounter::new();
        assert_eq!(left(&c, 1, 1), Some(0));
        for _ in 0..10 {
            assert_eq!(left(&c, 1, 1), None);
        }
        assert_eq!(c.used(1), 1);
    }

    #[test]
    fn zero_limit_never_admits() {
        let c = WindowCounter::new();
        assert_eq!(left(&c, 1, 0), None);
        assert!(c.is_stale(1));
    }

    #[test]
    fn older_clock_counts_against_current_window() {
        let c = WindowCounter::new();
        assert_eq!(left(&c, 10, 2), Some(1));
        assert_eq!(
            c.try_acquire(9, 2),
            Admission {
                window: 10,
                remaining: Some(0)
            }
        );
        assert_eq!(left(&c, 10, 2), None);
    }

    #[test]
    fn refusal_reports_the_window_it_was_counted_against() {
        let c = WindowCounter::new();
        assert_eq!(left(&c, 1_000, 1), Some(0));
        assert_eq!(
            c.try_acquire(999, 1),
            Admission {
                window: 1_000,
                remaining: None
            }
        );
        assert_eq!(c.try_acquire(1_000, 1).window, 1_000);
        assert_eq!(c.try_acquire(1_001, 1).window, 1_001);
    }

    #[test]
    fn staleness() {
        let c = WindowCounter::new();
        c.try_acquire(5, 10);
        assert!(!c.is_stale(5));
        assert!(c.is_stale(6));
    }
}
