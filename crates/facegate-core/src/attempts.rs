/// Failed end-to-end cycles allowed before a scan session gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What a recorded failure means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    Retry { remaining: u32 },
    Exhausted,
}

/// Bounded failure counter for one scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLimiter {
    max: u32,
    failures: u32,
}

impl Default for AttemptLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl AttemptLimiter {
    /// A maximum of zero is treated as one.
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            failures: 0,
        }
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.max
    }

    /// Count one failure. The counter never exceeds the maximum.
    pub fn record_failure(&mut self) -> AttemptVerdict {
        self.failures = (self.failures + 1).min(self.max);
        if self.is_exhausted() {
            tracing::warn!(failures = self.failures, max = self.max, "attempt limit reached");
            AttemptVerdict::Exhausted
        } else {
            tracing::debug!(
                failures = self.failures,
                max = self.max,
                "attempt failed; retry allowed"
            );
            AttemptVerdict::Retry {
                remaining: self.remaining(),
            }
        }
    }
}
