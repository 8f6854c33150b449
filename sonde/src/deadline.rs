//! Wall-clock bounds for blocking I/O.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A point in time after which an operation is abandoned.
///
/// Every blocking call bounds its own timeout by [`Deadline::bound`], so an invocation never runs
/// past its overall deadline even though each step has its own, finer timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline {
            at: Instant::now() + timeout,
        }
    }

    /// Time left until the deadline, or a timeout error naming `what` if it has passed.
    pub fn remaining(&self, what: &str) -> Result<Duration> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(Error::Timeout(what.to_string()));
        }
        Ok(left)
    }

    /// The smaller of `step` and the time left.
    pub fn bound(&self, step: Duration, what: &str) -> Result<Duration> {
        Ok(self.remaining(what)?.min(step))
    }

    /// The earlier of this deadline and one `step` from now.
    pub fn nested(&self, step: Duration) -> Deadline {
        Deadline {
            at: self.at.min(Instant::now() + step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(matches!(deadline.remaining("reading"), Err(Error::Timeout(w)) if w == "reading"));
    }

    #[test]
    fn bounds() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let step = deadline.bound(Duration::from_secs(2), "writing").unwrap();
        assert_eq!(step, Duration::from_secs(2));

        let nested = deadline.nested(Duration::from_millis(10));
        assert!(nested.remaining("x").unwrap() <= Duration::from_millis(10));
    }
}
