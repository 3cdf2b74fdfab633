//! The guarded counter owned by a single server instance.

use crate::{Result, TallyError};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A signed 64-bit counter behind a mutex.
///
/// The value is only reachable through `add` and `get`, both of which hold
/// the lock for the duration of the access.
#[derive(Debug, Default)]
pub struct CounterState {
    value: Mutex<i64>,
}

impl CounterState {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` and return the resulting value.
    ///
    /// Overflow is rejected and leaves the counter unchanged.
    pub fn add(&self, amount: i64) -> Result<i64> {
        let mut value = self.lock();
        let next = value
            .checked_add(amount)
            .ok_or(TallyError::CounterOverflow {
                current: *value,
                amount,
            })?;
        *value = next;
        Ok(next)
    }

    /// Read the current value.
    pub fn get(&self) -> i64 {
        *self.lock()
    }

    // The guarded section never panics, so a poisoned lock still holds a
    // consistent value.
    fn lock(&self) -> MutexGuard<'_, i64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_zero() {
        assert_eq!(CounterState::new().get(), 0);
    }

    #[test]
    fn test_add_returns_running_total() {
        let counter = CounterState::new();
        assert_eq!(counter.add(1).unwrap(), 1);
        assert_eq!(counter.add(2).unwrap(), 3);
        assert_eq!(counter.add(-10).unwrap(), -7);
        assert_eq!(counter.get(), -7);
    }

    #[test]
    fn test_overflow_is_rejected_without_mutation() {
        let counter = CounterState::new();
        counter.add(i64::MAX).unwrap();

        let err = counter.add(1).unwrap_err();
        assert!(matches!(
            err,
            TallyError::CounterOverflow {
                current: i64::MAX,
                amount: 1
            }
        ));
        assert_eq!(counter.get(), i64::MAX);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let counter = Arc::new(CounterState::new());
        let handles: Vec<_> = (1..=16)
            .map(|n| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.add(n).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected: i64 = (1..=16).map(|n| n * 1000).sum();
        assert_eq!(counter.get(), expected);
    }
}
