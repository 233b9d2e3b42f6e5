//! Counting admission gate with a shrinkable ceiling.
//!
//! Epistemic foundation:
//! - K_i: At most `capacity` admissions are held at once
//! - K_i: An admission is released on drop, whatever the task outcome
//! - I^B: Backend capacity is discovered late → the ceiling can only shrink

use crate::models::{EvalError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Wait for a free slot.
    pub async fn admit(self: &Arc<Self>) -> Result<Admission> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| EvalError::Internal("Semaphore closed".to_string()))?;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        Ok(Admission {
            _permit: permit,
            gate: Arc::clone(self),
            capacity: self.capacity(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of admissions held at once so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Halve the ceiling if it is still `observed`; returns the ceiling afterwards.
    ///
    /// Several tasks refused at the same ceiling shrink it once. Callers must not
    /// hold an admission while shrinking.
    pub async fn shrink_from(&self, observed: usize) -> Result<usize> {
        let target = (observed / 2).max(1);
        if target == observed
            || self
                .capacity
                .compare_exchange(observed, target, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Ok(self.capacity());
        }

        let removed = (observed - target) as u32;
        let permits = Arc::clone(&self.semaphore)
            .acquire_many_owned(removed)
            .await
            .map_err(|_| EvalError::Internal("Semaphore closed".to_string()))?;
        permits.forget();
        info!(from = observed, to = target, "Shrunk admission ceiling");
        Ok(target)
    }
}

/// A held slot; released on drop.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    gate: Arc<AdmissionGate>,
    capacity: usize,
}

impl Admission {
    /// Ceiling in force when this slot was granted.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_admissions_bounded_and_released() {
        let gate = AdmissionGate::new(2);
        let first = gate.admit().await.unwrap();
        let _second = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        let waiting = tokio::time::timeout(Duration::from_millis(20), gate.admit()).await;
        assert!(waiting.is_err());

        drop(first);
        let _third = gate.admit().await.unwrap();
        assert_eq!(gate.in_flight(), 2);
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test]
    async fn test_shrink_once_per_observed_ceiling() {
        let gate = AdmissionGate::new(8);
        assert_eq!(gate.shrink_from(8).await.unwrap(), 4);
        assert_eq!(gate.shrink_from(8).await.unwrap(), 4);
        assert_eq!(gate.shrink_from(4).await.unwrap(), 2);
        assert_eq!(gate.shrink_from(2).await.unwrap(), 1);
        assert_eq!(gate.shrink_from(1).await.unwrap(), 1);

        let _only = gate.admit().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), gate.admit()).await;
        assert!(waiting.is_err());
    }
}
