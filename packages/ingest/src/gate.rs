//! Admission gate bounding concurrent insertion units.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::PipelineError;

/// Number of insertion units allowed to run at once.
pub const MAX_CONCURRENCY: usize = 5;

/// Counting gate in front of the insertion units.
///
/// Owned by whoever drives the ingestion and passed down explicitly, so
/// independent ingestions in the same process never share slots by
/// accident. Tracks how many units are live and the highest number seen.
#[derive(Debug)]
pub struct AdmissionGate {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

/// Slot held by one insertion unit. Dropping it frees the slot.
#[derive(Debug)]
pub struct Admission {
    live: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Admission {
    fn drop(&mut self) {
        // Runs before the permit field is dropped, so `live` never exceeds
        // the capacity.
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(MAX_CONCURRENCY)
    }
}

impl AdmissionGate {
    /// Creates a gate with `capacity` slots (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AdmissionCancelled`] if `cancel` fires
    /// first (or was already cancelled).
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<Admission, PipelineError> {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(PipelineError::AdmissionCancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| PipelineError::AdmissionCancelled)?
            }
        };

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);

        Ok(Admission {
            live: Arc::clone(&self.live),
            _permit: permit,
        })
    }

    /// Configured number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of units that held a slot at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn sixth_admission_waits_for_a_release() {
        let gate = AdmissionGate::default();
        let cancel = CancellationToken::new();

        let mut held = Vec::new();
        for _ in 0..MAX_CONCURRENCY {
            held.push(gate.admit(&cancel).await.unwrap());
        }
        assert_eq!(gate.in_flight(), 5);

        let blocked = tokio::time::timeout(Duration::from_millis(50), gate.admit(&cancel)).await;
        assert!(blocked.is_err(), "sixth unit must not be admitted");

        held.pop();
        assert_eq!(gate.in_flight(), 4);

        let admitted = tokio::time::timeout(Duration::from_secs(1), gate.admit(&cancel))
            .await
            .expect("slot should be free")
            .unwrap();
        assert_eq!(gate.in_flight(), 5);
        assert_eq!(gate.peak(), 5);

        drop(admitted);
        drop(held);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_fails_admission() {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationToken::new();
        let _only = gate.admit(&cancel).await.unwrap();

        let waiter = {
            let cancel = cancel.clone();
            async move { gate.admit(&cancel).await }
        };
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(waiter, trigger);
        assert!(matches!(result, Err(PipelineError::AdmissionCancelled)));
    }

    #[tokio::test]
    async fn already_cancelled_token_is_rejected_even_with_free_slots() {
        let gate = AdmissionGate::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            gate.admit(&cancel).await,
            Err(PipelineError::AdmissionCancelled)
        ));
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn slot_is_released_when_the_unit_panics() {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationToken::new();

        let admission = gate.admit(&cancel).await.unwrap();
        let result = tokio::task::spawn_blocking(move || {
            let _admission = admission;
            let failed = true;
            assert!(!failed, "insert blew up");
        })
        .await;
        assert!(result.is_err());

        assert_eq!(gate.in_flight(), 0);
        let _again = tokio::time::timeout(Duration::from_secs(1), gate.admit(&cancel))
            .await
            .expect("slot should have been released")
            .unwrap();
    }

    #[test]
    fn zero_capacity_is_clamped() {
        assert_eq!(AdmissionGate::new(0).capacity(), 1);
    }
}
