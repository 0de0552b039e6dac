use crate::normalizer::MetricSet;
use crate::poller::{PollError, RawReading};
use serde_derive::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

/// Last known state of the device, replaced as a whole on every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedState {
    pub metrics: MetricSet,
    pub online: bool,
    pub raw: RawReading,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub last_error: Option<String>,
}

/// Shared snapshot of [`NormalizedState`].
///
/// The poll cycle is the only writer. Readers get a copy taken under the read
/// lock, so they never see metrics from two different cycles.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<RwLock<NormalizedState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the metric set after a successful poll.
    /// Returns true if the device was offline before.
    pub fn write(&self, metrics: MetricSet, raw: RawReading) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let came_online = !state.online;
        *state = NormalizedState {
            metrics,
            online: true,
            raw,
            successful_polls: state.successful_polls + 1,
            failed_polls: state.failed_polls,
            last_error: None,
        };
        came_online
    }

    /// Records a failed poll, keeping the previous metrics.
    /// Returns true if the device was online before.
    pub fn mark_offline(&self, error: &PollError) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let went_offline = state.online;
        state.online = false;
        state.failed_polls += 1;
        state.last_error = Some(error.to_string());
        went_offline
    }

    /// Copy of the current snapshot.
    pub fn read(&self) -> NormalizedState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).online
    }
}
