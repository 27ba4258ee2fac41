use crate::util::error::LogError;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Default)]
struct FenceState {
    active: Option<u64>,
    last_epoch: Option<u64>,
}

/// Append fence raised by the caller before a flashback.
///
/// At most one fence is up at a time and fence epochs never go backward.
#[derive(Debug, Default)]
pub struct EpochFence {
    state: Mutex<FenceState>,
}

impl EpochFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fence(&self, epoch: u64) -> Result<(), FenceError> {
        let mut state = self.state.lock();
        if let Some(current_epoch) = state.active {
            return Err(FenceError::FenceInProgress { current_epoch });
        }
        if let Some(latest) = state.last_epoch {
            if epoch < latest {
                return Err(FenceError::StaleEpoch {
                    latest,
                    observed: epoch,
                });
            }
        }
        state.active = Some(epoch);
        state.last_epoch = Some(epoch);
        Ok(())
    }

    pub fn lift(&self, epoch: u64) -> Result<(), FenceError> {
        let mut state = self.state.lock();
        ensure_epoch(&state, epoch)?;
        state.active = None;
        Ok(())
    }

    /// Epoch of the fence currently up.
    pub fn current(&self) -> Option<u64> {
        self.state.lock().active
    }

    pub fn ensure(&self, epoch: u64) -> Result<(), FenceError> {
        ensure_epoch(&self.state.lock(), epoch)
    }
}

fn ensure_epoch(state: &FenceState, epoch: u64) -> Result<(), FenceError> {
    match state.active {
        None => Err(FenceError::NoFence),
        Some(expected) if expected != epoch => Err(FenceError::EpochMismatch {
            expected,
            observed: epoch,
        }),
        Some(_) => Ok(()),
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FenceError {
    #[error("fence already up at epoch {current_epoch}")]
    FenceInProgress { current_epoch: u64 },
    #[error("no active fence")]
    NoFence,
    #[error("fence epoch mismatch: expected {expected}, observed {observed}")]
    EpochMismatch { expected: u64, observed: u64 },
    #[error("stale fence epoch {observed}, latest is {latest}")]
    StaleEpoch { latest: u64, observed: u64 },
}

impl From<FenceError> for LogError {
    fn from(err: FenceError) -> Self {
        LogError::StateNotMatch(err.to_string())
    }
}
