//! Reconcile errors.

use gamefleet_ports::PortError;
use thiserror::Error;

use crate::address::AddressError;
use crate::store::StoreError;

/// Failure of a single reconcile; the controller retries it with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Address(#[from] AddressError),
}

impl ReconcileError {
    /// Whether a later attempt can succeed without outside intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Store(err) => err.is_retryable(),
            ReconcileError::Ports(err) => err.is_retryable(),
            ReconcileError::Address(err) => err.is_retryable(),
        }
    }
}
