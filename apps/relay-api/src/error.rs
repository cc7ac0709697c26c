use pairchat_common::StoreError;
use thiserror::Error;

use crate::push::PushError;

/// Failures on the relay's side paths (push fallback, store mirrors).
///
/// None of these ever reach a relay client: routing carries on regardless and
/// the error is only logged where the side task finishes.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("recipient {0} has no user document")]
    RecipientNotFound(String),
    #[error("recipient {0} has no push token")]
    NoDeviceToken(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Push(#[from] PushError),
}
