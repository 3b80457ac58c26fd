//! Payment processing state and its transition table.
//!
//! `None` is the idle state. Every change to the processing state goes through
//! [`transition`], so an illegal move is rejected in one place.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentProcessingState {
    Loading,
    Verifying,
    Error(String),
    NetworkError(String),
    Success,
    SubscriptionRecovery(String),
}

impl PaymentProcessingState {
    /// Work is outstanding and the state may not be dismissed.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Loading | Self::Verifying)
    }

    pub fn is_dismissible(&self) -> bool {
        !self.is_in_flight()
    }
}

impl fmt::Display for PaymentProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loading => f.write_str("loading"),
            Self::Verifying => f.write_str("verifying"),
            Self::Error(_) => f.write_str("error"),
            Self::NetworkError(_) => f.write_str("network_error"),
            Self::Success => f.write_str("success"),
            Self::SubscriptionRecovery(_) => f.write_str("recovery"),
        }
    }
}

/// Label for an optional state, `idle` when there is none.
pub fn label(state: Option<&PaymentProcessingState>) -> String {
    state.map_or_else(|| "idle".to_string(), ToString::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingEvent {
    /// A purchase was confirmed by the store and verification is starting.
    PurchaseConfirmed,
    /// The payment token request has been handed to the backend.
    TokenDispatched,
    /// The backend activated the subscription.
    Activated,
    Rejected(String),
    NetworkFailure(String),
    Retry,
    RecoveryStarted(String),
    /// A recoverable purchase was found; verification restarts.
    RecoveryAccepted,
    Dismiss,
}

impl fmt::Display for ProcessingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PurchaseConfirmed => "purchase_confirmed",
            Self::TokenDispatched => "token_dispatched",
            Self::Activated => "activated",
            Self::Rejected(_) => "rejected",
            Self::NetworkFailure(_) => "network_failure",
            Self::Retry => "retry",
            Self::RecoveryStarted(_) => "recovery_started",
            Self::RecoveryAccepted => "recovery_accepted",
            Self::Dismiss => "dismiss",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("processing is in flight and cannot be dismissed")]
    NotDismissible,
    #[error("{event} is not valid from {from}")]
    Invalid { from: String, event: String },
}

pub fn transition(
    current: Option<&PaymentProcessingState>,
    event: ProcessingEvent,
) -> Result<Option<PaymentProcessingState>, TransitionError> {
    use PaymentProcessingState as S;
    use ProcessingEvent as E;

    let next = match (current, event) {
        (Some(S::Verifying), E::PurchaseConfirmed) => return Err(invalid(current, &E::PurchaseConfirmed)),
        (_, E::PurchaseConfirmed) => S::Loading,
        (Some(S::Loading), E::TokenDispatched) => S::Verifying,
        (Some(S::Verifying), E::Activated) => S::Success,
        (Some(S::Loading | S::Verifying | S::SubscriptionRecovery(_)), E::Rejected(message)) => {
            S::Error(message)
        }
        (Some(S::Loading | S::Verifying), E::NetworkFailure(message)) => S::NetworkError(message),
        (Some(S::Error(_) | S::NetworkError(_)), E::Retry) => S::Loading,
        (state, E::RecoveryStarted(message)) if !state.is_some_and(S::is_in_flight) => {
            S::SubscriptionRecovery(message)
        }
        (Some(S::SubscriptionRecovery(_)), E::RecoveryAccepted) => S::Loading,
        (Some(state), E::Dismiss) if state.is_in_flight() => return Err(TransitionError::NotDismissible),
        (_, E::Dismiss) => return Ok(None),
        (_, event) => return Err(invalid(current, &event)),
    };
    Ok(Some(next))
}

fn invalid(current: Option<&PaymentProcessingState>, event: &ProcessingEvent) -> TransitionError {
    TransitionError::Invalid {
        from: label(current),
        event: event.to_string(),
    }
}

/// What `retry_verification` does from a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-run the recovery path for a store-only subscription.
    Recover,
    /// Refresh purchases and verify the first active one again.
    Reverify,
}

/// `None` when there is nothing to retry: idle, in flight or already activated.
pub fn retry_action(state: Option<&PaymentProcessingState>) -> Option<RetryAction> {
    match state {
        Some(PaymentProcessingState::SubscriptionRecovery(_)) => Some(RetryAction::Recover),
        Some(PaymentProcessingState::Error(_) | PaymentProcessingState::NetworkError(_)) => {
            Some(RetryAction::Reverify)
        }
        _ => None,
    }
}
