//! Typed errors for dispatch engine operations.
//!
//! Per-subscriber failures (render errors, transport errors) never surface
//! here: they are recorded against the campaign's counters. This module only
//! covers failures of the operator-facing operations themselves.

use herald_common::{CampaignId, CampaignStatus, StoreError};
use thiserror::Error;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The campaign definition is not valid for the requested transition.
    #[error("Validation failed for campaign {campaign}: {error}")]
    Validation {
        campaign: CampaignId,
        error: ValidationError,
    },

    /// The state machine has no such edge.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Unknown campaign: {0}")]
    UnknownCampaign(CampaignId),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The engine is shutting down and takes no more work.
    #[error("Dispatch engine is shutting down")]
    ShuttingDown,
}

/// A campaign definition that cannot be scheduled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No send time set")]
    MissingSendTime,

    #[error("Send time is in the past")]
    SendTimeInPast,

    #[error("No target lists")]
    NoLists,

    #[error("Transport {0} is not registered")]
    UnknownTransport(String),

    #[error("No subscribers resolved from the target lists")]
    NoSubscribers,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Campaign {campaign} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub campaign: CampaignId,
    pub from: CampaignStatus,
    pub to: CampaignStatus,
}

impl DispatchError {
    /// The validation failure, if this is one
    #[must_use]
    pub const fn validation(&self) -> Option<&ValidationError> {
        match self {
            Self::Validation { error, .. } => Some(error),
            _ => None,
        }
    }
}
