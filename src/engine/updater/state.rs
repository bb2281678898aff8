//! Launch State Machine
//!
//! Tracks a launch attempt through explicit states so a half-finished launch
//! is never reported as launched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Current phase of the launch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LaunchState {
    /// Launch not started
    #[default]
    Idle,
    /// Querying the catalog and applying the selection policy
    Selecting,
    /// Making the selected update's assets available
    Reconciling { update_id: Uuid },
    /// Launch asset resolved
    Launched {
        update_id: Uuid,
        launched_at: DateTime<Utc>,
    },
    Failed { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Illegal launch state transition from {from} to {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

impl LaunchState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Selecting => "selecting",
            Self::Reconciling { .. } => "reconciling",
            Self::Launched { .. } => "launched",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Launched { .. } | Self::Failed { .. })
    }

    fn reject(&self, to: &'static str) -> TransitionError {
        TransitionError {
            from: self.name(),
            to,
        }
    }

    /// Transition to selecting state
    pub fn start_selecting(&mut self) -> Result<(), TransitionError> {
        match self {
            Self::Idle => {
                *self = Self::Selecting;
                Ok(())
            }
            _ => Err(self.reject("selecting")),
        }
    }

    /// Transition to reconciling state
    pub fn start_reconciling(&mut self, update_id: Uuid) -> Result<(), TransitionError> {
        match self {
            Self::Selecting => {
                *self = Self::Reconciling { update_id };
                Ok(())
            }
            _ => Err(self.reject("reconciling")),
        }
    }

    /// Mark the reconciled update as launched
    pub fn mark_launched(&mut self) -> Result<(), TransitionError> {
        match self {
            Self::Reconciling { update_id } => {
                let update_id = *update_id;
                *self = Self::Launched {
                    update_id,
                    launched_at: Utc::now(),
                };
                Ok(())
            }
            _ => Err(self.reject("launched")),
        }
    }

    /// Mark launch as failed
    pub fn mark_failed(&mut self, reason: String) -> Result<(), TransitionError> {
        match self {
            Self::Selecting | Self::Reconciling { .. } => {
                *self = Self::Failed { reason };
                Ok(())
            }
            _ => Err(self.reject("failed")),
        }
    }

    pub fn launched_update_id(&self) -> Option<Uuid> {
        match self {
            Self::Launched { update_id, .. } => Some(*update_id),
            _ => None,
        }
    }
}
