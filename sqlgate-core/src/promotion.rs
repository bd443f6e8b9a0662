//! Staging-first promotion rules for approved scripts.
//!
//! A script moves `PendingStaging -> StagingExecuted -> ProductionExecuted`.
//! The `DirectProd` flag is not a state: it is an attribute that additionally
//! permits `PendingStaging -> ProductionExecuted`.
//!
//! Flags record "has ever succeeded" rather than "may run once". Running an
//! environment again is always allowed, and flags are never cleared.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::environment::Environment;

/// Where a script currently sits in the promotion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionState {
    PendingStaging,
    StagingExecuted,
    ProductionExecuted,
}

/// Why an execution request was refused before any SQL ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromotionRefusal {
    #[error(
        "script has not been executed on staging yet and is not marked DirectProd; \
         run it on staging first or add a `-- DirectProd` directive and re-approve"
    )]
    StagingRequired,
}

/// The persisted promotion flags of one script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionFlags {
    pub staging_executed: bool,
    pub production_executed: bool,
    pub direct_prod: bool,
}

impl PromotionFlags {
    pub fn state(&self) -> PromotionState {
        if self.production_executed {
            PromotionState::ProductionExecuted
        } else if self.staging_executed {
            PromotionState::StagingExecuted
        } else {
            PromotionState::PendingStaging
        }
    }

    /// Check whether a run against `environment` may start.
    ///
    /// Staging is always allowed. Production requires a previous successful
    /// staging run or the `DirectProd` bypass.
    pub fn authorize(&self, environment: Environment) -> Result<(), PromotionRefusal> {
        match environment {
            Environment::Staging => Ok(()),
            Environment::Production if self.staging_executed || self.direct_prod => Ok(()),
            Environment::Production => Err(PromotionRefusal::StagingRequired),
        }
    }

    /// Whether a successful run against `environment` has been recorded.
    pub fn executed(&self, environment: Environment) -> bool {
        match environment {
            Environment::Staging => self.staging_executed,
            Environment::Production => self.production_executed,
        }
    }

    /// Flags after a successful run. Flags only ever go from false to true.
    pub fn record_success(self, environment: Environment) -> Self {
        match environment {
            Environment::Staging => Self {
                staging_executed: true,
                ..self
            },
            Environment::Production => Self {
                production_executed: true,
                ..self
            },
        }
    }

    /// The stored invariant: production is never marked executed unless
    /// staging ran or the bypass is set.
    pub fn is_consistent(&self) -> bool {
        !self.production_executed || self.staging_executed || self.direct_prod
    }
}
