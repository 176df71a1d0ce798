#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-agents** – Domain agents for Mycel.
//!
//! Two agents built on the framework contract:
//!
//! - [`BioAgent`]: owns biological research records and the `analysis`,
//!   `import`, and `export` pipelines.
//! - [`TreasuryAgent`]: owns token pools and staking positions and the
//!   `staking`, `reward`, and `distribution` pipelines.
//!
//! Each agent exclusively owns its records (persisted as per-entity JSON
//! documents in the agent's data directory), announces every observable state
//! change on the bus, and implements the error-handling contract for the
//! kinds it recognizes. The runtime treats the record shapes as opaque.

use serde::Deserialize;

mod bio;
mod treasury;

pub use bio::{BioAgent, BioRecord, BioRecordStatus};
pub use treasury::{PoolStatus, PositionStatus, StakingPosition, TokenPool, TreasuryAgent};

/// Attempts a queued task gets before it is dropped with a warning.
pub(crate) const MAX_TASK_ATTEMPTS: u64 = 3;

pub(crate) fn parse_params<T: for<'de> Deserialize<'de>>(
    params: serde_json::Value,
) -> Result<T, mycel_agent::AgentError> {
    serde_json::from_value(params)
        .map_err(|err| mycel_agent::AgentError::InvalidParams(err.to_string()))
}
