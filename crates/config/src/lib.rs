//! Configuration for the PoC challenger: protocol constants, the typed
//! chain-variable snapshot and process-level settings.

pub mod constants;
mod vars;

pub use self::vars::ChainVars;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-level challenger settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChallengerConfig {
    /// Directory backing the durable local PoC store.
    pub db_path: PathBuf,
    /// Capacity of the manager's command channel; senders queue beyond it.
    pub command_channel_capacity: usize,
}

impl Default for ChallengerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./poc-challenger-db"),
            command_channel_capacity: 128,
        }
    }
}
