//! `cronfleet-core`: types, configuration and clock shared by every cronfleet crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{saturating_add, Clock, MockClock, SystemClock};
pub use config::CronfleetConfig;
pub use error::{CronfleetError, Result};
pub use types::{
    Controller, ControllerKey, CronJob, CronJobKey, CronJobState, DeploymentKey, VerbRef,
};
