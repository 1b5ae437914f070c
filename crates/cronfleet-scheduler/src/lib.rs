//! `cronfleet-scheduler`: distributed cron scheduling for a fleet of controllers.
//!
//! # Overview
//!
//! Every controller runs one [`CronService`]. Its event loop keeps the job
//! list sorted by next firing, sleeps until the earliest job is due and then
//! races the other controllers to claim the firing through the shared store
//! ([`dal::CronJobDal`]). The winner dispatches the verb and ends the job
//! with its next firing.
//!
//! A consistent-hash ring ([`hashring`]) narrows the race: each job is
//! attempted only by its two responsible controllers, except during the
//! grace window right after a deployment, when whoever hears about it first
//! also attempts it.
//!
//! # Modules
//!
//! | Module         | Role                                                   |
//! |----------------|--------------------------------------------------------|
//! | `dal`          | Storage contract plus in-memory and SQLite stores      |
//! | `hashring`     | Job key to controller window mapping                   |
//! | `state`        | Loop-owned job list, local executions, grace window    |
//! | `events`       | Bounded job change topic feeding the loop              |
//! | `engine`       | The event loop and dispatch task                       |
//! | `housekeeping` | Periodic job reset and stale job killer                |
//! | `tasks`        | Periodic task runner (parallel and leased singleton)   |
//! | `service`      | Builder-assembled facade                               |

pub mod dal;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod hashring;
mod housekeeping;
pub mod schema;
pub mod service;
pub mod state;
pub mod tasks;
pub mod verb;

pub use dal::{AttemptedCronJob, CronJobDal, DeploymentDal, InMemoryDal, LeaseDal, SqliteDal};
pub use error::{DalError, Result, SchedulerError, VerbError};
pub use events::{JobChange, JobChangeKind};
pub use hashring::{HashRing, HashRingState, SharedHashRing};
pub use schema::{Module, Verb, VerbMetadata};
pub use service::{CronService, CronServiceBuilder};
pub use tasks::{Backoff, LocalTaskScheduler, TaskJob, TaskScheduler};
pub use verb::{CallRequest, CallResponse, RequestKey, VerbCaller};
