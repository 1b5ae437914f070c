use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one controller replica. Compared as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerKey(pub String);

impl ControllerKey {
    pub fn new() -> Self {
        Self(format!("ctr-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ControllerKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ControllerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ControllerKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ControllerKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies one deployed version of a module.
///
/// Format: `dpl-{module}-{uuid v7}`. The empty default marks a job not yet
/// attached to a stored deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentKey(pub String);

impl DeploymentKey {
    pub fn new(module: &str) -> Self {
        Self(format!("dpl-{}-{}", module, Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeploymentKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeploymentKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Stable identity of a cron job. Doubles as the hash ring lookup key.
///
/// Format: `crn-{module}-{verb}-{uuid v7}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CronJobKey(pub String);

impl CronJobKey {
    pub fn new(module: &str, verb: &str) -> Self {
        Self(format!("crn-{}-{}-{}", module, verb, Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CronJobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CronJobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CronJobKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to a verb: `module.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VerbRef {
    pub module: String,
    pub name: String,
}

impl VerbRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VerbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// One member of the controller fleet, as delivered by membership updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub key: ControllerKey,
}

impl Controller {
    pub fn new(key: impl Into<ControllerKey>) -> Self {
        Self { key: key.into() }
    }
}

/// Storage-mediated lifecycle state of a cron job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronJobState {
    /// Waiting for `next_execution`.
    Idle,
    /// Claimed by some controller at `start_time`.
    Executing,
}

impl fmt::Display for CronJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CronJobState::Idle => "idle",
            CronJobState::Executing => "executing",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CronJobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(CronJobState::Idle),
            "executing" => Ok(CronJobState::Executing),
            other => Err(format!("unknown cron job state: {other}")),
        }
    }
}

/// A scheduled verb invocation owned by a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub key: CronJobKey,
    pub deployment_key: DeploymentKey,
    pub verb: VerbRef,
    /// Cron pattern text, evaluated in UTC.
    pub schedule: String,
    /// When the current execution began, or when the job was created.
    pub start_time: DateTime<Utc>,
    pub next_execution: DateTime<Utc>,
    pub state: CronJobState,
}

impl CronJob {
    pub fn is_executing(&self) -> bool {
        self.state == CronJobState::Executing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_job_key_embeds_module_and_verb() {
        let key = CronJobKey::new("billing", "invoice");
        assert!(key.as_str().starts_with("crn-billing-invoice-"));
        assert_ne!(key, CronJobKey::new("billing", "invoice"));
    }

    #[test]
    fn deployment_key_embeds_module() {
        assert!(DeploymentKey::new("echo").as_str().starts_with("dpl-echo-"));
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in [CronJobState::Idle, CronJobState::Executing] {
            let parsed: CronJobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("paused".parse::<CronJobState>().is_err());
    }

    #[test]
    fn verb_ref_displays_dotted() {
        assert_eq!(VerbRef::new("time", "tick").to_string(), "time.tick");
    }
}
