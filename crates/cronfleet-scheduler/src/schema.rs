use serde::{Deserialize, Serialize};

/// A deployed module as described by its schema file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub verbs: Vec<Verb>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verb {
    pub name: String,
    #[serde(default)]
    pub metadata: Vec<VerbMetadata>,
}

/// Directive attached to a verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerbMetadata {
    /// Run the verb on a cron schedule.
    Cron { schedule: String },
    /// Expose the verb over HTTP.
    Ingress { method: String, path: String },
}

impl Verb {
    /// Schedule of the first cron directive, if any.
    pub fn cron_schedule(&self) -> Option<&str> {
        self.metadata.iter().find_map(|m| match m {
            VerbMetadata::Cron { schedule } => Some(schedule.as_str()),
            _ => None,
        })
    }
}
