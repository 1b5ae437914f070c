use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cronfleet_core::VerbRef;

use crate::error::VerbError;

/// A verb invocation: target plus JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub verb: VerbRef,
    pub body: serde_json::Value,
}

impl CallRequest {
    /// Cron firings carry no input: the body is `{}`.
    pub fn empty(verb: VerbRef) -> Self {
        Self {
            verb,
            body: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    pub body: serde_json::Value,
}

/// Origin-tagged identifier attached to a verb call for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey(pub String);

impl RequestKey {
    /// `cron-<module>-<verb>-<uuid>`.
    pub fn for_cron(verb: &VerbRef) -> Self {
        Self(format!(
            "cron-{}-{}-{}",
            verb.module,
            verb.name,
            Uuid::now_v7().simple()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Invokes verbs on behalf of the scheduler.
///
/// Deadlines and cancellation are applied by the caller: implementations
/// may simply be dropped mid-call.
#[async_trait]
pub trait VerbCaller: Send + Sync {
    async fn call(
        &self,
        request: CallRequest,
        request_key: Option<RequestKey>,
        origin_host: &str,
    ) -> Result<CallResponse, VerbError>;
}
