use async_trait::async_trait;
use tracing::debug;

use cronfleet_scheduler::{CallRequest, CallResponse, RequestKey, VerbCaller, VerbError};

/// Calls verbs as `POST {endpoint}/{module}/{verb}` with the request body as JSON.
pub struct HttpVerbCaller {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVerbCaller {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl VerbCaller for HttpVerbCaller {
    async fn call(
        &self,
        request: CallRequest,
        request_key: Option<RequestKey>,
        origin_host: &str,
    ) -> Result<CallResponse, VerbError> {
        let url = format!(
            "{}/{}/{}",
            self.endpoint, request.verb.module, request.verb.name
        );
        debug!(%url, "calling verb");

        let mut req = self
            .client
            .post(&url)
            .header("x-origin-host", origin_host)
            .json(&request.body);
        if let Some(key) = &request_key {
            req = req.header("x-request-key", key.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| VerbError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| VerbError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(VerbError::Remote {
                verb: request.verb.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), text.trim()),
            });
        }

        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| VerbError::Transport(format!("invalid response body: {e}")))?
        };
        Ok(CallResponse { body })
    }
}
