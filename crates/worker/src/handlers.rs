use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use omniq_domain::{ExecutionError, Task, TaskContext, TaskHandler};

/// Handler that delegates a task to a remote HTTP collaborator. Content
/// generation, publishing and compliance checks all run behind endpoints
/// like this one; the response body becomes the task result.
///
/// Client errors (4xx) mean the request itself is wrong and will not get
/// better with retries; server errors and transport failures are transient.
pub struct HttpCallHandler {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCallHandler {
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl TaskHandler for HttpCallHandler {
    async fn execute(
        &self,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let body = json!({
            "task_id": task.id,
            "kind": task.kind,
            "tenant_id": task.tenant_id,
            "attempt": ctx.attempt,
            "payload": task.payload,
        });

        let request = self.client.post(&self.endpoint).json(&body).send();
        let response = tokio::select! {
            response = request => response,
            _ = ctx.cancellation.cancelled() => {
                return Err(ExecutionError::transient("attempt cancelled"));
            }
        };

        let response = response.map_err(|e| ExecutionError::transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            if status == StatusCode::NO_CONTENT {
                return Ok(json!(null));
            }
            response
                .json()
                .await
                .map_err(|e| ExecutionError::transient(format!("invalid response body: {e}")))
        } else if status.is_client_error() {
            Err(ExecutionError::permanent(format!(
                "{} rejected the request: {status}",
                self.endpoint
            )))
        } else {
            Err(ExecutionError::transient(format!(
                "{} answered {status}",
                self.endpoint
            )))
        }
    }
}
