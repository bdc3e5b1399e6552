use crate::config::{StageEndpoints, WorkerService};
use crate::error::{PipelineError, Result};
use crate::request::StageRequest;
use crate::topology::StageId;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Seam between the executor and the stage workers. The HTTP client is the
/// production implementation; tests substitute a mock.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, stage: StageId, request: &StageRequest) -> Result<Value>;
}

/// Worker response envelope: `{"status": "success", "result": ...}`.
#[derive(Debug, Deserialize)]
struct TaskResponse {
    status: String,
    #[serde(default)]
    result: Value,
}

/// Thin synchronous request/response invoker over the stage workers.
///
/// Performs no business logic: resolves the worker's address, verifies it
/// is reachable, sends the request with the stage's timeout, and unwraps
/// the response envelope. Every stage kind goes through the same path.
pub struct HttpStageClient {
    http: reqwest::Client,
    endpoints: StageEndpoints,
}

impl HttpStageClient {
    pub fn new(endpoints: StageEndpoints) -> Result<Self> {
        // Timeouts are applied per request from the stage's own limit.
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, endpoints })
    }

    fn url_for(&self, request: &StageRequest) -> String {
        let target = self.endpoints.target(request.service());
        format!("http://{}:{}/{}", target.host, target.port, request.verb())
    }

    async fn check_reachable(&self, stage: StageId, request: &StageRequest) -> Result<()> {
        let target = self.endpoints.target(request.service());
        tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| {
                PipelineError::stage(
                    stage,
                    format!("worker address {}:{} unresolvable: {}", target.host, target.port, e),
                )
            })?;
        Ok(())
    }

    /// Probe every worker's health endpoint in parallel. Returns each
    /// service with whether it answered healthily.
    pub async fn probe_workers(&self) -> Vec<(WorkerService, bool)> {
        let services = [
            WorkerService::Retrieval,
            WorkerService::Rerank,
            WorkerService::Llm,
            WorkerService::Ragas,
        ];
        let probes = services.into_iter().map(|service| {
            let target = self.endpoints.target(service);
            let url = format!("http://{}:{}/", target.host, target.port);
            let http = self.http.clone();
            async move {
                let healthy = match http
                    .get(&url)
                    .timeout(HEALTH_PROBE_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        warn!("Worker {} health probe failed: {}", service.name(), e);
                        false
                    }
                };
                (service, healthy)
            }
        });
        futures::future::join_all(probes).await
    }
}

#[async_trait]
impl StageInvoker for HttpStageClient {
    async fn invoke(&self, stage: StageId, request: &StageRequest) -> Result<Value> {
        self.check_reachable(stage, request).await?;

        let url = self.url_for(request);
        debug!("Sending {} request to {}", stage, url);

        let response = self
            .http
            .post(&url)
            .timeout(stage.timeout())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout(format!(
                        "stage {} timed out after {:?}",
                        stage,
                        stage.timeout()
                    ))
                } else {
                    PipelineError::stage(stage, e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::stage(
                stage,
                format!("worker returned {}: {}", status, detail),
            ));
        }

        let envelope: TaskResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::stage(stage, format!("malformed response: {}", e)))?;

        if envelope.status != "success" {
            return Err(PipelineError::stage(
                stage,
                format!("worker reported status '{}'", envelope.status),
            ));
        }

        info!("Stage {} returned a result", stage);
        Ok(envelope.result)
    }
}
