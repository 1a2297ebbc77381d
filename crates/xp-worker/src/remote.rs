//! HTTP clients for a remote simulator and statistics engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use xp_config::{CollaboratorConfig, HttpCollaboratorConfig, WorkflowHandling};
use xp_core::{
    CollaboratorError, ExperimentRecord, JobValues, ScriptedSimulator, Simulator, StatsBundle,
    StatsEngine, StubStatsEngine, TimeWindow, Trace, Utilization, WorkflowDelta, WorkflowValue,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The configured timeout is applied per request, never client-wide.
fn build_client() -> Result<Client, CollaboratorError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| CollaboratorError::Failed(format!("Failed to build HTTP client: {}", e)))
}

fn with_timeout(request: RequestBuilder, timeout: Option<Duration>) -> RequestBuilder {
    match timeout {
        Some(timeout) => request.timeout(timeout),
        None => request,
    }
}

fn map_reqwest(
    endpoint: &str,
    operation: &str,
    timeout: Option<Duration>,
    e: reqwest::Error,
) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout {
            operation: operation.to_string(),
            seconds: timeout.map_or(0, |t| t.as_secs()),
        }
    } else if e.is_connect() {
        CollaboratorError::Unreachable {
            endpoint: endpoint.to_string(),
            source: Box::new(e),
        }
    } else if e.is_decode() {
        CollaboratorError::Malformed(format!("{}: {}", operation, e))
    } else {
        CollaboratorError::Failed(format!("{}: {}", operation, e))
    }
}

/// Simulator service: `POST /runs` runs an experiment to completion,
/// `GET /traces/{trace_id}` returns its trace.
///
/// A run is bounded only by the worker's simulation timeout; the configured
/// request timeout covers trace fetches.
pub struct HttpSimulator {
    client: Client,
    endpoint: String,
    timeout: Option<Duration>,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    host: &'a str,
    record: &'a ExperimentRecord,
}

impl HttpSimulator {
    pub fn new(config: &HttpCollaboratorConfig) -> Result<Self, CollaboratorError> {
        Ok(HttpSimulator {
            client: build_client()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: config.timeout.as_ref().map(|t| t.as_duration()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Simulator for HttpSimulator {
    async fn generate_and_run(
        &self,
        record: &ExperimentRecord,
        host: &str,
    ) -> Result<(), CollaboratorError> {
        let url = format!("{}/runs", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&RunRequest { host, record })
            .send()
            .await
            .map_err(|e| map_reqwest(&self.endpoint, "generate_and_run", None, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "POST {} returned {}: {}",
                url, status, body
            )));
        }
        Ok(())
    }

    async fn fetch_trace(
        &self,
        record: &ExperimentRecord,
    ) -> Result<Option<Trace>, CollaboratorError> {
        let url = format!("{}/traces/{}", self.endpoint, record.trace_id);
        let response = with_timeout(self.client.get(&url), self.timeout)
            .send()
            .await
            .map_err(|e| map_reqwest(&self.endpoint, "fetch_trace", self.timeout, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let trace = response
                    .json::<Trace>()
                    .await
                    .map_err(|e| map_reqwest(&self.endpoint, "fetch_trace", self.timeout, e))?;
                Ok(Some(trace))
            }
            status => Err(CollaboratorError::Failed(format!(
                "GET {} returned {}",
                url, status
            ))),
        }
    }
}

/// Statistics engine service: every operation is `POST /{operation}` with a
/// JSON body.
pub struct HttpStatsEngine {
    client: Client,
    endpoint: String,
    timeout: Option<Duration>,
}

impl HttpStatsEngine {
    pub fn new(config: &HttpCollaboratorConfig) -> Result<Self, CollaboratorError> {
        Ok(HttpStatsEngine {
            client: build_client()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            timeout: config.timeout.as_ref().map(|t| t.as_duration()),
        })
    }

    async fn call<B, R>(&self, operation: &str, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, operation);
        let response = with_timeout(self.client.post(&url), self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest(&self.endpoint, operation, self.timeout, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Failed(format!(
                "POST {} returned {}: {}",
                url, status, body
            )));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| map_reqwest(&self.endpoint, operation, self.timeout, e))
    }
}

#[async_trait]
impl StatsEngine for HttpStatsEngine {
    async fn job_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<JobValues, CollaboratorError> {
        self.call("job_values", &json!({ "trace": trace, "window": window }))
            .await
    }

    async fn workflow_values(
        &self,
        trace: &Trace,
        window: TimeWindow,
        handling: WorkflowHandling,
        sibling: usize,
    ) -> Result<Vec<WorkflowValue>, CollaboratorError> {
        self.call(
            "workflow_values",
            &json!({
                "trace": trace,
                "window": window,
                "handling": handling,
                "sibling": sibling,
            }),
        )
        .await
    }

    async fn utilization(
        &self,
        trace: &Trace,
        window: TimeWindow,
    ) -> Result<Utilization, CollaboratorError> {
        self.call("utilization", &json!({ "trace": trace, "window": window }))
            .await
    }

    async fn job_stats(&self, values: &JobValues) -> Result<StatsBundle, CollaboratorError> {
        self.call("job_stats", values).await
    }

    async fn workflow_stats(
        &self,
        values: &[WorkflowValue],
    ) -> Result<StatsBundle, CollaboratorError> {
        self.call("workflow_stats", values).await
    }

    async fn delta_stats(
        &self,
        deltas: &[WorkflowDelta],
    ) -> Result<StatsBundle, CollaboratorError> {
        self.call("delta_stats", deltas).await
    }
}

/// Build the simulator described by `config`.
pub fn simulator_from_config(
    config: &CollaboratorConfig,
) -> Result<Arc<dyn Simulator>, CollaboratorError> {
    match config {
        CollaboratorConfig::Stub(stub) => {
            let simulator = ScriptedSimulator::new();
            for trace_id in &stub.fail_trace_ids {
                simulator.fail_on(*trace_id);
            }
            Ok(Arc::new(simulator))
        }
        CollaboratorConfig::Http(http) => Ok(Arc::new(HttpSimulator::new(http)?)),
    }
}

/// Build the statistics engine described by `config`.
pub fn stats_from_config(
    config: &CollaboratorConfig,
) -> Result<Arc<dyn StatsEngine>, CollaboratorError> {
    match config {
        CollaboratorConfig::Stub(_) => Ok(Arc::new(StubStatsEngine::new())),
        CollaboratorConfig::Http(http) => Ok(Arc::new(HttpStatsEngine::new(http)?)),
    }
}
