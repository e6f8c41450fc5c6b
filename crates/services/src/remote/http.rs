use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use reader_core::model::{
    AssessmentRecord, Assignment, BlockIndex, BlockSummary, Case, SummaryAvailability, UserId,
};

use super::{ActiveBlock, AdvanceResponse, OverallProgress, StudyApi};
use crate::config::ApiConfig;
use crate::error::RemoteError;

/// `StudyApi` over the study service's JSON REST endpoints.
#[derive(Clone)]
pub struct HttpStudyApi {
    client: Client,
    config: ApiConfig,
}

impl HttpStudyApi {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ApiConfig::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let request = self.authorized(self.client.get(self.config.url(path)));
        decode(request.send().await?).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let request = self.authorized(self.client.post(self.config.url(path)).json(body));
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound);
    }
    if !status.is_success() {
        return Err(RemoteError::HttpStatus(status));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| RemoteError::Malformed(e.to_string()))
}

#[derive(Debug, Serialize)]
struct StartBlockRequest {
    size: u32,
    human_ai_probability: f64,
}

/// `/api/game/start` has answered both with a bare list and with a wrapper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StartBlockResponse {
    Wrapped { assignments: Vec<Assignment> },
    Bare(Vec<Assignment>),
}

/// Either flag name may be set by the service.
#[derive(Debug, Default, Deserialize)]
struct CanViewResponse {
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    ready: Option<bool>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    remaining_cases: Option<u32>,
}

impl From<CanViewResponse> for SummaryAvailability {
    fn from(raw: CanViewResponse) -> Self {
        Self {
            available: raw.available.or(raw.ready).unwrap_or(false),
            reason: raw.reason,
            remaining_cases: raw.remaining_cases,
        }
    }
}

#[async_trait]
impl StudyApi for HttpStudyApi {
    async fn list_cases(&self) -> Result<Vec<Case>, RemoteError> {
        self.get("/api/cases/?limit=100").await
    }

    async fn advance_assignment(&self) -> Result<AdvanceResponse, RemoteError> {
        self.post("/api/game/next", &serde_json::json!({})).await
    }

    async fn start_block(
        &self,
        size: u32,
        human_ai_probability: f64,
    ) -> Result<Vec<Assignment>, RemoteError> {
        let body = StartBlockRequest {
            size,
            human_ai_probability,
        };
        let response: StartBlockResponse = self.post("/api/game/start", &body).await?;
        Ok(match response {
            StartBlockResponse::Wrapped { assignments } | StartBlockResponse::Bare(assignments) => {
                assignments
            }
        })
    }

    async fn active_block(&self) -> Result<Option<ActiveBlock>, RemoteError> {
        match self.get::<Option<ActiveBlock>>("/api/game/active").await {
            Err(RemoteError::NotFound) => Ok(None),
            other => other,
        }
    }

    async fn list_block_assessments(
        &self,
        user: UserId,
        block: BlockIndex,
    ) -> Result<Vec<AssessmentRecord>, RemoteError> {
        self.get(&format!("/api/assessment/user/{user}/block/{block}"))
            .await
    }

    async fn block_summary(&self, block: BlockIndex) -> Result<BlockSummary, RemoteError> {
        self.get(&format!("/api/game/report/{block}")).await
    }

    async fn can_view_summary(
        &self,
        block: BlockIndex,
    ) -> Result<SummaryAvailability, RemoteError> {
        let raw: CanViewResponse = self
            .get(&format!("/api/game/can_view_report/{block}"))
            .await?;
        Ok(raw.into())
    }

    async fn list_summaries(&self) -> Result<Vec<BlockSummary>, RemoteError> {
        self.get("/api/game/reports").await
    }

    async fn latest_summary(&self) -> Result<BlockSummary, RemoteError> {
        self.get("/api/game/report/latest").await
    }

    async fn overall_progress(&self) -> Result<OverallProgress, RemoteError> {
        self.get("/api/game/progress").await
    }
}
