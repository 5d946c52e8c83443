use super::{Approval, ApprovalError, ApprovalManager, ApprovalStatus};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteAction {
    Approve,
    Reject,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub identifier: String,
    pub voter: String,
    pub action: VoteAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    #[serde(flatten)]
    pub approval: Approval,
    pub status: ApprovalStatus,
}

impl From<Approval> for ApprovalResponse {
    fn from(approval: Approval) -> Self {
        let status = approval.status();
        Self { approval, status }
    }
}

impl IntoResponse for ApprovalError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
            ApprovalError::AlreadyExists(_) | ApprovalError::AlreadyVoted { .. } => {
                StatusCode::CONFLICT
            },
            ApprovalError::Store(e) => {
                error!("Approval store error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };
        (status, self.to_string()).into_response()
    }
}

pub fn router(manager: Arc<ApprovalManager>) -> Router {
    Router::new()
        .route("/v1/approvals", get(list_approvals).post(vote))
        .route("/v1/approvals/{*identifier}", get(get_approval))
        .with_state(manager)
}

async fn list_approvals(
    State(manager): State<Arc<ApprovalManager>>,
) -> Result<Json<Vec<ApprovalResponse>>, ApprovalError> {
    let approvals = manager.list().await?;
    Ok(Json(approvals.into_iter().map(Into::into).collect()))
}

async fn get_approval(
    State(manager): State<Arc<ApprovalManager>>,
    Path(identifier): Path<String>,
) -> Result<Json<ApprovalResponse>, ApprovalError> {
    Ok(Json(manager.get(&identifier).await?.into()))
}

async fn vote(
    State(manager): State<Arc<ApprovalManager>>,
    Json(request): Json<VoteRequest>,
) -> Result<Response, ApprovalError> {
    info!(
        "Approval API: {:?} on {} by {}",
        request.action, request.identifier, request.voter
    );

    let approval = match request.action {
        VoteAction::Approve => manager.approve(&request.identifier, &request.voter).await?,
        VoteAction::Reject => manager.reject(&request.identifier, &request.voter).await?,
        VoteAction::Delete => {
            manager.delete(&request.identifier).await?;
            return Ok(StatusCode::NO_CONTENT.into_response());
        },
    };

    Ok(Json(ApprovalResponse::from(approval)).into_response())
}
