//! Validation workflow routes

use crate::models::{
    estimate_completion, ApplicationValidationBody, BatchValidationBody, ItemResultsResponse,
    ItemValidationBody, SubmitApplicationResponse, SubmitBatchResponse, SubmitItemResponse,
    WorkflowResponse,
};
use crate::routes::ApiError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use ct_core::model::{latest_completed, ValidationResult};
use ct_core::ResultStore;
use std::sync::Arc;
use uuid::Uuid;

pub async fn validate_item(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ItemValidationBody>,
) -> Result<Json<SubmitItemResponse>, ApiError> {
    let request = body.into_request();
    let created_at = request.created_at;
    let submission = state.orchestrator.submit(request).await?;
    let validation_id = submission.result_ids.first().copied().ok_or(ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "submission produced no result record".to_string(),
    })?;
    Ok(Json(SubmitItemResponse {
        validation_id,
        workflow_id: submission.workflow_id,
        status: submission.status,
        estimated_completion_time: estimate_completion(created_at, 1),
        message: "Validation started".to_string(),
    }))
}

pub async fn validate_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BatchValidationBody>,
) -> Result<Json<SubmitBatchResponse>, ApiError> {
    let request = body.into_request();
    let created_at = request.created_at;
    let submission = state.orchestrator.submit(request).await?;
    let steps = submission.result_ids.len();
    Ok(Json(SubmitBatchResponse {
        validation_ids: submission.result_ids,
        workflow_id: submission.workflow_id,
        status: submission.status,
        estimated_completion_time: estimate_completion(created_at, steps),
        message: format!("Batch validation started for {steps} items"),
    }))
}

pub async fn validate_application(
    State(state): State<Arc<AppState>>,
    Path(application_id): Path<String>,
    Json(body): Json<ApplicationValidationBody>,
) -> Result<Json<SubmitApplicationResponse>, ApiError> {
    let request = body.into_request(application_id);
    let created_at = request.created_at;
    let live_steps = request.focus_areas.len() + request.integrations.len();
    let submission = state.orchestrator.submit(request).await?;
    Ok(Json(SubmitApplicationResponse {
        validation_id: submission.workflow_id,
        status: submission.status,
        estimated_completion_time: estimate_completion(created_at, live_steps),
        message: "Application validation started".to_string(),
    }))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = state.orchestrator.get_status(id).await?;
    Ok(Json(workflow.into()))
}

pub async fn latest_for_application(
    State(state): State<Arc<AppState>>,
    Path(application_id): Path<String>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = state
        .orchestrator
        .latest_for_application(&application_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("no validation workflows for {application_id}"))
        })?;
    Ok(Json(workflow.into()))
}

pub async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = state.orchestrator.cancel(id).await?;
    Ok(Json(workflow.into()))
}

pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_workflow(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("workflow {id}")))
    }
}

pub async fn get_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ValidationResult>, ApiError> {
    let result = state
        .store
        .result(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("validation result {id}")))?;
    Ok(Json(result))
}

pub async fn delete_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_result(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("validation result {id}")))
    }
}

pub async fn results_for_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<ItemResultsResponse>, ApiError> {
    let history = state.store.results_for_item(&item_id).await?;
    let latest = latest_completed(&history).cloned();
    Ok(Json(ItemResultsResponse {
        checklist_item_id: item_id,
        latest,
        history,
    }))
}
