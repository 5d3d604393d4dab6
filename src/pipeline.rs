//! The travel-recommendation pipeline: recommend a destination, search
//! listings, aggregate the findings, wait for a human approval decision,
//! then persist the result tagged with that decision.
//!
//! The orchestration here is pure workflow logic: every external effect
//! (model completion, listing search, blob upload) is an activity the host
//! registers. Tests register stubs; production wires real implementations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::WorkflowError;
use crate::runtime::Runtime;
use crate::OrchestrationContext;

pub const PIPELINE_ORCHESTRATION: &str = "TravelRecommendationPipeline";

pub const RECOMMEND_ACTIVITY: &str = "RecommendDestination";
pub const SEARCH_ACTIVITY: &str = "SearchListings";
pub const AGGREGATE_ACTIVITY: &str = "AggregateResults";
pub const SAVE_ACTIVITY: &str = "SaveRecommendation";

/// Signal name carrying the human approval decision.
pub const APPROVAL_EVENT: &str = "ApprovalEvent";

pub const DECISION_APPROVE: &str = "approve";
pub const DECISION_REJECT: &str = "reject";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: String,
    pub end: String,
}

/// Start request for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TravelRequest {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_dates: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_per_day: Option<u64>,
}

/// Approval decision payload delivered through [`APPROVAL_EVENT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub status: String,
}

/// Input handed to [`SAVE_ACTIVITY`]. `status` is only ever
/// `approve` or `reject`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub instance_id: String,
    pub status: String,
    pub result: String,
}

/// Custom-status record the pipeline publishes at each stage checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub stage: String,
    pub message: String,
    pub start_time: Option<DateTime<Utc>>,
    /// 0–100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub outputs: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Final output of the pipeline. A failed stage still completes the
/// instance normally; the failure lives here, not in the runtime status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub success: bool,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Validate a raw start request. Called before any instance is created so a
/// malformed request leaves no orphan instance behind.
pub fn validate_request(raw: &str) -> Result<TravelRequest, WorkflowError> {
    let request: TravelRequest = serde_json::from_str(raw)
        .map_err(|e| WorkflowError::Validation(format!("malformed travel request: {e}")))?;
    if request.destination.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "destination must not be empty".into(),
        ));
    }
    if let Some(0) = request.days {
        return Err(WorkflowError::Validation("days must be at least 1".into()));
    }
    Ok(request)
}

/// Validate, then create and start a pipeline instance with the given id.
pub async fn start(
    runtime: &Arc<Runtime>,
    instance: &str,
    raw_input: &str,
) -> Result<(), WorkflowError> {
    let request = validate_request(raw_input)?;
    let input = serde_json::to_string(&request)
        .map_err(|e| WorkflowError::Validation(e.to_string()))?;
    runtime
        .start_orchestration(instance, PIPELINE_ORCHESTRATION, input)
        .await
}

/// Validate, then start under a generated instance id.
pub async fn start_new(runtime: &Arc<Runtime>, raw_input: &str) -> Result<String, WorkflowError> {
    let request = validate_request(raw_input)?;
    let input = serde_json::to_string(&request)
        .map_err(|e| WorkflowError::Validation(e.to_string()))?;
    runtime.start_new(PIPELINE_ORCHESTRATION, input).await
}

fn publish_stage(
    ctx: &OrchestrationContext,
    stage: &str,
    message: &str,
    progress: u8,
    outputs: serde_json::Value,
    errors: Vec<String>,
) {
    let record = StageStatus {
        stage: stage.to_string(),
        message: message.to_string(),
        start_time: ctx.started_at(),
        progress,
        outputs,
        errors,
    };
    if let Ok(body) = serde_json::to_string(&record) {
        ctx.set_custom_status(body);
    }
}

fn stage_failure(
    ctx: &OrchestrationContext,
    stage: &str,
    progress: u8,
    error: String,
) -> Result<String, String> {
    ctx.trace_warn(format!("stage {stage} failed: {error}"));
    publish_stage(
        ctx,
        stage,
        "stage failed",
        progress,
        serde_json::Value::Null,
        vec![error.clone()],
    );
    let output = PipelineOutput {
        success: false,
        stage: stage.to_string(),
        decision: None,
        summary: None,
        error: Some(error),
    };
    serde_json::to_string(&output).map_err(|e| e.to_string())
}

/// The pipeline orchestration. Deterministic and sequential: each activity
/// result is awaited before the next step, and an activity failure ends the
/// pipeline normally with `success: false` for that stage.
pub async fn travel_pipeline(
    ctx: OrchestrationContext,
    input: String,
) -> Result<String, String> {
    let request: TravelRequest = serde_json::from_str(&input)
        .map_err(|e| format!("malformed pipeline input: {e}"))?;

    ctx.trace_info(format!(
        "pipeline started destination={}",
        request.destination
    ));
    publish_stage(
        &ctx,
        "recommend",
        "recommending a destination",
        10,
        serde_json::Value::Null,
        Vec::new(),
    );

    let recommendation = match ctx.call_activity(RECOMMEND_ACTIVITY, input.clone()).await {
        Ok(r) => r,
        Err(e) => return stage_failure(&ctx, "recommend", 10, e),
    };

    publish_stage(
        &ctx,
        "search",
        "searching listings",
        35,
        json!({ "recommendation": recommendation }),
        Vec::new(),
    );
    let listings = match ctx.call_activity(SEARCH_ACTIVITY, recommendation.clone()).await {
        Ok(r) => r,
        Err(e) => return stage_failure(&ctx, "search", 35, e),
    };

    publish_stage(
        &ctx,
        "aggregate",
        "aggregating results",
        60,
        json!({ "recommendation": recommendation }),
        Vec::new(),
    );
    let aggregate_input = json!({ "request": request, "listings": listings }).to_string();
    let summary = match ctx.call_activity(AGGREGATE_ACTIVITY, aggregate_input).await {
        Ok(r) => r,
        Err(e) => return stage_failure(&ctx, "aggregate", 60, e),
    };

    publish_stage(
        &ctx,
        "await-approval",
        "waiting for approval decision",
        80,
        json!({ "summary": summary }),
        Vec::new(),
    );
    let decision_raw = ctx.wait_for_event(APPROVAL_EVENT).await;
    let decision = match serde_json::from_str::<ApprovalDecision>(&decision_raw) {
        Ok(d) if d.status == DECISION_APPROVE || d.status == DECISION_REJECT => d.status,
        Ok(d) => {
            return stage_failure(
                &ctx,
                "approval",
                80,
                format!("unrecognized approval status: {}", d.status),
            )
        }
        Err(e) => {
            return stage_failure(&ctx, "approval", 80, format!("malformed approval payload: {e}"))
        }
    };
    ctx.trace_info(format!("approval decision received: {decision}"));

    publish_stage(
        &ctx,
        "save",
        "persisting the recommendation",
        90,
        json!({ "decision": decision }),
        Vec::new(),
    );
    let save_request = SaveRequest {
        instance_id: ctx.instance_id(),
        status: decision.clone(),
        result: summary.clone(),
    };
    let save_input =
        serde_json::to_string(&save_request).map_err(|e| e.to_string())?;
    if let Err(e) = ctx.call_activity(SAVE_ACTIVITY, save_input).await {
        ctx.trace_warn(format!("save failed: {e}"));
        let output = PipelineOutput {
            success: false,
            stage: "save".into(),
            decision: Some(decision),
            summary: Some(summary),
            error: Some(e),
        };
        return serde_json::to_string(&output).map_err(|e| e.to_string());
    }

    publish_stage(
        &ctx,
        "done",
        "pipeline finished",
        100,
        json!({ "decision": decision }),
        Vec::new(),
    );
    let output = PipelineOutput {
        success: true,
        stage: "done".into(),
        decision: Some(decision),
        summary: Some(summary),
        error: None,
    };
    serde_json::to_string(&output).map_err(|e| e.to_string())
}

/// Register the pipeline orchestration on a registry builder.
pub fn register(
    builder: crate::runtime::registry::OrchestrationRegistryBuilder,
) -> crate::runtime::registry::OrchestrationRegistryBuilder {
    builder.register(PIPELINE_ORCHESTRATION, travel_pipeline)
}

/// Wait for the pipeline to finish and decode its output.
pub async fn wait_for_output(
    runtime: &Arc<Runtime>,
    instance: &str,
    timeout: Duration,
) -> Result<PipelineOutput, crate::WaitError> {
    let output = runtime.wait_for_output(instance, timeout).await?;
    serde_json::from_str(&output)
        .map_err(|e| crate::WaitError::Other(format!("malformed pipeline output: {e}")))
}
