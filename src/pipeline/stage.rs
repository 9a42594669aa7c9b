use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::agent::{AgentCapability, AgentOutput, AgentRequest};
use super::db::DbHandle;
use super::models::*;
use crate::errors::PipelineError;

const REFINE_SYSTEM_PROMPT: &str = r#"You are a team of senior engineers refining a feature request before implementation planning.

Rewrite the request into a clear, self-contained description covering:
- the user-facing goal and why it matters
- functional requirements and acceptance criteria
- edge cases and explicit scope boundaries

Respond with the refined request as plain prose. No preamble, no JSON."#;

const DISCOVERY_SYSTEM_PROMPT: &str = r#"You are a codebase analyst locating the files relevant to a feature request.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "files": [
    {
      "filePath": "relative/path/to/file.rs",
      "relevanceScore": 95,
      "priority": "critical" | "high" | "medium" | "low",
      "role": "What this file does in the codebase",
      "reasoning": "Why it matters for this feature",
      "integrationPoint": "Where the feature hooks in, if applicable"
    }
  ]
}

Rules:
- relevanceScore is 0-100.
- Order files by descending relevance.
- Include only files that genuinely matter; an empty list is a valid answer."#;

const GENERATION_SYSTEM_PROMPT: &str = r#"You are a senior engineer producing an implementation plan for a feature request.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "implementationPlan": "Markdown plan with numbered steps",
  "complexity": "low" | "medium" | "high",
  "riskLevel": "low" | "medium" | "high",
  "estimatedDuration": "e.g. 2-3 days"
}

Rules:
- Ground every step in the provided file list.
- Call out migration and rollout concerns explicitly.
- Keep the plan actionable: concrete files, concrete changes."#;

/// Discovery stage response payload.
#[derive(Debug, Deserialize)]
pub struct DiscoveryResponse {
    pub files: Vec<DiscoveredFile>,
}

impl DiscoveryResponse {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(extract_json(text))
            .context("Failed to parse discovery response as JSON")
    }
}

/// Plan-generation stage response payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub implementation_plan: String,
    #[serde(default)]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
}

impl GenerationResponse {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(extract_json(text))
            .context("Failed to parse plan generation response as JSON")
    }
}

/// Strip markdown fences and surrounding prose by taking the outermost
/// brace-delimited span.
fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn stage_err(stage: StageKind, message: impl Into<String>) -> PipelineError {
    PipelineError::stage(stage, message.into())
}

/// Run the agent call under the stage deadline, folding a timeout into the
/// same error shape as an agent failure.
async fn invoke_with_deadline(
    agent: &dyn AgentCapability,
    request: &AgentRequest,
    deadline: Duration,
) -> Result<AgentOutput, String> {
    match tokio::time::timeout(deadline, agent.invoke(request)).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(_) => Err(format!("timed out after {}s", deadline.as_secs())),
    }
}

// ── Refinement ────────────────────────────────────────────────────────

pub fn refine_prompt(plan: &FeaturePlan, personas: &[AgentConfig]) -> String {
    let mut perspectives = String::new();
    for p in personas {
        perspectives.push_str(&format!("### {} ({})\nFocus: {}\n{}\n\n", p.name, p.role, p.focus, p.system_prompt));
    }
    format!(
        "Refine this feature request.\n\n\
         ## Request\n{}\n\n\
         ## Perspectives to incorporate\n{}\
         Respond with the refined request only.",
        plan.original_request, perspectives,
    )
}

/// Run one refinement attempt per persona, in parallel, persisting each as
/// its own row. A failed attempt settles as failed and the others continue;
/// the stage only errors when every attempt failed. Nothing is written to
/// the plan itself: a candidate lands there through selection.
pub async fn run_refine(
    agent: Arc<dyn AgentCapability>,
    db: &DbHandle,
    plan: &FeaturePlan,
    personas: &[AgentConfig],
    model: Option<String>,
    deadline: Duration,
) -> Result<Vec<FeatureRefinement>, PipelineError> {
    let mut handles = Vec::with_capacity(personas.len());
    for persona in personas {
        let attempt = {
            let plan_id = plan.id;
            let agent_id = persona.agent_id.clone();
            let input = plan.original_request.clone();
            let model = model.clone();
            db.call(move |db| {
                db.create_refinement(plan_id, &agent_id, model.as_deref(), &input, &now_ts())
            })
            .await
            .map_err(PipelineError::Database)?
        };
        let request = AgentRequest {
            system_prompt: REFINE_SYSTEM_PROMPT.to_string(),
            prompt: refine_prompt(plan, std::slice::from_ref(persona)),
            model: model.clone(),
        };
        let agent = agent.clone();
        let db = db.clone();
        let plan_id = plan.id;
        handles.push(tokio::spawn(async move {
            let outcome = match invoke_with_deadline(agent.as_ref(), &request, deadline).await {
                Ok(output) => {
                    let refined = output.text.trim().to_string();
                    if refined.is_empty() {
                        Err("agent returned empty refinement".to_string())
                    } else {
                        Ok((refined, output.usage))
                    }
                }
                Err(message) => Err(message),
            };
            match outcome {
                Ok((refined, usage)) => {
                    let attempt_id = attempt.id;
                    let done = db
                        .call(move |db| {
                            db.complete_refinement(attempt_id, &refined, &usage, &now_ts())
                        })
                        .await
                        .map_err(PipelineError::Database)?;
                    info!(
                        plan_id,
                        refinement_id = done.id,
                        agent_id = %done.agent_id,
                        tokens = ?done.total_tokens,
                        "refinement attempt completed"
                    );
                    Ok(done)
                }
                Err(message) => {
                    warn!(plan_id, refinement_id = attempt.id, error = %message, "refinement attempt failed");
                    let attempt_id = attempt.id;
                    let stored = message.clone();
                    db.call(move |db| db.fail_refinement(attempt_id, &stored, &now_ts()))
                        .await
                        .map_err(PipelineError::Database)
                }
            }
        }));
    }

    let mut attempts = Vec::with_capacity(handles.len());
    for handle in handles {
        let attempt = handle
            .await
            .map_err(|e| PipelineError::Other(e.into()))??;
        attempts.push(attempt);
    }
    if !attempts.iter().any(|a| a.status == SessionStatus::Completed) {
        return Err(stage_err(StageKind::Refine, "all refinement attempts failed"));
    }
    Ok(attempts)
}

// ── Discovery ─────────────────────────────────────────────────────────

pub fn discovery_prompt(plan: &FeaturePlan) -> String {
    format!(
        "Find the files relevant to implementing this feature request.\n\n\
         ## Request\n{}\n\n\
         Respond with JSON only.",
        plan.request_text(),
    )
}

/// Run one discovery session: persist a processing row, call the agent under
/// the deadline, then settle the row as completed or failed. Failures are
/// written back before the error is raised so the record always tells the
/// full story.
pub async fn run_discovery(
    agent: &dyn AgentCapability,
    db: &DbHandle,
    plan: &FeaturePlan,
    model: Option<String>,
    deadline: Duration,
) -> Result<FileDiscoverySession, PipelineError> {
    let agent_id = format!("discovery-{}", Utc::now().timestamp_millis());
    let session = {
        let plan_id = plan.id;
        let agent_id = agent_id.clone();
        let model = model.clone();
        db.call(move |db| {
            db.create_discovery_session(plan_id, &agent_id, model.as_deref(), &now_ts())
        })
        .await
        .map_err(PipelineError::Database)?
    };
    info!(plan_id = plan.id, session_id = session.id, "discovery session started");

    let request = AgentRequest {
        system_prompt: DISCOVERY_SYSTEM_PROMPT.to_string(),
        prompt: discovery_prompt(plan),
        model,
    };

    let outcome = match invoke_with_deadline(agent, &request, deadline).await {
        Ok(output) => match DiscoveryResponse::parse(&output.text) {
            Ok(response) => Ok((response.files, output.usage)),
            Err(e) => Err(format!("invalid discovery response: {:#}", e)),
        },
        Err(message) => Err(message),
    };

    match outcome {
        Ok((files, usage)) => {
            let session_id = session.id;
            let done = db
                .call(move |db| {
                    db.complete_discovery_session(session_id, &files, &usage, &now_ts())
                })
                .await
                .map_err(PipelineError::Database)?;
            info!(
                plan_id = plan.id,
                session_id = done.id,
                files = done.total_files_found,
                "discovery session completed"
            );
            Ok(done)
        }
        Err(message) => {
            warn!(plan_id = plan.id, session_id = session.id, error = %message, "discovery session failed");
            let session_id = session.id;
            let stored = message.clone();
            db.call(move |db| db.fail_discovery_session(session_id, &stored, &now_ts()))
                .await
                .map_err(PipelineError::Database)?;
            Err(stage_err(StageKind::Discover, message))
        }
    }
}

// ── Plan generation ───────────────────────────────────────────────────

pub fn generation_prompt(plan: &FeaturePlan, files: &[DiscoveredFile]) -> String {
    let mut file_list = String::new();
    for f in files {
        file_list.push_str(&format!(
            "- {} (priority: {}, relevance: {})\n",
            f.file_path,
            f.priority.as_str(),
            f.relevance_score,
        ));
    }
    if file_list.is_empty() {
        file_list.push_str("(no files discovered)\n");
    }
    format!(
        "Produce an implementation plan for this feature request.\n\n\
         ## Request\n{}\n\n\
         ## Relevant files\n{}\n\
         Respond with JSON only.",
        plan.request_text(),
        file_list,
    )
}

/// Run one plan generation against the plan's adopted file list. Same
/// settle-then-raise contract as `run_discovery`.
pub async fn run_generation(
    agent: &dyn AgentCapability,
    db: &DbHandle,
    plan: &FeaturePlan,
    model: Option<String>,
    deadline: Duration,
) -> Result<PlanGeneration, PipelineError> {
    let agent_id = format!("generation-{}", Utc::now().timestamp_millis());
    let generation = {
        let plan_id = plan.id;
        let agent_id = agent_id.clone();
        let model = model.clone();
        db.call(move |db| db.create_generation(plan_id, &agent_id, model.as_deref(), &now_ts()))
            .await
            .map_err(PipelineError::Database)?
    };
    info!(plan_id = plan.id, generation_id = generation.id, "plan generation started");

    let files = plan.discovered_files.clone().unwrap_or_default();
    let request = AgentRequest {
        system_prompt: GENERATION_SYSTEM_PROMPT.to_string(),
        prompt: generation_prompt(plan, &files),
        model,
    };

    let outcome = match invoke_with_deadline(agent, &request, deadline).await {
        Ok(output) => match GenerationResponse::parse(&output.text) {
            Ok(response) => Ok((response, output.usage)),
            Err(e) => Err(format!("invalid plan generation response: {:#}", e)),
        },
        Err(message) => Err(message),
    };

    match outcome {
        Ok((response, usage)) => {
            let generation_id = generation.id;
            let done = db
                .call(move |db| {
                    db.complete_generation(
                        generation_id,
                        &response.implementation_plan,
                        response.complexity,
                        response.risk_level,
                        response.estimated_duration.as_deref(),
                        &usage,
                        &now_ts(),
                    )
                })
                .await
                .map_err(PipelineError::Database)?;
            info!(plan_id = plan.id, generation_id = done.id, "plan generation completed");
            Ok(done)
        }
        Err(message) => {
            warn!(plan_id = plan.id, generation_id = generation.id, error = %message, "plan generation failed");
            let generation_id = generation.id;
            let stored = message.clone();
            db.call(move |db| db.fail_generation(generation_id, &stored, &now_ts()))
                .await
                .map_err(PipelineError::Database)?;
            Err(stage_err(StageKind::Plan, message))
        }
    }
}
