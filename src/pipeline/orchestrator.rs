use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::agent::AgentCapability;
use super::db::DbHandle;
use super::models::*;
use super::reaper;
use super::stage;
use crate::config::{PipelineConfig, ReaperConfig};
use crate::errors::PipelineError;

const MAX_REQUEST_CHARS: usize = 10_000;

/// Coordinates the refine → discover → plan workflow on top of the database
/// and the agent runtime. Every operation is scoped to the calling user:
/// a plan belonging to someone else is a hard forbidden, not a not-found.
pub struct Orchestrator {
    db: DbHandle,
    agent: Arc<dyn AgentCapability>,
    pipeline: PipelineConfig,
    reaper: ReaperConfig,
}

/// Full plan view: the plan row plus its attempt history and the generation
/// that currently answers "what is the plan". With nothing selected, the
/// latest completed generation stands in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDetail {
    pub plan: FeaturePlan,
    pub refinements: Vec<FeatureRefinement>,
    pub discovery_sessions: Vec<FileDiscoverySession>,
    pub generations: Vec<PlanGeneration>,
    pub effective_generation: Option<PlanGeneration>,
}

/// Payload for creating or replacing an agent persona.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUpsert {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub focus: String,
    pub system_prompt: String,
    pub temperature: f64,
    #[serde(default)]
    pub tools: Vec<AgentTool>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        agent: Arc<dyn AgentCapability>,
        pipeline: PipelineConfig,
        reaper: ReaperConfig,
    ) -> Self {
        Self {
            db,
            agent,
            pipeline,
            reaper,
        }
    }

    // ── Plans ─────────────────────────────────────────────────────────

    pub async fn create_plan(
        &self,
        user_id: &str,
        original_request: &str,
    ) -> Result<FeaturePlan, PipelineError> {
        let request = original_request.trim();
        if request.is_empty() {
            return Err(PipelineError::Validation(
                "original request must not be empty".into(),
            ));
        }
        if request.chars().count() > MAX_REQUEST_CHARS {
            return Err(PipelineError::Validation(format!(
                "original request exceeds {} characters",
                MAX_REQUEST_CHARS
            )));
        }
        let user_id = user_id.to_string();
        let request = request.to_string();
        let plan = self
            .db
            .call(move |db| db.create_plan(&user_id, &request, &now_ts()))
            .await
            .map_err(PipelineError::Database)?;
        info!(plan_id = plan.id, "plan created");
        Ok(plan)
    }

    pub async fn list_plans(
        &self,
        user_id: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<FeaturePlan>, PipelineError> {
        let limit = limit.unwrap_or(50).clamp(1, 200);
        let offset = offset.unwrap_or(0).max(0);
        let user_id = user_id.to_string();
        self.db
            .call(move |db| db.list_plans(&user_id, limit, offset))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn get_plan(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<FeaturePlan, PipelineError> {
        self.owned_plan(user_id, plan_id).await
    }

    pub async fn plan_detail(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<PlanDetail, PipelineError> {
        let plan = self.owned_plan(user_id, plan_id).await?;
        let selected_generation_id = plan.selected_plan_generation_id;
        let (refinements, discovery_sessions, generations, effective_generation) = self
            .db
            .call(move |db| {
                let refinements = db.list_refinements(plan_id)?;
                let sessions = db.list_discovery_sessions(plan_id)?;
                let generations = db.list_generations(plan_id)?;
                let effective = match selected_generation_id {
                    Some(id) => db.get_generation(id)?,
                    None => db.latest_completed_generation(plan_id)?,
                };
                Ok((refinements, sessions, generations, effective))
            })
            .await
            .map_err(PipelineError::Database)?;
        Ok(PlanDetail {
            plan,
            refinements,
            discovery_sessions,
            generations,
            effective_generation,
        })
    }

    pub async fn list_refinements(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<Vec<FeatureRefinement>, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        self.db
            .call(move |db| db.list_refinements(plan_id))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn list_discovery_sessions(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<Vec<FileDiscoverySession>, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        self.db
            .call(move |db| db.list_discovery_sessions(plan_id))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn list_generations(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<Vec<PlanGeneration>, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        self.db
            .call(move |db| db.list_generations(plan_id))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn delete_plan(&self, user_id: &str, plan_id: i64) -> Result<(), PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        self.db
            .call(move |db| db.delete_plan(plan_id))
            .await
            .map_err(PipelineError::Database)?;
        info!(plan_id, "plan deleted");
        Ok(())
    }

    // ── Stages ────────────────────────────────────────────────────────

    /// Rewrite the original request through the user's personas, one attempt
    /// per persona in parallel. The attempts are persisted as candidates; the
    /// plan only changes when one is selected.
    pub async fn refine(
        &self,
        user_id: &str,
        plan_id: i64,
        model: Option<String>,
    ) -> Result<Vec<FeatureRefinement>, PipelineError> {
        self.reap_if_configured().await?;
        let plan = self.owned_plan(user_id, plan_id).await?;
        let personas = self.personas_for(user_id).await?;
        stage::run_refine(
            self.agent.clone(),
            &self.db,
            &plan,
            &personas,
            self.effective_model(model),
            self.pipeline.refine_timeout(),
        )
        .await
    }

    /// Copy a completed refinement's text onto the plan as the refined
    /// request. Re-selecting the current candidate is a no-op beyond the
    /// timestamp bump.
    pub async fn select_refinement(
        &self,
        user_id: &str,
        plan_id: i64,
        refinement_id: i64,
    ) -> Result<FeaturePlan, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        let refinement = self
            .db
            .call(move |db| db.get_refinement(refinement_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::RefinementNotFound { id: refinement_id })?;
        if refinement.plan_id != plan_id || refinement.status != SessionStatus::Completed {
            return Err(PipelineError::RefinementNotFound { id: refinement_id });
        }
        self.db
            .call(move |db| db.select_refinement(plan_id, &refinement, &now_ts()))
            .await
            .map_err(PipelineError::Database)
    }

    /// Run a discovery session. The result is recorded as a candidate only;
    /// the plan adopts a session's file list through explicit selection.
    pub async fn discover(
        &self,
        user_id: &str,
        plan_id: i64,
        model: Option<String>,
    ) -> Result<FileDiscoverySession, PipelineError> {
        self.reap_if_configured().await?;
        let plan = self.owned_plan(user_id, plan_id).await?;
        stage::run_discovery(
            self.agent.as_ref(),
            &self.db,
            &plan,
            self.effective_model(model),
            self.pipeline.discovery_timeout(),
        )
        .await
    }

    /// Point the plan at a specific completed discovery session. Re-selecting
    /// the current session is a no-op beyond the timestamp bump.
    pub async fn select_discovery(
        &self,
        user_id: &str,
        plan_id: i64,
        session_id: i64,
    ) -> Result<FeaturePlan, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        let session = self
            .db
            .call(move |db| db.get_discovery_session(session_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::SessionNotFound { id: session_id })?;
        if session.plan_id != plan_id || session.status != SessionStatus::Completed {
            return Err(PipelineError::SessionNotFound { id: session_id });
        }
        self.db
            .call(move |db| db.select_discovery_session(plan_id, &session, &now_ts()))
            .await
            .map_err(PipelineError::Database)
    }

    /// Generate an implementation plan against the adopted file list. Like
    /// discovery, the result is a candidate until it is selected.
    pub async fn generate(
        &self,
        user_id: &str,
        plan_id: i64,
        model: Option<String>,
    ) -> Result<PlanGeneration, PipelineError> {
        self.reap_if_configured().await?;
        let plan = self.owned_plan(user_id, plan_id).await?;
        if plan.selected_discovery_session_id.is_none() {
            return Err(PipelineError::Validation(
                "run file discovery before generating a plan".into(),
            ));
        }
        stage::run_generation(
            self.agent.as_ref(),
            &self.db,
            &plan,
            self.effective_model(model),
            self.pipeline.generation_timeout(),
        )
        .await
    }

    pub async fn select_generation(
        &self,
        user_id: &str,
        plan_id: i64,
        generation_id: i64,
    ) -> Result<FeaturePlan, PipelineError> {
        self.owned_plan(user_id, plan_id).await?;
        let generation = self
            .db
            .call(move |db| db.get_generation(generation_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::GenerationNotFound { id: generation_id })?;
        if generation.plan_id != plan_id || generation.status != SessionStatus::Completed {
            return Err(PipelineError::GenerationNotFound { id: generation_id });
        }
        self.db
            .call(move |db| db.select_generation(plan_id, &generation, &now_ts()))
            .await
            .map_err(PipelineError::Database)
    }

    // ── Reaping ───────────────────────────────────────────────────────

    pub async fn reap_now(&self) -> Result<ReapSummary, PipelineError> {
        reaper::sweep(&self.db, self.reaper.stuck_threshold(), Utc::now())
            .await
            .map_err(PipelineError::Database)
    }

    async fn reap_if_configured(&self) -> Result<(), PipelineError> {
        if self.reaper.reap_before_stage {
            self.reap_now().await?;
        }
        Ok(())
    }

    // ── Agent personas ────────────────────────────────────────────────

    /// Active personas for a user; the built-in set when none are stored.
    /// Defaults are never persisted, so deleting every persona restores them.
    pub async fn list_agents(&self, user_id: &str) -> Result<Vec<AgentConfig>, PipelineError> {
        Ok(self.personas_for(user_id).await?)
    }

    pub async fn upsert_agent(
        &self,
        user_id: &str,
        payload: AgentUpsert,
    ) -> Result<AgentConfig, PipelineError> {
        validate_agent(&payload)?;
        let now = now_ts();
        let agent = AgentConfig {
            agent_id: payload.agent_id.trim().to_string(),
            user_id: user_id.to_string(),
            name: payload.name.trim().to_string(),
            role: payload.role.trim().to_string(),
            focus: payload.focus.trim().to_string(),
            system_prompt: payload.system_prompt.trim().to_string(),
            temperature: payload.temperature,
            tools: payload.tools,
            is_active: true,
            created_at: now.clone(),
            updated_at: now,
        };
        self.db
            .call(move |db| db.upsert_agent(&agent))
            .await
            .map_err(PipelineError::Database)
    }

    pub async fn delete_agent(&self, user_id: &str, agent_id: &str) -> Result<(), PipelineError> {
        let user = user_id.to_string();
        let id = agent_id.to_string();
        let removed = self
            .db
            .call(move |db| db.deactivate_agent(&user, &id, &now_ts()))
            .await
            .map_err(PipelineError::Database)?;
        if !removed {
            return Err(PipelineError::AgentNotFound {
                agent_id: agent_id.to_string(),
            });
        }
        Ok(())
    }

    async fn personas_for(&self, user_id: &str) -> Result<Vec<AgentConfig>, PipelineError> {
        let user = user_id.to_string();
        let stored = self
            .db
            .call(move |db| db.list_agents(&user))
            .await
            .map_err(PipelineError::Database)?;
        if stored.is_empty() {
            Ok(AgentConfig::defaults(user_id, &now_ts()))
        } else {
            Ok(stored)
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────

    /// Per-request model override falls back to the configured default.
    fn effective_model(&self, model: Option<String>) -> Option<String> {
        model.or_else(|| self.pipeline.model.clone())
    }

    async fn owned_plan(
        &self,
        user_id: &str,
        plan_id: i64,
    ) -> Result<FeaturePlan, PipelineError> {
        let plan = self
            .db
            .call(move |db| db.get_plan(plan_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or(PipelineError::PlanNotFound { id: plan_id })?;
        if plan.user_id != user_id {
            return Err(PipelineError::Forbidden {
                user_id: user_id.to_string(),
                plan_id,
            });
        }
        Ok(plan)
    }
}

fn validate_agent(payload: &AgentUpsert) -> Result<(), PipelineError> {
    let id = payload.agent_id.trim();
    if id.is_empty() {
        return Err(PipelineError::Validation("agent id must not be empty".into()));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(PipelineError::Validation(
            "agent id may contain only lowercase letters, digits, '-' and '_'".into(),
        ));
    }
    if payload.name.trim().is_empty() {
        return Err(PipelineError::Validation("agent name must not be empty".into()));
    }
    if payload.system_prompt.trim().is_empty() {
        return Err(PipelineError::Validation(
            "agent system prompt must not be empty".into(),
        ));
    }
    if !(0.0..=1.0).contains(&payload.temperature) {
        return Err(PipelineError::Validation(
            "agent temperature must be between 0.0 and 1.0".into(),
        ));
    }
    Ok(())
}
