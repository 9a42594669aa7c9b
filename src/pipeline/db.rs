use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::*;

/// Async-safe handle to the planner database.
///
/// Wraps `PlannerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PlannerDb>>,
}

impl DbHandle {
    pub fn new(db: PlannerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PlannerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PlannerDb {
    conn: Connection,
}

impl PlannerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS feature_plans (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    original_request TEXT NOT NULL,
                    refined_request TEXT,
                    selected_refinement_id INTEGER,
                    selected_discovery_session_id INTEGER,
                    discovered_files TEXT,
                    selected_plan_generation_id INTEGER,
                    implementation_plan TEXT,
                    complexity TEXT,
                    risk_level TEXT,
                    estimated_duration TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS feature_refinements (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    plan_id INTEGER NOT NULL REFERENCES feature_plans(id) ON DELETE CASCADE,
                    agent_id TEXT NOT NULL,
                    model TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    input_request TEXT NOT NULL,
                    refined_request TEXT,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    total_tokens INTEGER,
                    execution_time_ms INTEGER,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS file_discovery_sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    plan_id INTEGER NOT NULL REFERENCES feature_plans(id) ON DELETE CASCADE,
                    agent_id TEXT NOT NULL,
                    model TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    discovered_files TEXT NOT NULL DEFAULT '[]',
                    total_files_found INTEGER NOT NULL DEFAULT 0,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    total_tokens INTEGER,
                    execution_time_ms INTEGER,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS plan_generations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    plan_id INTEGER NOT NULL REFERENCES feature_plans(id) ON DELETE CASCADE,
                    agent_id TEXT NOT NULL,
                    model TEXT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    implementation_plan TEXT,
                    complexity TEXT,
                    risk_level TEXT,
                    estimated_duration TEXT,
                    prompt_tokens INTEGER,
                    completion_tokens INTEGER,
                    total_tokens INTEGER,
                    execution_time_ms INTEGER,
                    error_message TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS agent_configs (
                    agent_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    focus TEXT NOT NULL,
                    system_prompt TEXT NOT NULL,
                    temperature REAL NOT NULL DEFAULT 0.7,
                    tools TEXT NOT NULL DEFAULT '[]',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, agent_id)
                );

                CREATE INDEX IF NOT EXISTS idx_plans_user ON feature_plans(user_id);
                CREATE INDEX IF NOT EXISTS idx_refinements_plan ON feature_refinements(plan_id);
                CREATE INDEX IF NOT EXISTS idx_refinements_status ON feature_refinements(status);
                CREATE INDEX IF NOT EXISTS idx_discovery_plan ON file_discovery_sessions(plan_id);
                CREATE INDEX IF NOT EXISTS idx_discovery_status ON file_discovery_sessions(status);
                CREATE INDEX IF NOT EXISTS idx_generations_plan ON plan_generations(plan_id);
                CREATE INDEX IF NOT EXISTS idx_generations_status ON plan_generations(status);
                CREATE INDEX IF NOT EXISTS idx_agents_user ON agent_configs(user_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Feature plans ─────────────────────────────────────────────────

    pub fn create_plan(
        &self,
        user_id: &str,
        original_request: &str,
        now: &str,
    ) -> Result<FeaturePlan> {
        self.conn
            .execute(
                "INSERT INTO feature_plans (user_id, original_request, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![user_id, original_request, now],
            )
            .context("Failed to insert feature plan")?;
        let id = self.conn.last_insert_rowid();
        self.get_plan(id)?.context("Plan not found after insert")
    }

    pub fn get_plan(&self, id: i64) -> Result<Option<FeaturePlan>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PLAN_COLUMNS} FROM feature_plans WHERE id = ?1"
            ))
            .context("Failed to prepare get_plan")?;
        let mut rows = stmt
            .query_map(params![id], read_plan_row)
            .context("Failed to query plan")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read plan row")?;
                Ok(Some(r.into_plan()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_plans(&self, user_id: &str, limit: i64, offset: i64) -> Result<Vec<FeaturePlan>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PLAN_COLUMNS} FROM feature_plans
                 WHERE user_id = ?1 ORDER BY updated_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))
            .context("Failed to prepare list_plans")?;
        let rows = stmt
            .query_map(params![user_id, limit, offset], read_plan_row)
            .context("Failed to query plans")?;
        let mut plans = Vec::new();
        for row in rows {
            let r = row.context("Failed to read plan row")?;
            plans.push(r.into_plan()?);
        }
        Ok(plans)
    }

    /// Adopt a refinement attempt onto its plan: copy the refined text and
    /// point the selection at the attempt.
    pub fn select_refinement(
        &self,
        plan_id: i64,
        refinement: &FeatureRefinement,
        now: &str,
    ) -> Result<FeaturePlan> {
        self.conn
            .execute(
                "UPDATE feature_plans
                 SET selected_refinement_id = ?1, refined_request = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![refinement.id, refinement.refined_request, now, plan_id],
            )
            .context("Failed to select refinement")?;
        self.get_plan(plan_id)?
            .context("Plan not found after refinement selection")
    }

    pub fn delete_plan(&self, plan_id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM feature_plans WHERE id = ?1", params![plan_id])
            .context("Failed to delete plan")?;
        Ok(count > 0)
    }

    /// Adopt a discovery session onto its plan: copy the file list and point
    /// the selection at the session. Any previously selected generation is
    /// left in place; re-discovery never reverts a planned plan.
    pub fn select_discovery_session(
        &self,
        plan_id: i64,
        session: &FileDiscoverySession,
        now: &str,
    ) -> Result<FeaturePlan> {
        let files_json = serde_json::to_string(&session.discovered_files)
            .context("Failed to serialize discovered files")?;
        self.conn
            .execute(
                "UPDATE feature_plans
                 SET selected_discovery_session_id = ?1, discovered_files = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![session.id, files_json, now, plan_id],
            )
            .context("Failed to select discovery session")?;
        self.get_plan(plan_id)?
            .context("Plan not found after discovery selection")
    }

    /// Adopt a plan generation onto its plan: copy the plan text and the
    /// denormalized assessment fields.
    pub fn select_generation(
        &self,
        plan_id: i64,
        generation: &PlanGeneration,
        now: &str,
    ) -> Result<FeaturePlan> {
        self.conn
            .execute(
                "UPDATE feature_plans
                 SET selected_plan_generation_id = ?1, implementation_plan = ?2,
                     complexity = ?3, risk_level = ?4, estimated_duration = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    generation.id,
                    generation.implementation_plan,
                    generation.complexity.map(|c| c.as_str()),
                    generation.risk_level.map(|r| r.as_str()),
                    generation.estimated_duration,
                    now,
                    plan_id
                ],
            )
            .context("Failed to select plan generation")?;
        self.get_plan(plan_id)?
            .context("Plan not found after generation selection")
    }

    // ── Refinement attempts ───────────────────────────────────────────

    pub fn create_refinement(
        &self,
        plan_id: i64,
        agent_id: &str,
        model: Option<&str>,
        input_request: &str,
        now: &str,
    ) -> Result<FeatureRefinement> {
        self.conn
            .execute(
                "INSERT INTO feature_refinements (plan_id, agent_id, model, status, input_request, created_at)
                 VALUES (?1, ?2, ?3, 'processing', ?4, ?5)",
                params![plan_id, agent_id, model, input_request, now],
            )
            .context("Failed to insert refinement")?;
        let id = self.conn.last_insert_rowid();
        self.get_refinement(id)?
            .context("Refinement not found after insert")
    }

    pub fn complete_refinement(
        &self,
        id: i64,
        refined_request: &str,
        usage: &TokenUsage,
        now: &str,
    ) -> Result<FeatureRefinement> {
        self.conn
            .execute(
                "UPDATE feature_refinements
                 SET status = 'completed', refined_request = ?1,
                     prompt_tokens = ?2, completion_tokens = ?3, total_tokens = ?4,
                     execution_time_ms = ?5, error_message = NULL, completed_at = ?6
                 WHERE id = ?7",
                params![
                    refined_request,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    usage.execution_time_ms,
                    now,
                    id
                ],
            )
            .context("Failed to complete refinement")?;
        self.get_refinement(id)?
            .context("Refinement not found after completion")
    }

    pub fn fail_refinement(
        &self,
        id: i64,
        error_message: &str,
        now: &str,
    ) -> Result<FeatureRefinement> {
        self.conn
            .execute(
                "UPDATE feature_refinements
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![error_message, now, id],
            )
            .context("Failed to fail refinement")?;
        self.get_refinement(id)?
            .context("Refinement not found after failure update")
    }

    pub fn get_refinement(&self, id: i64) -> Result<Option<FeatureRefinement>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REFINEMENT_COLUMNS} FROM feature_refinements WHERE id = ?1"
            ))
            .context("Failed to prepare get_refinement")?;
        let mut rows = stmt
            .query_map(params![id], read_refinement_row)
            .context("Failed to query refinement")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read refinement row")?;
                Ok(Some(r.into_refinement()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_refinements(&self, plan_id: i64) -> Result<Vec<FeatureRefinement>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REFINEMENT_COLUMNS} FROM feature_refinements
                 WHERE plan_id = ?1 ORDER BY id DESC"
            ))
            .context("Failed to prepare list_refinements")?;
        let rows = stmt
            .query_map(params![plan_id], read_refinement_row)
            .context("Failed to query refinements")?;
        let mut refinements = Vec::new();
        for row in rows {
            let r = row.context("Failed to read refinement row")?;
            refinements.push(r.into_refinement()?);
        }
        Ok(refinements)
    }

    // ── Discovery sessions ────────────────────────────────────────────

    pub fn create_discovery_session(
        &self,
        plan_id: i64,
        agent_id: &str,
        model: Option<&str>,
        now: &str,
    ) -> Result<FileDiscoverySession> {
        self.conn
            .execute(
                "INSERT INTO file_discovery_sessions (plan_id, agent_id, model, status, created_at)
                 VALUES (?1, ?2, ?3, 'processing', ?4)",
                params![plan_id, agent_id, model, now],
            )
            .context("Failed to insert discovery session")?;
        let id = self.conn.last_insert_rowid();
        self.get_discovery_session(id)?
            .context("Discovery session not found after insert")
    }

    pub fn complete_discovery_session(
        &self,
        id: i64,
        files: &[DiscoveredFile],
        usage: &TokenUsage,
        now: &str,
    ) -> Result<FileDiscoverySession> {
        let files_json =
            serde_json::to_string(files).context("Failed to serialize discovered files")?;
        self.conn
            .execute(
                "UPDATE file_discovery_sessions
                 SET status = 'completed', discovered_files = ?1, total_files_found = ?2,
                     prompt_tokens = ?3, completion_tokens = ?4, total_tokens = ?5,
                     execution_time_ms = ?6, error_message = NULL, completed_at = ?7
                 WHERE id = ?8",
                params![
                    files_json,
                    files.len() as i64,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    usage.execution_time_ms,
                    now,
                    id
                ],
            )
            .context("Failed to complete discovery session")?;
        self.get_discovery_session(id)?
            .context("Discovery session not found after completion")
    }

    pub fn fail_discovery_session(
        &self,
        id: i64,
        error_message: &str,
        now: &str,
    ) -> Result<FileDiscoverySession> {
        self.conn
            .execute(
                "UPDATE file_discovery_sessions
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![error_message, now, id],
            )
            .context("Failed to fail discovery session")?;
        self.get_discovery_session(id)?
            .context("Discovery session not found after failure update")
    }

    pub fn get_discovery_session(&self, id: i64) -> Result<Option<FileDiscoverySession>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM file_discovery_sessions WHERE id = ?1"
            ))
            .context("Failed to prepare get_discovery_session")?;
        let mut rows = stmt
            .query_map(params![id], read_session_row)
            .context("Failed to query discovery session")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read discovery session row")?;
                Ok(Some(r.into_session()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_discovery_sessions(&self, plan_id: i64) -> Result<Vec<FileDiscoverySession>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM file_discovery_sessions
                 WHERE plan_id = ?1 ORDER BY id DESC"
            ))
            .context("Failed to prepare list_discovery_sessions")?;
        let rows = stmt
            .query_map(params![plan_id], read_session_row)
            .context("Failed to query discovery sessions")?;
        let mut sessions = Vec::new();
        for row in rows {
            let r = row.context("Failed to read discovery session row")?;
            sessions.push(r.into_session()?);
        }
        Ok(sessions)
    }

    // ── Plan generations ──────────────────────────────────────────────

    pub fn create_generation(
        &self,
        plan_id: i64,
        agent_id: &str,
        model: Option<&str>,
        now: &str,
    ) -> Result<PlanGeneration> {
        self.conn
            .execute(
                "INSERT INTO plan_generations (plan_id, agent_id, model, status, created_at)
                 VALUES (?1, ?2, ?3, 'processing', ?4)",
                params![plan_id, agent_id, model, now],
            )
            .context("Failed to insert plan generation")?;
        let id = self.conn.last_insert_rowid();
        self.get_generation(id)?
            .context("Plan generation not found after insert")
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_generation(
        &self,
        id: i64,
        implementation_plan: &str,
        complexity: Option<Complexity>,
        risk_level: Option<RiskLevel>,
        estimated_duration: Option<&str>,
        usage: &TokenUsage,
        now: &str,
    ) -> Result<PlanGeneration> {
        self.conn
            .execute(
                "UPDATE plan_generations
                 SET status = 'completed', implementation_plan = ?1, complexity = ?2,
                     risk_level = ?3, estimated_duration = ?4,
                     prompt_tokens = ?5, completion_tokens = ?6, total_tokens = ?7,
                     execution_time_ms = ?8, error_message = NULL, completed_at = ?9
                 WHERE id = ?10",
                params![
                    implementation_plan,
                    complexity.map(|c| c.as_str()),
                    risk_level.map(|r| r.as_str()),
                    estimated_duration,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    usage.execution_time_ms,
                    now,
                    id
                ],
            )
            .context("Failed to complete plan generation")?;
        self.get_generation(id)?
            .context("Plan generation not found after completion")
    }

    pub fn fail_generation(
        &self,
        id: i64,
        error_message: &str,
        now: &str,
    ) -> Result<PlanGeneration> {
        self.conn
            .execute(
                "UPDATE plan_generations
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![error_message, now, id],
            )
            .context("Failed to fail plan generation")?;
        self.get_generation(id)?
            .context("Plan generation not found after failure update")
    }

    pub fn get_generation(&self, id: i64) -> Result<Option<PlanGeneration>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM plan_generations WHERE id = ?1"
            ))
            .context("Failed to prepare get_generation")?;
        let mut rows = stmt
            .query_map(params![id], read_generation_row)
            .context("Failed to query plan generation")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read plan generation row")?;
                Ok(Some(r.into_generation()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_generations(&self, plan_id: i64) -> Result<Vec<PlanGeneration>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM plan_generations
                 WHERE plan_id = ?1 ORDER BY id DESC"
            ))
            .context("Failed to prepare list_generations")?;
        let rows = stmt
            .query_map(params![plan_id], read_generation_row)
            .context("Failed to query plan generations")?;
        let mut generations = Vec::new();
        for row in rows {
            let r = row.context("Failed to read plan generation row")?;
            generations.push(r.into_generation()?);
        }
        Ok(generations)
    }

    /// Most recent completed generation for a plan, used as the fallback
    /// source when no generation is explicitly selected.
    pub fn latest_completed_generation(&self, plan_id: i64) -> Result<Option<PlanGeneration>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {GENERATION_COLUMNS} FROM plan_generations
                 WHERE plan_id = ?1 AND status = 'completed'
                 ORDER BY id DESC LIMIT 1"
            ))
            .context("Failed to prepare latest_completed_generation")?;
        let mut rows = stmt
            .query_map(params![plan_id], read_generation_row)
            .context("Failed to query latest completed generation")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read plan generation row")?;
                Ok(Some(r.into_generation()?))
            }
            None => Ok(None),
        }
    }

    // ── Stuck-session reaping ─────────────────────────────────────────

    /// Fail every processing attempt in all three session tables created
    /// strictly before `cutoff`. Timestamps are RFC3339 UTC with fixed
    /// width, so string comparison in SQLite matches chronological order.
    pub fn reap_stuck(&self, cutoff: &str, message: &str, now: &str) -> Result<ReapSummary> {
        let refinements = self
            .conn
            .execute(
                "UPDATE feature_refinements
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE status = 'processing' AND created_at < ?3",
                params![message, now, cutoff],
            )
            .context("Failed to reap refinements")?;
        let discovery = self
            .conn
            .execute(
                "UPDATE file_discovery_sessions
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE status = 'processing' AND created_at < ?3",
                params![message, now, cutoff],
            )
            .context("Failed to reap discovery sessions")?;
        let generations = self
            .conn
            .execute(
                "UPDATE plan_generations
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE status = 'processing' AND created_at < ?3",
                params![message, now, cutoff],
            )
            .context("Failed to reap plan generations")?;
        Ok(ReapSummary {
            refinements_reaped: refinements,
            discovery_sessions_reaped: discovery,
            generations_reaped: generations,
            total: refinements + discovery + generations,
        })
    }

    // ── Agent personas ────────────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &AgentConfig) -> Result<AgentConfig> {
        let tools_json =
            serde_json::to_string(&agent.tools).context("Failed to serialize agent tools")?;
        self.conn
            .execute(
                "INSERT INTO agent_configs
                     (agent_id, user_id, name, role, focus, system_prompt, temperature, tools,
                      is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
                 ON CONFLICT(user_id, agent_id) DO UPDATE SET
                     name = ?3, role = ?4, focus = ?5, system_prompt = ?6,
                     temperature = ?7, tools = ?8, is_active = 1, updated_at = ?10",
                params![
                    agent.agent_id,
                    agent.user_id,
                    agent.name,
                    agent.role,
                    agent.focus,
                    agent.system_prompt,
                    agent.temperature,
                    tools_json,
                    agent.created_at,
                    agent.updated_at
                ],
            )
            .context("Failed to upsert agent config")?;
        self.get_agent(&agent.user_id, &agent.agent_id)?
            .context("Agent config not found after upsert")
    }

    pub fn get_agent(&self, user_id: &str, agent_id: &str) -> Result<Option<AgentConfig>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agent_configs WHERE user_id = ?1 AND agent_id = ?2"
            ))
            .context("Failed to prepare get_agent")?;
        let mut rows = stmt
            .query_map(params![user_id, agent_id], read_agent_row)
            .context("Failed to query agent config")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read agent config row")?;
                Ok(Some(r.into_agent()?))
            }
            None => Ok(None),
        }
    }

    /// Active personas for a user, ordered by creation.
    pub fn list_agents(&self, user_id: &str) -> Result<Vec<AgentConfig>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agent_configs
                 WHERE user_id = ?1 AND is_active = 1 ORDER BY created_at, agent_id"
            ))
            .context("Failed to prepare list_agents")?;
        let rows = stmt
            .query_map(params![user_id], read_agent_row)
            .context("Failed to query agent configs")?;
        let mut agents = Vec::new();
        for row in rows {
            let r = row.context("Failed to read agent config row")?;
            agents.push(r.into_agent()?);
        }
        Ok(agents)
    }

    /// Soft delete: the row stays so historic sessions keep a resolvable
    /// agent reference. Returns false when no active row matched.
    pub fn deactivate_agent(&self, user_id: &str, agent_id: &str, now: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE agent_configs SET is_active = 0, updated_at = ?1
                 WHERE user_id = ?2 AND agent_id = ?3 AND is_active = 1",
                params![now, user_id, agent_id],
            )
            .context("Failed to deactivate agent config")?;
        Ok(count > 0)
    }
}

/// Token and latency accounting reported by a finished agent call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub execution_time_ms: Option<i64>,
}

// ── Internal row helpers ──────────────────────────────────────────────

const PLAN_COLUMNS: &str = "id, user_id, original_request, refined_request, \
    selected_refinement_id, selected_discovery_session_id, discovered_files, \
    selected_plan_generation_id, implementation_plan, complexity, risk_level, \
    estimated_duration, created_at, updated_at";

const REFINEMENT_COLUMNS: &str = "id, plan_id, agent_id, model, status, input_request, \
    refined_request, prompt_tokens, completion_tokens, total_tokens, execution_time_ms, \
    error_message, created_at, completed_at";

const SESSION_COLUMNS: &str = "id, plan_id, agent_id, model, status, discovered_files, \
    total_files_found, prompt_tokens, completion_tokens, total_tokens, execution_time_ms, \
    error_message, created_at, completed_at";

const GENERATION_COLUMNS: &str = "id, plan_id, agent_id, model, status, implementation_plan, \
    complexity, risk_level, estimated_duration, prompt_tokens, completion_tokens, total_tokens, \
    execution_time_ms, error_message, created_at, completed_at";

const AGENT_COLUMNS: &str = "agent_id, user_id, name, role, focus, system_prompt, temperature, \
    tools, is_active, created_at, updated_at";

/// Intermediate row struct for feature_plans before converting the JSON and
/// enum columns into typed values.
struct PlanRow {
    id: i64,
    user_id: String,
    original_request: String,
    refined_request: Option<String>,
    selected_refinement_id: Option<i64>,
    selected_discovery_session_id: Option<i64>,
    discovered_files: Option<String>,
    selected_plan_generation_id: Option<i64>,
    implementation_plan: Option<String>,
    complexity: Option<String>,
    risk_level: Option<String>,
    estimated_duration: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok(PlanRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        original_request: row.get(2)?,
        refined_request: row.get(3)?,
        selected_refinement_id: row.get(4)?,
        selected_discovery_session_id: row.get(5)?,
        discovered_files: row.get(6)?,
        selected_plan_generation_id: row.get(7)?,
        implementation_plan: row.get(8)?,
        complexity: row.get(9)?,
        risk_level: row.get(10)?,
        estimated_duration: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl PlanRow {
    fn into_plan(self) -> Result<FeaturePlan> {
        let discovered_files = match self.discovered_files {
            Some(json) => Some(
                serde_json::from_str(&json)
                    .with_context(|| format!("corrupt discovered_files JSON '{}'", json))?,
            ),
            None => None,
        };
        let complexity = match self.complexity {
            Some(s) => Some(
                Complexity::from_str(&s)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse plan complexity")?,
            ),
            None => None,
        };
        let risk_level = match self.risk_level {
            Some(s) => Some(
                RiskLevel::from_str(&s)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse plan risk level")?,
            ),
            None => None,
        };
        Ok(FeaturePlan {
            id: self.id,
            user_id: self.user_id,
            original_request: self.original_request,
            refined_request: self.refined_request,
            selected_refinement_id: self.selected_refinement_id,
            selected_discovery_session_id: self.selected_discovery_session_id,
            discovered_files,
            selected_plan_generation_id: self.selected_plan_generation_id,
            implementation_plan: self.implementation_plan,
            complexity,
            risk_level,
            estimated_duration: self.estimated_duration,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Intermediate row struct for feature_refinements.
struct RefinementRow {
    id: i64,
    plan_id: i64,
    agent_id: String,
    model: Option<String>,
    status: String,
    input_request: String,
    refined_request: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn read_refinement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RefinementRow> {
    Ok(RefinementRow {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        agent_id: row.get(2)?,
        model: row.get(3)?,
        status: row.get(4)?,
        input_request: row.get(5)?,
        refined_request: row.get(6)?,
        prompt_tokens: row.get(7)?,
        completion_tokens: row.get(8)?,
        total_tokens: row.get(9)?,
        execution_time_ms: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl RefinementRow {
    fn into_refinement(self) -> Result<FeatureRefinement> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse refinement status")?;
        Ok(FeatureRefinement {
            id: self.id,
            plan_id: self.plan_id,
            agent_id: self.agent_id,
            model: self.model,
            status,
            input_request: self.input_request,
            refined_request: self.refined_request,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            execution_time_ms: self.execution_time_ms,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for file_discovery_sessions.
struct SessionRow {
    id: i64,
    plan_id: i64,
    agent_id: String,
    model: Option<String>,
    status: String,
    discovered_files: String,
    total_files_found: i64,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        agent_id: row.get(2)?,
        model: row.get(3)?,
        status: row.get(4)?,
        discovered_files: row.get(5)?,
        total_files_found: row.get(6)?,
        prompt_tokens: row.get(7)?,
        completion_tokens: row.get(8)?,
        total_tokens: row.get(9)?,
        execution_time_ms: row.get(10)?,
        error_message: row.get(11)?,
        created_at: row.get(12)?,
        completed_at: row.get(13)?,
    })
}

impl SessionRow {
    fn into_session(self) -> Result<FileDiscoverySession> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse discovery session status")?;
        let discovered_files: Vec<DiscoveredFile> = serde_json::from_str(&self.discovered_files)
            .with_context(|| format!("corrupt discovered_files JSON '{}'", self.discovered_files))?;
        Ok(FileDiscoverySession {
            id: self.id,
            plan_id: self.plan_id,
            agent_id: self.agent_id,
            model: self.model,
            status,
            discovered_files,
            total_files_found: self.total_files_found,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            execution_time_ms: self.execution_time_ms,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for plan_generations.
struct GenerationRow {
    id: i64,
    plan_id: i64,
    agent_id: String,
    model: Option<String>,
    status: String,
    implementation_plan: Option<String>,
    complexity: Option<String>,
    risk_level: Option<String>,
    estimated_duration: Option<String>,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    execution_time_ms: Option<i64>,
    error_message: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn read_generation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GenerationRow> {
    Ok(GenerationRow {
        id: row.get(0)?,
        plan_id: row.get(1)?,
        agent_id: row.get(2)?,
        model: row.get(3)?,
        status: row.get(4)?,
        implementation_plan: row.get(5)?,
        complexity: row.get(6)?,
        risk_level: row.get(7)?,
        estimated_duration: row.get(8)?,
        prompt_tokens: row.get(9)?,
        completion_tokens: row.get(10)?,
        total_tokens: row.get(11)?,
        execution_time_ms: row.get(12)?,
        error_message: row.get(13)?,
        created_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

impl GenerationRow {
    fn into_generation(self) -> Result<PlanGeneration> {
        let status = SessionStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse plan generation status")?;
        let complexity = match self.complexity {
            Some(s) => Some(
                Complexity::from_str(&s)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse generation complexity")?,
            ),
            None => None,
        };
        let risk_level = match self.risk_level {
            Some(s) => Some(
                RiskLevel::from_str(&s)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse generation risk level")?,
            ),
            None => None,
        };
        Ok(PlanGeneration {
            id: self.id,
            plan_id: self.plan_id,
            agent_id: self.agent_id,
            model: self.model,
            status,
            implementation_plan: self.implementation_plan,
            complexity,
            risk_level,
            estimated_duration: self.estimated_duration,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            execution_time_ms: self.execution_time_ms,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Intermediate row struct for agent_configs.
struct AgentRow {
    agent_id: String,
    user_id: String,
    name: String,
    role: String,
    focus: String,
    system_prompt: String,
    temperature: f64,
    tools: String,
    is_active: i64,
    created_at: String,
    updated_at: String,
}

fn read_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        agent_id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        role: row.get(3)?,
        focus: row.get(4)?,
        system_prompt: row.get(5)?,
        temperature: row.get(6)?,
        tools: row.get(7)?,
        is_active: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl AgentRow {
    fn into_agent(self) -> Result<AgentConfig> {
        let tools: Vec<AgentTool> = serde_json::from_str(&self.tools)
            .with_context(|| format!("corrupt agent tools JSON '{}'", self.tools))?;
        Ok(AgentConfig {
            agent_id: self.agent_id,
            user_id: self.user_id,
            name: self.name,
            role: self.role,
            focus: self.focus,
            system_prompt: self.system_prompt,
            temperature: self.temperature,
            tools,
            is_active: self.is_active != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
