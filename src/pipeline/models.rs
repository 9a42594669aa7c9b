use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Current time as RFC3339 UTC with millisecond precision. Fixed width, so
/// stored timestamps compare lexicographically in chronological order.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The three pipeline stages. Each stage invocation is one external agent
/// call persisted as its own record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Refine,
    Discover,
    Plan,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Discover => "discover",
            Self::Plan => "plan",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refine" => Ok(Self::Refine),
            "discover" => Ok(Self::Discover),
            "plan" => Ok(Self::Plan),
            _ => Err(format!("Invalid stage kind: {}", s)),
        }
    }
}

/// Lifecycle of one refinement, discovery, or plan generation attempt.
/// `Processing` is a soft lock with an implicit TTL: the reaper fails rows
/// that stay in it past the lease threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses carry a `completed_at` timestamp; non-terminal
    /// statuses never do.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePriority {
    Critical,
    High,
    Medium,
    Low,
}

impl FilePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl FromStr for FilePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid file priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid complexity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid risk level: {}", s)),
        }
    }
}

/// Tools an agent persona may be granted. Closed set; stage prompts never
/// grant anything outside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AgentTool {
    Read,
    Grep,
    Glob,
}

impl AgentTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "Read",
            Self::Grep => "Grep",
            Self::Glob => "Glob",
        }
    }
}

impl FromStr for AgentTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Read" => Ok(Self::Read),
            "Grep" => Ok(Self::Grep),
            "Glob" => Ok(Self::Glob),
            _ => Err(format!("Invalid agent tool: {}", s)),
        }
    }
}

/// One file surfaced by a discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    pub file_path: String,
    pub relevance_score: i64,
    pub priority: FilePriority,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub integration_point: Option<String>,
    #[serde(default)]
    pub file_exists: Option<bool>,
}

/// Aggregate root of one planning effort. The `complexity`/`risk_level`/
/// `estimated_duration` fields are denormalized copies taken from the
/// selected generation at selection time, not live references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturePlan {
    pub id: i64,
    pub user_id: String,
    pub original_request: String,
    pub refined_request: Option<String>,
    pub selected_refinement_id: Option<i64>,
    pub selected_discovery_session_id: Option<i64>,
    pub discovered_files: Option<Vec<DiscoveredFile>>,
    pub selected_plan_generation_id: Option<i64>,
    pub implementation_plan: Option<String>,
    pub complexity: Option<Complexity>,
    pub risk_level: Option<RiskLevel>,
    pub estimated_duration: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Explicit plan progression, derived from field presence. The underlying
/// row has no status column; this keeps the transition logic in one place
/// instead of scattered null-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStage {
    Created,
    Discovered,
    Planned,
}

impl FeaturePlan {
    pub fn stage(&self) -> PlanStage {
        if self.selected_plan_generation_id.is_some() {
            PlanStage::Planned
        } else if self.selected_discovery_session_id.is_some() {
            PlanStage::Discovered
        } else {
            PlanStage::Created
        }
    }

    /// Text fed to the discovery and planning agents: the refined request
    /// when one was adopted, the original otherwise.
    pub fn request_text(&self) -> &str {
        self.refined_request
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.original_request)
    }
}

/// One attempt at the refinement stage. Attempts run in parallel, one per
/// persona; the plan adopts a candidate's text only through selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRefinement {
    pub id: i64,
    pub plan_id: i64,
    pub agent_id: String,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub input_request: String,
    pub refined_request: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One attempt at the discovery stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiscoverySession {
    pub id: i64,
    pub plan_id: i64,
    pub agent_id: String,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub discovered_files: Vec<DiscoveredFile>,
    pub total_files_found: i64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// One attempt at the plan-generation stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanGeneration {
    pub id: i64,
    pub plan_id: i64,
    pub agent_id: String,
    pub model: Option<String>,
    pub status: SessionStatus,
    pub implementation_plan: Option<String>,
    pub complexity: Option<Complexity>,
    pub risk_level: Option<RiskLevel>,
    pub estimated_duration: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// Reusable agent persona. Deleted by flipping `is_active` off; the row is
/// never removed so historic sessions keep a resolvable reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub agent_id: String,
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub focus: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub tools: Vec<AgentTool>,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl AgentConfig {
    /// Built-in personas used when a user has configured none of their own.
    pub fn defaults(user_id: &str, now: &str) -> Vec<AgentConfig> {
        let persona = |agent_id: &str, name: &str, role: &str, focus: &str, prompt: &str, temperature: f64, tools: Vec<AgentTool>| AgentConfig {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            focus: focus.to_string(),
            system_prompt: prompt.to_string(),
            temperature,
            tools,
            is_active: true,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        };
        vec![
            persona(
                "technical-architect",
                "Technical Architecture Agent",
                "Senior Software Architect",
                "Technical feasibility, system design, implementation patterns",
                "You are a senior software architect analyzing feature requests. \
                 Focus on technical feasibility, integration points with the existing \
                 codebase, performance, and required infrastructure.",
                0.7,
                vec![AgentTool::Read, AgentTool::Grep, AgentTool::Glob],
            ),
            persona(
                "product-manager",
                "Product Management Agent",
                "Senior Product Manager",
                "User value, requirements clarity, acceptance criteria",
                "You are a senior product manager refining feature requests. \
                 Focus on user value, clear functional requirements, acceptance \
                 criteria, edge cases, and explicit scope boundaries.",
                1.0,
                vec![],
            ),
            persona(
                "test-engineer",
                "Testing & Quality Agent",
                "Senior Test Engineer",
                "Testability, quality assurance, edge cases",
                "You are a test engineer analyzing feature requests. Focus on \
                 testability, critical edge cases, quality gates, and test data \
                 requirements.",
                0.8,
                vec![AgentTool::Read],
            ),
        ]
    }
}

/// Summary returned by the stuck-session reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapSummary {
    pub refinements_reaped: usize,
    pub discovery_sessions_reaped: usize,
    pub generations_reaped: usize,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_roundtrip() {
        for s in &["pending", "processing", "completed", "failed"] {
            let parsed: SessionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_stage_kind_roundtrip() {
        for s in &["refine", "discover", "plan"] {
            let parsed: StageKind = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("deploy".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_file_priority_roundtrip() {
        for s in &["critical", "high", "medium", "low"] {
            let parsed: FilePriority = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("urgent".parse::<FilePriority>().is_err());
    }

    #[test]
    fn test_agent_tool_roundtrip() {
        for s in &["Read", "Grep", "Glob"] {
            let parsed: AgentTool = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("Bash".parse::<AgentTool>().is_err());
        // lowercase is rejected: tool names are case-sensitive
        assert!("read".parse::<AgentTool>().is_err());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&FilePriority::Critical).unwrap(),
            "\"critical\""
        );
        assert_eq!(
            serde_json::to_string(&Complexity::Medium).unwrap(),
            "\"medium\""
        );
        assert_eq!(
            serde_json::to_string(&AgentTool::Glob).unwrap(),
            "\"Glob\""
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Pending.is_terminal());
        assert!(!SessionStatus::Processing.is_terminal());
    }

    fn bare_plan() -> FeaturePlan {
        FeaturePlan {
            id: 1,
            user_id: "user-1".into(),
            original_request: "add CSV export".into(),
            refined_request: None,
            selected_refinement_id: None,
            selected_discovery_session_id: None,
            discovered_files: None,
            selected_plan_generation_id: None,
            implementation_plan: None,
            complexity: None,
            risk_level: None,
            estimated_duration: None,
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }

    #[test]
    fn test_plan_stage_progression() {
        let mut plan = bare_plan();
        assert_eq!(plan.stage(), PlanStage::Created);

        plan.selected_discovery_session_id = Some(10);
        assert_eq!(plan.stage(), PlanStage::Discovered);

        plan.selected_plan_generation_id = Some(20);
        assert_eq!(plan.stage(), PlanStage::Planned);
    }

    #[test]
    fn test_plan_stage_generation_wins_over_discovery() {
        // A plan with only a generation selected still counts as planned;
        // the stage function is exhaustive over field presence.
        let mut plan = bare_plan();
        plan.selected_plan_generation_id = Some(20);
        assert_eq!(plan.stage(), PlanStage::Planned);
    }

    #[test]
    fn test_request_text_prefers_refined() {
        let mut plan = bare_plan();
        assert_eq!(plan.request_text(), "add CSV export");

        plan.refined_request = Some("add CSV export with column selection".into());
        assert_eq!(plan.request_text(), "add CSV export with column selection");

        // Whitespace-only refinement falls back to the original.
        plan.refined_request = Some("   ".into());
        assert_eq!(plan.request_text(), "add CSV export");
    }

    #[test]
    fn test_discovered_file_deserializes_with_optional_fields() {
        let json = r#"{"filePath": "src/export.rs", "relevanceScore": 90, "priority": "high"}"#;
        let file: DiscoveredFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.file_path, "src/export.rs");
        assert_eq!(file.priority, FilePriority::High);
        assert!(file.role.is_none());
        assert!(file.file_exists.is_none());
    }

    #[test]
    fn test_default_personas_are_active_and_valid() {
        let personas = AgentConfig::defaults("user-1", "2026-01-01T00:00:00.000Z");
        assert!(!personas.is_empty());
        for p in &personas {
            assert!(p.is_active);
            assert!((0.0..=1.0).contains(&p.temperature));
            assert!(!p.system_prompt.trim().is_empty());
        }
    }
}
