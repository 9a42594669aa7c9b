//! Feature planning pipeline — refine, discover, plan.
//!
//! ## Overview
//!
//! A feature request moves through three agent-backed stages: refinement
//! rewrites the raw request through a set of personas (one parallel attempt
//! per persona), discovery maps the request onto the relevant files, and
//! generation produces an implementation plan. Every attempt at every stage
//! is persisted as its own row; the plan itself only changes when a
//! candidate is explicitly selected.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, reaper spawn)        │
//! └──────────┘          │    └─ api.rs (route handlers, AppState)        │
//!                       │         │                                      │
//!                       │         v                                      │
//!                       │  orchestrator.rs (ownership, selection,        │
//!                       │                   stage coordination)          │
//!                       │         │                                      │
//!                       │         v                                      │
//!                       │  stage.rs (prompts, deadlines, settle-then-    │
//!                       │            raise persistence)                  │
//!                       │         │                                      │
//!                       │         v                                      │
//!                       │  agent.rs (AgentCapability trait, claude CLI)  │
//!                       └────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                            |
//! |----------|-----------------------------------------------------------|
//! | `models` | Shared types: `FeaturePlan`, `SessionStatus`, personas    |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `reaper` | Lease expiry: fails processing rows past the threshold    |

pub mod agent;
pub mod api;
pub mod db;
pub mod models;
pub mod orchestrator;
pub mod reaper;
pub mod server;
pub mod stage;
