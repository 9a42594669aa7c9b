use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::db::DbHandle;
use super::models::ReapSummary;
use crate::config::ReaperConfig;

/// Error message written onto every reaped session.
pub const REAP_MESSAGE: &str = "Session timed out and was automatically marked as failed";

/// Fail every processing session whose lease expired as of `now`. A session
/// created exactly at the threshold boundary keeps its lease; expiry is
/// strict.
pub async fn sweep(
    db: &DbHandle,
    threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<ReapSummary> {
    let cutoff = (now - threshold).to_rfc3339_opts(SecondsFormat::Millis, true);
    let now_s = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    db.call(move |db| db.reap_stuck(&cutoff, REAP_MESSAGE, &now_s))
        .await
}

/// Periodic sweep loop. Runs for the lifetime of the server; a failed sweep
/// is logged and retried on the next tick.
pub fn spawn(db: DbHandle, config: ReaperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match sweep(&db, config.stuck_threshold(), Utc::now()).await {
                Ok(summary) if summary.total > 0 => {
                    info!(
                        refinements = summary.refinements_reaped,
                        discovery = summary.discovery_sessions_reaped,
                        generations = summary.generations_reaped,
                        "reaped stuck sessions"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("reaper sweep failed: {:#}", e),
            }
        }
    })
}
