//! End-to-end tests exercising the binary and the persisted database.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn plansmith() -> Command {
    Command::cargo_bin("plansmith").unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        plansmith().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        plansmith().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        plansmith().arg("frobnicate").assert().failure();
    }
}

mod reap_command {
    use super::*;

    #[test]
    fn test_reap_on_fresh_database_reports_zero() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("plansmith.db");

        plansmith()
            .current_dir(dir.path())
            .args(["reap", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"total\": 0"));

        // The database file is created on first use.
        assert!(db_path.exists());
    }

    #[test]
    fn test_reap_fails_stale_processing_sessions() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("plansmith.db");

        // Seed a processing session two hours in the past through the
        // library, then reap it through the binary.
        {
            use plansmith::pipeline::db::PlannerDb;
            let db = PlannerDb::new(&db_path).unwrap();
            let old = (chrono::Utc::now() - chrono::Duration::hours(2))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let plan = db.create_plan("user-1", "add CSV export", &old).unwrap();
            db.create_discovery_session(plan.id, "d-stale", None, &old)
                .unwrap();
        }

        plansmith()
            .current_dir(dir.path())
            .args(["reap", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"discoverySessionsReaped\": 1"));

        // A second sweep finds nothing left.
        plansmith()
            .current_dir(dir.path())
            .args(["reap", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"total\": 0"));
    }

    #[test]
    fn test_reap_threshold_override() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("plansmith.db");

        {
            use plansmith::pipeline::db::PlannerDb;
            let db = PlannerDb::new(&db_path).unwrap();
            let recent = (chrono::Utc::now() - chrono::Duration::seconds(30))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let plan = db.create_plan("user-1", "add CSV export", &recent).unwrap();
            db.create_generation(plan.id, "g-young", None, &recent).unwrap();
        }

        // Default threshold (600s) leaves the 30s-old session alone.
        plansmith()
            .current_dir(dir.path())
            .args(["reap", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"total\": 0"));

        // A 10s threshold sweeps it.
        plansmith()
            .current_dir(dir.path())
            .args(["reap", "--stuck-threshold-secs", "10", "--db-path"])
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"generationsReaped\": 1"));
    }
}
