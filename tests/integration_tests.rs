//! Integration tests for the leadboard binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Helper to create a leadboard Command with a clean environment.
fn leadboard() -> Command {
    let mut cmd = cargo_bin_cmd!("leadboard");
    cmd.env_remove("LEADBOARD_PORT")
        .env_remove("LEADBOARD_DB_PATH")
        .env_remove("STRIPE_WEBHOOK_SECRET")
        .env_remove("LEADBOARD_MAIL_RELAY_URL");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_leadboard_help() {
        leadboard()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init"));
    }

    #[test]
    fn test_leadboard_version() {
        leadboard()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("leadboard"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        leadboard().arg("frobnicate").assert().failure();
    }
}

mod init {
    use super::*;

    #[test]
    fn test_init_creates_database_and_config() {
        let dir = TempDir::new().unwrap();

        leadboard()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Leadboard database initialized"));

        assert!(dir.path().join(".leadboard/leadboard.db").exists());
        let config = std::fs::read_to_string(dir.path().join("leadboard.toml")).unwrap();
        assert!(config.contains("[pipeline]"));
        assert!(config.contains("intake_stage_label = \"Nuevo\""));
    }

    #[test]
    fn test_init_respects_db_path_flag() {
        let dir = TempDir::new().unwrap();

        leadboard()
            .current_dir(dir.path())
            .args(["init", "--db-path", "data/crm.db"])
            .assert()
            .success();

        assert!(dir.path().join("data/crm.db").exists());
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("leadboard.toml");
        std::fs::write(&config_path, "[server]\nport = 4000\n").unwrap();

        leadboard()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote default configuration").not());

        let config = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(config, "[server]\nport = 4000\n");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("leadboard.toml"), "[server\nport = ").unwrap();

        leadboard()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .failure()
            .stderr(predicate::str::contains("leadboard.toml"));
    }
}
