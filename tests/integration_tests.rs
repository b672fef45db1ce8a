//! Integration tests for orchestrate
//!
//! Each test drives the binary against a temporary project whose executor
//! is a `sh -c` script, so phases finish in milliseconds.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create an orchestrate Command with a clean environment
fn orchestrate(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("orchestrate");
    cmd.current_dir(dir.path());
    for key in [
        "ORCHESTRATE_PROJECT_DIR",
        "ORCHESTRATE_STATE_DIR",
        "ORCHESTRATE_PIPELINE",
        "ORCHESTRATE_PHASE",
        "ORCHESTRATE_RUN_ID",
        "ORCHESTRATE_ALLOWED_PATHS",
        "ORCHESTRATE_EXECUTOR_CMD",
        "ORCHESTRATE_MAX_CYCLES",
        "CLAUDE_TOOL_NAME",
        "CLAUDE_TOOL_INPUT",
    ] {
        cmd.env_remove(key);
    }
    cmd
}

/// Helper to create a project whose executor runs `script` under `sh -c`
fn project_with_executor(script: &str, extra: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let state = dir.path().join(".orchestrate");
    fs::create_dir_all(&state).unwrap();
    let config = format!(
        "[executor]\ncommand = \"sh\"\nargs = [\"-c\", {:?}]\nallowed_tools_flag = \"\"\n{}",
        script, extra
    );
    fs::write(state.join("orchestrate.toml"), config).unwrap();
    dir
}

fn write_backlog(dir: &TempDir, rows: &[&str]) {
    let mut content = String::from(
        "# Backlog\n\n| Priority | Construction | Spec File | Status | Depends On | Notes |\n|---|---|---|---|---|---|\n",
    );
    for row in rows {
        content.push_str(row);
        content.push('\n');
    }
    fs::write(dir.path().join("BACKLOG.md"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("program"))
            .stdout(predicate::str::contains("pump"));
    }

    #[test]
    fn test_init_creates_layout() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("orchestrate.toml"));

        assert!(dir.path().join(".orchestrate/orchestrate.toml").exists());
        assert!(dir.path().join(".orchestrate/interop/requests").is_dir());
        assert!(dir.path().join("BACKLOG.md").exists());

        // second run writes nothing
        orchestrate(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing written"));
    }

    #[test]
    fn test_pipelines_lists_builtins() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("pipelines")
            .assert()
            .success()
            .stdout(predicate::str::contains("tdd"))
            .stdout(predicate::str::contains("research"))
            .stdout(predicate::str::contains("math"));
    }
}

// =============================================================================
// Phase Execution Tests
// =============================================================================

mod phases {
    use super::*;

    #[test]
    fn test_phase_success_records_run() {
        let dir = project_with_executor("cat > /dev/null; echo working", "");
        orchestrate(&dir)
            .args(["--task", "P1", "tdd", "red"])
            .assert()
            .success();

        orchestrate(&dir)
            .args(["--json", "runs"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"phase\": \"red\""))
            .stdout(predicate::str::contains("\"task\": \"P1\""));
    }

    #[test]
    fn test_executor_exit_code_fails_phase() {
        let dir = project_with_executor("exit 3", "");
        orchestrate(&dir).args(["tdd", "green"]).assert().code(1);
    }

    #[test]
    fn test_watchdog_exits_124() {
        let dir = project_with_executor("sleep 10", "phase_timeout_secs = 1\n");
        orchestrate(&dir).args(["tdd", "red"]).assert().code(124);
    }

    #[test]
    fn test_unknown_pipeline_and_phase_are_usage_errors() {
        let dir = project_with_executor("exit 0", "");
        orchestrate(&dir)
            .arg("nope")
            .assert()
            .code(2)
            .stderr(predicate::str::contains("tdd"));
        orchestrate(&dir)
            .args(["tdd", "deploy"])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("red"));
    }

    #[test]
    fn test_whole_pipeline_runs_every_phase() {
        let dir = project_with_executor("exit 0", "");
        orchestrate(&dir)
            .args(["tdd"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        let runs = fs::read_dir(dir.path().join(".orchestrate/runs")).unwrap().count();
        assert_eq!(runs, 4);
    }

    #[test]
    fn test_executor_sees_phase_environment() {
        let dir = project_with_executor(
            "echo \"$ORCHESTRATE_PIPELINE/$ORCHESTRATE_PHASE/$ORCHESTRATE_ARGS\" > seen.txt",
            "",
        );
        orchestrate(&dir)
            .args(["research", "survey", "alpha", "beta"])
            .assert()
            .success();
        let seen = fs::read_to_string(dir.path().join("seen.txt")).unwrap();
        assert_eq!(seen.trim(), "research/survey/alpha beta");
    }
}

// =============================================================================
// Guard Hook Tests
// =============================================================================

mod guard {
    use super::*;

    #[test]
    fn test_guard_allows_outside_a_phase() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("guard")
            .env("CLAUDE_TOOL_NAME", "Write")
            .env("CLAUDE_TOOL_INPUT", r#"{"file_path":"src/lib.rs"}"#)
            .assert()
            .success();
    }

    #[test]
    fn test_guard_blocks_read_only_write() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("guard")
            .env("ORCHESTRATE_PROJECT_DIR", dir.path())
            .env("ORCHESTRATE_PIPELINE", "tdd")
            .env("ORCHESTRATE_PHASE", "red")
            .env("ORCHESTRATE_RUN_ID", "run-x")
            .env("CLAUDE_TOOL_NAME", "Write")
            .env("CLAUDE_TOOL_INPUT", r#"{"file_path":"src/lib.rs","content":"x"}"#)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("BLOCKED"));
    }

    #[test]
    fn test_guard_reads_stdin_payload() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .arg("guard")
            .env("ORCHESTRATE_PROJECT_DIR", dir.path())
            .env("ORCHESTRATE_PIPELINE", "tdd")
            .env("ORCHESTRATE_PHASE", "red")
            .write_stdin(r#"{"tool_name":"Write","tool_input":{"file_path":"tests/a_test.rs"}}"#)
            .assert()
            .success();
    }
}

// =============================================================================
// Interop Tests
// =============================================================================

mod interop {
    use super::*;

    #[test]
    fn test_request_then_pump() {
        let dir = project_with_executor("echo \"$ORCHESTRATE_PIPELINE\" > child.txt", "");
        orchestrate(&dir)
            .args([
                "request",
                "--from",
                "tdd",
                "--to",
                "research",
                "--action",
                "survey",
                "--id",
                "rq-20260101T000000Z-abc123",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("rq-20260101T000000Z-abc123"));

        orchestrate(&dir)
            .args(["--json", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rq-20260101T000000Z-abc123"));

        orchestrate(&dir)
            .arg("pump")
            .assert()
            .success()
            .stdout(predicate::str::contains("ok"));
        assert_eq!(
            fs::read_to_string(dir.path().join("child.txt")).unwrap().trim(),
            "research"
        );
        assert!(
            dir.path()
                .join(".orchestrate/interop/responses/rq-20260101T000000Z-abc123.json")
                .exists()
        );

        orchestrate(&dir)
            .arg("pump")
            .assert()
            .success()
            .stdout(predicate::str::contains("No pending requests"));
    }

    #[test]
    fn test_request_without_source_is_usage_error() {
        let dir = project_with_executor("exit 0", "");
        orchestrate(&dir)
            .args(["request", "--to", "research", "--action", "survey"])
            .assert()
            .code(2);
    }

    #[test]
    fn test_missing_deliverable_fails_request() {
        let dir = project_with_executor("exit 0", "");
        orchestrate(&dir)
            .args([
                "request",
                "--from",
                "tdd",
                "--to",
                "research",
                "--action",
                "survey",
                "--deliverable",
                "docs/survey.md",
            ])
            .assert()
            .success();

        orchestrate(&dir)
            .arg("pump")
            .assert()
            .code(1)
            .stdout(predicate::str::contains("docs/survey.md"));
    }
}

// =============================================================================
// Program Scheduler Tests
// =============================================================================

mod program {
    use super::*;

    const PROGRAM: &str = "[program]\npipeline = \"tdd\"\n";

    #[test]
    fn test_dry_run_shows_order() {
        let dir = project_with_executor("exit 0", PROGRAM);
        write_backlog(
            &dir,
            &[
                "| P2 | Second | | not-started | P1 | |",
                "| P1 | First | | not-started | — | |",
            ],
        );
        orchestrate(&dir)
            .args(["program", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Next: P1"));
        // dry run never touches the backlog
        let backlog = fs::read_to_string(dir.path().join("BACKLOG.md")).unwrap();
        assert!(!backlog.contains("| done |"));
    }

    #[test]
    fn test_program_converges() {
        let dir = project_with_executor("exit 0", PROGRAM);
        write_backlog(
            &dir,
            &[
                "| P1 | First | | not-started | — | |",
                "| P2 | Second | | not-started | P1 | |",
            ],
        );
        orchestrate(&dir)
            .arg("program")
            .assert()
            .success()
            .stdout(predicate::str::contains("converged"));

        let backlog = fs::read_to_string(dir.path().join("BACKLOG.md")).unwrap();
        assert_eq!(backlog.matches("| done |").count(), 2);
        assert!(dir.path().join(".orchestrate/program/SYNTHESIS_READY").exists());
    }

    #[test]
    fn test_program_stops_on_handoff() {
        let dir = project_with_executor("exit 0", PROGRAM);
        write_backlog(&dir, &["| P1 | First | | not-started | — | |"]);
        fs::write(dir.path().join("HANDOFF.md"), "please look\n").unwrap();
        orchestrate(&dir)
            .arg("program")
            .assert()
            .success()
            .stdout(predicate::str::contains("handoff"));
        assert!(dir.path().join(".orchestrate/runs").read_dir().unwrap().next().is_none());
    }

    #[test]
    fn test_max_cycles_flag() {
        let dir = project_with_executor("exit 0", PROGRAM);
        write_backlog(
            &dir,
            &[
                "| P1 | First | | not-started | — | |",
                "| P2 | Second | | not-started | — | |",
            ],
        );
        orchestrate(&dir)
            .args(["program", "--max-cycles", "1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("max cycles"));
    }
}

// =============================================================================
// Locks and Config Tests
// =============================================================================

mod admin {
    use super::*;

    #[test]
    fn test_locks_empty_after_phase() {
        let dir = project_with_executor("exit 0", "");
        orchestrate(&dir).args(["tdd", "green"]).assert().success();
        orchestrate(&dir)
            .args(["locks", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No locks held"));
        orchestrate(&dir)
            .args(["locks", "release", "--holder", "run-gone"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Released 0 grant(s)"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = project_with_executor("exit 0", "[program]\npipeline = \"nope\"\n");
        orchestrate(&dir)
            .args(["config", "validate"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("nope"));
    }

    #[test]
    fn test_config_show_reflects_env() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .args(["config", "show"])
            .env("ORCHESTRATE_MAX_REVISIONS", "7")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_revisions = 7"));
    }

    #[test]
    fn test_invalid_env_override_fails() {
        let dir = TempDir::new().unwrap();
        orchestrate(&dir)
            .args(["config", "show"])
            .env("ORCHESTRATE_MAX_CYCLES", "many")
            .assert()
            .failure()
            .stderr(predicate::str::contains("ORCHESTRATE_MAX_CYCLES"));
    }
}
