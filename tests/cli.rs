use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Env {
    home: TempDir,
    sessions: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            home: TempDir::new().unwrap(),
            sessions: TempDir::new().unwrap(),
        }
    }

    fn berth(&self) -> Command {
        let mut cmd = Command::cargo_bin("berth").unwrap();
        cmd.current_dir(self.home.path())
            .env("HOME", self.home.path())
            .env("XDG_CONFIG_HOME", self.home.path().join(".config"))
            .env("BERTH_SESSIONS_DIR", self.sessions.path())
            .env_remove("BERTH_CONTAINER")
            .env_remove("RUST_LOG");
        cmd
    }

    fn save_session(&self, id: &str, files: &[(&str, &str)]) {
        let dir = self.sessions.path().join(id);
        let state = dir.join(".state");
        fs::create_dir_all(&state).unwrap();
        for (name, content) in files {
            let path = state.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::write(
            dir.join("metadata.json"),
            format!(
                r#"{{"session_id":"{}","saved_at":"2026-01-02T03:04:05Z","workspace":"/srv/project","image":"berth-sandbox"}}"#,
                id
            ),
        )
        .unwrap();
    }

    fn session_exists(&self, id: &str) -> bool {
        Path::new(&self.sessions.path().join(id)).exists()
    }
}

#[test]
fn test_help() {
    Command::cargo_bin("berth")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandboxes"))
        .stdout(predicate::str::contains("snapshot"));
}

#[test]
fn test_info_shows_saved_session() {
    let env = Env::new();
    env.save_session("abc-123", &[("history.jsonl", "hello"), ("todos/1.json", "{}")]);

    env.berth()
        .args(["info", "abc-123"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session abc-123"))
        .stdout(predicate::str::contains("2 files"))
        .stdout(predicate::str::contains("/srv/project"));
}

#[test]
fn test_info_json() {
    let env = Env::new();
    env.save_session("abc-123", &[("a", "12345")]);

    let output = env
        .berth()
        .args(["--json", "info", "abc-123"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["id"], "abc-123");
    assert_eq!(value["size_bytes"], 5);
    assert_eq!(value["metadata"]["image"], "berth-sandbox");
}

#[test]
fn test_info_unknown_session_fails() {
    let env = Env::new();
    env.berth()
        .args(["info", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Session not found: nope"));
}

#[test]
fn test_info_rejects_bad_id() {
    let env = Env::new();
    env.berth()
        .args(["info", "../etc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_clean_sessions_dry_run_keeps_data() {
    let env = Env::new();
    env.save_session("s1", &[("a", "x")]);

    env.berth()
        .args(["clean", "--sessions", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved sessions (1)"))
        .stdout(predicate::str::contains("[Dry run] No changes made."));
    assert!(env.session_exists("s1"));
}

#[test]
fn test_clean_sessions_declined() {
    let env = Env::new();
    env.save_session("s1", &[("a", "x")]);

    env.berth()
        .args(["clean", "--sessions"])
        .write_stdin("n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Cancelled."));
    assert!(env.session_exists("s1"));
}

#[test]
fn test_clean_sessions_force() {
    let env = Env::new();
    env.save_session("s1", &[("a", "x")]);
    env.save_session("s2", &[]);

    env.berth()
        .args(["clean", "--sessions", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleaned 2 item(s)."));
    assert!(!env.session_exists("s1"));
    assert!(!env.session_exists("s2"));
}

#[test]
fn test_clean_nothing_to_clean() {
    let env = Env::new();
    env.berth()
        .args(["clean", "--sessions", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to clean."));
}

#[test]
fn test_bad_workspace_config_is_reported() {
    let env = Env::new();
    fs::write(
        env.home.path().join(".berth.toml"),
        "[defaults]\nmax_slot = 0\n",
    )
    .unwrap();
    env.berth()
        .args(["info", "s1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_slot"));
}

#[test]
fn test_invalid_arguments() {
    let env = Env::new();
    env.berth().args(["snapshot", "delete"]).assert().failure();
    env.berth()
        .args(["shell", "--resume", "x", "--continue"])
        .assert()
        .failure();
    env.berth().arg("frobnicate").assert().failure();
}

#[test]
fn test_images_help() {
    Command::cargo_bin("berth")
        .unwrap()
        .args(["images", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--all"));
}
