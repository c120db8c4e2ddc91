//! Saved sessions on disk
//!
//! Layout under the sessions directory:
//!
//! ```text
//! <sessions_dir>/<session-id>/.state/...       copy of the container's state dir
//! <sessions_dir>/<session-id>/metadata.json
//! ```
//!
//! A save pulls into `.state.partial` first and only then replaces
//! `.state`, so an interrupted save leaves the previous copy intact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::id::validate_session_id;
use crate::error::{BerthError, Result};
use crate::runtime::ContainerRuntime;

const STATE_DIR: &str = ".state";
const STAGING_DIR: &str = ".state.partial";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub persistent: bool,
}

impl SessionMetadata {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            saved_at: Utc::now(),
            container_name: None,
            workspace: None,
            image: None,
            persistent: false,
        }
    }
}

/// One row of `berth info` / `berth clean --sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub saved_at: Option<DateTime<Utc>>,
    pub workspace: Option<PathBuf>,
    pub image: Option<String>,
    pub persistent: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> Result<PathBuf> {
        validate_session_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn state_dir(&self, id: &str) -> Result<PathBuf> {
        Ok(self.session_dir(id)?.join(STATE_DIR))
    }

    /// A session exists when its `.state` directory does, even if empty.
    pub fn exists(&self, id: &str) -> bool {
        self.state_dir(id).map(|p| p.is_dir()).unwrap_or(false)
    }

    /// Metadata for `id`, or `None` for sessions saved without it.
    pub fn load_metadata(&self, id: &str) -> Result<Option<SessionMetadata>> {
        let path = self.session_dir(id)?.join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn write_metadata(&self, metadata: &SessionMetadata) -> Result<()> {
        let dir = self.session_dir(&metadata.session_id)?;
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", METADATA_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(metadata)?)?;
        fs::rename(&tmp, dir.join(METADATA_FILE))?;
        Ok(())
    }

    /// Copy `state_path` out of `container` and record it as session `metadata.session_id`.
    ///
    /// Overwrites any earlier save under the same id.
    pub fn save_from(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        state_path: &str,
        metadata: &SessionMetadata,
    ) -> Result<()> {
        let dir = self.session_dir(&metadata.session_id)?;
        fs::create_dir_all(&dir)?;

        let staging = dir.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        if let Err(e) = runtime.pull_dir(container, state_path, &staging) {
            if staging.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!("could not remove {}: {}", staging.display(), cleanup);
                }
            }
            return Err(e);
        }

        let state = dir.join(STATE_DIR);
        if state.exists() {
            fs::remove_dir_all(&state)?;
        }
        fs::rename(&staging, &state)?;
        self.write_metadata(metadata)?;

        debug!(
            "saved {}:{} as session {}",
            container, state_path, metadata.session_id
        );
        Ok(())
    }

    /// Copy the saved state of `id` into `dest` inside `container`.
    pub fn restore_into(
        &self,
        runtime: &dyn ContainerRuntime,
        container: &str,
        id: &str,
        dest: &str,
    ) -> Result<()> {
        let state = self.state_dir(id)?;
        if !state.is_dir() {
            return Err(BerthError::SessionNotFound(id.to_string()));
        }
        runtime.push_dir_contents(container, &state, dest)
    }

    /// Every saved session, newest first. Sessions without metadata sort last.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().to_string();
            if validate_session_id(&id).is_err() || !self.exists(&id) {
                continue;
            }

            let metadata = match self.load_metadata(&id) {
                Ok(m) => m,
                Err(e) => {
                    warn!("ignoring unreadable metadata for session {}: {}", id, e);
                    None
                }
            };
            sessions.push(SessionSummary {
                size_bytes: dir_size(&entry.path()),
                saved_at: metadata.as_ref().map(|m| m.saved_at),
                workspace: metadata.as_ref().and_then(|m| m.workspace.clone()),
                image: metadata.as_ref().and_then(|m| m.image.clone()),
                persistent: metadata.as_ref().is_some_and(|m| m.persistent),
                id,
            });
        }

        sessions.sort_by(|a, b| b.saved_at.cmp(&a.saved_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Most recently saved session recorded for `workspace`.
    pub fn latest_for_workspace(&self, workspace: &Path) -> Result<Option<String>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|s| s.workspace.as_deref() == Some(workspace))
            .map(|s| s.id))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.session_dir(id)?;
        if !dir.exists() {
            return Err(BerthError::SessionNotFound(id.to_string()));
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LaunchOptions, MemoryRuntime};
    use chrono::Duration;
    use tempfile::TempDir;

    fn runtime_with(name: &str) -> MemoryRuntime {
        let runtime = MemoryRuntime::new();
        runtime.add_image("img");
        runtime
            .launch(
                name,
                &LaunchOptions {
                    image: "img".into(),
                    ephemeral: true,
                    idmap: None,
                },
            )
            .unwrap();
        runtime
    }

    fn save_one(store: &SessionStore, id: &str, saved_at: DateTime<Utc>, workspace: &str) {
        let dir = store.state_dir(id).unwrap();
        fs::create_dir_all(&dir).unwrap();
        let mut meta = SessionMetadata::new(id);
        meta.saved_at = saved_at;
        meta.workspace = Some(PathBuf::from(workspace));
        store.write_metadata(&meta).unwrap();
    }

    #[test]
    fn test_save_and_restore() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let runtime = runtime_with("c1");
        runtime
            .create_file("c1", "/home/code/.claude/notes.txt", "remember me")
            .unwrap();

        store
            .save_from(&runtime, "c1", "/home/code/.claude", &SessionMetadata::new("s1"))
            .unwrap();
        assert!(store.exists("s1"));
        assert_eq!(
            fs::read_to_string(store.state_dir("s1").unwrap().join("notes.txt")).unwrap(),
            "remember me"
        );
        assert!(!tmp.path().join("s1").join(STAGING_DIR).exists());

        runtime.add_image("img");
        runtime
            .launch(
                "c2",
                &LaunchOptions {
                    image: "img".into(),
                    ephemeral: true,
                    idmap: None,
                },
            )
            .unwrap();
        store
            .restore_into(&runtime, "c2", "s1", "/home/code/.claude")
            .unwrap();
        assert_eq!(
            runtime.file("c2", "/home/code/.claude/notes.txt").as_deref(),
            Some("remember me")
        );
    }

    #[test]
    fn test_save_is_point_in_time_and_last_wins() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let runtime = runtime_with("c1");

        runtime.create_file("c1", "/state/a.txt", "v1").unwrap();
        store
            .save_from(&runtime, "c1", "/state", &SessionMetadata::new("s1"))
            .unwrap();

        runtime.create_file("c1", "/state/a.txt", "v2").unwrap();
        let saved = store.state_dir("s1").unwrap().join("a.txt");
        assert_eq!(fs::read_to_string(&saved).unwrap(), "v1");

        store
            .save_from(&runtime, "c1", "/state", &SessionMetadata::new("s1"))
            .unwrap();
        assert_eq!(fs::read_to_string(&saved).unwrap(), "v2");
    }

    #[test]
    fn test_failed_save_keeps_previous_state() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let runtime = runtime_with("c1");
        runtime.create_file("c1", "/state/a.txt", "good").unwrap();
        store
            .save_from(&runtime, "c1", "/state", &SessionMetadata::new("s1"))
            .unwrap();

        runtime.fail_on("pull", "disk full");
        assert!(store
            .save_from(&runtime, "c1", "/state", &SessionMetadata::new("s1"))
            .is_err());

        let saved = store.state_dir("s1").unwrap().join("a.txt");
        assert_eq!(fs::read_to_string(saved).unwrap(), "good");
        assert!(!tmp.path().join("s1").join(STAGING_DIR).exists());
    }

    #[test]
    fn test_empty_state_still_exists() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        fs::create_dir_all(store.state_dir("empty").unwrap()).unwrap();
        assert!(store.exists("empty"));
        assert_eq!(store.load_metadata("empty").unwrap(), None);
    }

    #[test]
    fn test_missing_state_is_not_a_session() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        fs::create_dir_all(tmp.path().join("half")).unwrap();
        assert!(!store.exists("half"));
        assert!(!store.exists("never"));
        assert!(!store.exists("../escape"));
    }

    #[test]
    fn test_metadata_ignores_unknown_fields() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let dir = tmp.path().join("s1");
        fs::create_dir_all(dir.join(STATE_DIR)).unwrap();
        fs::write(
            dir.join(METADATA_FILE),
            r#"{"session_id":"s1","saved_at":"2026-01-02T03:04:05Z","tool":"claude"}"#,
        )
        .unwrap();
        let meta = store.load_metadata("s1").unwrap().unwrap();
        assert_eq!(meta.session_id, "s1");
        assert_eq!(meta.workspace, None);
    }

    #[test]
    fn test_list_newest_first_and_latest_for_workspace() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        let now = Utc::now();
        save_one(&store, "old", now - Duration::hours(2), "/w");
        save_one(&store, "new", now, "/w");
        save_one(&store, "other", now - Duration::hours(1), "/x");
        fs::write(store.state_dir("new").unwrap().join("f"), "12345").unwrap();

        let list = store.list().unwrap();
        let ids: Vec<&str> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "other", "old"]);
        assert!(list[0].size_bytes >= 5);

        assert_eq!(
            store.latest_for_workspace(Path::new("/w")).unwrap().as_deref(),
            Some("new")
        );
        assert_eq!(store.latest_for_workspace(Path::new("/none")).unwrap(), None);
    }

    #[test]
    fn test_list_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        save_one(&store, "s1", Utc::now(), "/w");
        store.delete("s1").unwrap();
        assert!(!store.exists("s1"));
        assert!(matches!(
            store.delete("s1"),
            Err(BerthError::SessionNotFound(_))
        ));
    }
}
