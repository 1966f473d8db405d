use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::domain::{App, Deployment, DomainError, validate_app_name};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreInit {
    pub data_dir: PathBuf,
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Domain(DomainError::MissingApp { .. }))
    }

    /// True for failures of the backing store itself rather than of the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::SerdeJson(_) | Self::SchemaVersionMismatch { .. }
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    /// Kept in creation order.
    #[serde(default)]
    pub apps: Vec<App>,
    /// Latest deployment per app name.
    #[serde(default)]
    pub deployments: BTreeMap<String, Deployment>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            apps: Vec::new(),
            deployments: BTreeMap::new(),
        }
    }

    fn app_index(&self, name: &str) -> Option<usize> {
        self.apps.iter().position(|app| app.name == name)
    }
}

pub struct JsonSnapshotStore {
    state_path: PathBuf,
    state: PersistedState,
}

impl JsonSnapshotStore {
    pub fn load_or_init(init: StoreInit) -> Result<Self, StoreError> {
        fs::create_dir_all(&init.data_dir)?;

        let state_path = init.data_dir.join("state.json");
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let store = Self { state_path, state };

        if is_new_state {
            store.save()?;
        }

        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }

    /// Applies `f` and persists the result. The in-memory state is restored
    /// when either step fails.
    fn commit<T>(
        &mut self,
        f: impl FnOnce(&mut PersistedState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let before = self.state.clone();
        let out = f(&mut self.state).and_then(|out| self.save().map(|()| out));
        if out.is_err() {
            self.state = before;
        }
        out
    }

    pub fn create_app(&mut self, app: App) -> Result<App, StoreError> {
        validate_app_name(&app.name)?;

        self.commit(|state| {
            if state.app_index(&app.name).is_some() {
                return Err(DomainError::AppNameConflict { name: app.name }.into());
            }
            state.apps.push(app.clone());
            Ok(app)
        })
    }

    pub fn list_apps(&self) -> Vec<App> {
        self.state.apps.clone()
    }

    pub fn get_app(&self, name: &str) -> Option<App> {
        self.state.app_index(name).map(|i| self.state.apps[i].clone())
    }

    pub fn delete_app(&mut self, name: &str) -> Result<bool, StoreError> {
        let Some(index) = self.state.app_index(name) else {
            return Ok(false);
        };
        self.commit(|state| {
            state.apps.remove(index);
            state.deployments.remove(name);
            Ok(true)
        })
    }

    pub fn record_deployment(&mut self, deployment: Deployment) -> Result<(), StoreError> {
        self.commit(|state| {
            if state.app_index(&deployment.app_name).is_none() {
                return Err(DomainError::MissingApp {
                    name: deployment.app_name,
                }
                .into());
            }
            state
                .deployments
                .insert(deployment.app_name.clone(), deployment);
            Ok(())
        })
    }

    pub fn clear_deployment(&mut self, app_name: &str) -> Result<bool, StoreError> {
        if !self.state.deployments.contains_key(app_name) {
            return Ok(false);
        }
        self.commit(|state| Ok(state.deployments.remove(app_name).is_some()))
    }

    pub fn get_deployment(&self, app_name: &str) -> Option<Deployment> {
        self.state.deployments.get(app_name).cloned()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn test_init(tmp_dir: &Path) -> StoreInit {
        StoreInit {
            data_dir: tmp_dir.to_path_buf(),
        }
    }

    fn deployment_for(app_name: &str) -> Deployment {
        Deployment {
            deployment_id: crate::id::new_deployment_id(),
            app_name: app_name.to_string(),
            filename: "application.zip".to_string(),
            content_type: "application/zip".to_string(),
            size_bytes: 22,
            sha256: "00".repeat(32),
            entries: 0,
            received_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn bootstrap_creates_empty_state_json() {
        let tmp = tempfile::tempdir().unwrap();

        let _store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let state_path = tmp.path().join("state.json");
        assert!(state_path.exists());

        let bytes = fs::read(&state_path).unwrap();
        let state: PersistedState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state, PersistedState::empty());
    }

    #[test]
    fn save_load_roundtrip_keeps_creation_order() {
        let tmp = tempfile::tempdir().unwrap();

        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            store.create_app(App::new(name, "django")).unwrap();
        }
        drop(store);

        let store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let names: Vec<_> = store.list_apps().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn create_rejects_duplicate_name_without_mutation() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();

        store.create_app(App::new("someApp", "django")).unwrap();
        let err = store.create_app(App::new("someApp", "rails")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::AppNameConflict { .. })
        ));

        assert_eq!(store.list_apps(), vec![App::new("someApp", "django")]);
    }

    #[test]
    fn create_rejects_invalid_name() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();

        let err = store.create_app(App::new("", "django")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InvalidAppName { .. })
        ));
        assert!(store.list_apps().is_empty());
    }

    #[test]
    fn delete_removes_app_and_its_deployment() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();

        store.create_app(App::new("a", "")).unwrap();
        store.create_app(App::new("b", "")).unwrap();
        store.record_deployment(deployment_for("a")).unwrap();

        assert!(store.delete_app("a").unwrap());
        assert!(!store.delete_app("a").unwrap());
        assert_eq!(store.get_app("a"), None);
        assert_eq!(store.get_deployment("a"), None);
        assert_eq!(store.list_apps(), vec![App::new("b", "")]);
    }

    #[test]
    fn record_deployment_requires_existing_app() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();

        let err = store.record_deployment(deployment_for("ghost")).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.state().deployments.is_empty());
    }

    #[test]
    fn record_deployment_replaces_previous_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        store.create_app(App::new("a", "")).unwrap();

        store.record_deployment(deployment_for("a")).unwrap();
        let second = deployment_for("a");
        store.record_deployment(second.clone()).unwrap();

        assert_eq!(store.state().deployments.len(), 1);
        assert_eq!(store.get_deployment("a"), Some(second));
    }

    #[test]
    fn clear_deployment_keeps_the_app() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        store.create_app(App::new("a", "")).unwrap();
        store.record_deployment(deployment_for("a")).unwrap();

        assert!(store.clear_deployment("a").unwrap());
        assert!(!store.clear_deployment("a").unwrap());
        assert_eq!(store.get_deployment("a"), None);
        assert_eq!(store.get_app("a"), Some(App::new("a", "")));

        let reloaded = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        assert!(reloaded.state().deployments.is_empty());
    }

    #[test]
    fn failed_save_rolls_back_in_memory_state() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");
        let mut store = JsonSnapshotStore::load_or_init(test_init(&data_dir)).unwrap();
        fs::remove_dir_all(&data_dir).unwrap();

        let err = store.create_app(App::new("a", "")).unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.list_apps().is_empty());
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("state.json"),
            br#"{"schema_version": 99, "apps": []}"#,
        )
        .unwrap();

        let err = JsonSnapshotStore::load_or_init(test_init(tmp.path()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StoreError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                got: 99
            }
        ));
    }
}
