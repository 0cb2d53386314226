use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::{StorageBackend, StorageError};

pub const KEY_PREFIX: &str = "taskboard";

const COMPACT_VIEW: &str = "compact-view";
const SECTION_COLLAPSED: &str = "section-collapsed";
const BASE_BRANCH: &str = "base-branch";

/// `taskboard:<name>` or `taskboard:<name>:<scope>`.
pub fn preference_key(name: &str, scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!("{KEY_PREFIX}:{name}:{scope}"),
        None => format!("{KEY_PREFIX}:{name}"),
    }
}

/// Client preferences over an injected backend. Backend failures are logged
/// and never surface to the caller: reads fall back to defaults and writes
/// are kept in memory for the rest of the session.
pub struct PreferenceStore {
    backend: Box<dyn StorageBackend>,
    shadow: HashMap<String, Option<String>>,
}

impl PreferenceStore {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            shadow: HashMap::new(),
        }
    }

    /// Writes the backend rejected and which are only held in memory.
    pub fn unsaved_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.shadow.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    fn read_raw(&self, key: &str) -> Option<String> {
        if let Some(value) = self.shadow.get(key) {
            return value.clone();
        }
        match self.backend.get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(key, "preference_read_error: {err}");
                None
            }
        }
    }

    fn write_raw(&mut self, key: &str, value: Option<String>) {
        let result = match &value {
            Some(value) => self.backend.set(key, value),
            None => self.backend.remove(key),
        };
        match result {
            Ok(()) => {
                self.shadow.remove(key);
            }
            Err(err) => {
                warn!(key, "preference_write_error: {err}");
                self.shadow.insert(key.to_string(), value);
            }
        }
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read_raw(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, "preference_decode_error: {err}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        let encoded = serde_json::to_string(value)
            .map_err(|err| StorageError::Serialization(err.to_string()));
        match encoded {
            Ok(encoded) => self.write_raw(key, Some(encoded)),
            Err(err) => warn!(key, "preference_encode_error: {err}"),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.write_raw(key, None);
    }

    pub fn compact_view(&self) -> bool {
        self.get(&preference_key(COMPACT_VIEW, None))
            .unwrap_or(false)
    }

    pub fn set_compact_view(&mut self, compact: bool) {
        self.set(&preference_key(COMPACT_VIEW, None), &compact);
    }

    pub fn is_section_collapsed(&self, section: &str) -> bool {
        self.get(&preference_key(SECTION_COLLAPSED, Some(section)))
            .unwrap_or(false)
    }

    pub fn set_section_collapsed(&mut self, section: &str, collapsed: bool) {
        let key = preference_key(SECTION_COLLAPSED, Some(section));
        if collapsed {
            self.set(&key, &true);
        } else {
            self.remove(&key);
        }
    }

    pub fn base_branch(&self, project_id: &str) -> Option<String> {
        self.get::<String>(&preference_key(BASE_BRANCH, Some(project_id)))
            .filter(|branch| !branch.trim().is_empty())
    }

    pub fn set_base_branch(&mut self, project_id: &str, branch: Option<&str>) {
        let key = preference_key(BASE_BRANCH, Some(project_id));
        match branch.map(str::trim).filter(|branch| !branch.is_empty()) {
            Some(branch) => self.set(&key, &branch),
            None => self.remove(&key),
        }
    }
}
