//! Per-user preference documents
//!
//! One v1 JSON file per user under `<state>/user-preferences/`. Merging is
//! whitelist-based: only known fields with the right type and range are
//! applied, everything else is dropped without error so older or newer
//! clients can write whatever they like.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::GatewayError;
use crate::store::{sanitize_username, write_file_0600};

/// Preferences document version.
const PREFS_VERSION: u32 = 1;

/// Allowed values for `theme`.
const THEMES: [&str; 3] = ["system", "light", "dark"];

/// Allowed values for `density`.
const DENSITIES: [&str; 2] = ["comfortable", "compact"];

const FONT_SIZE_RANGE: std::ops::RangeInclusive<u64> = 8..=32;
const HISTORY_LIMIT_RANGE: std::ops::RangeInclusive<u64> = 10..=10_000;

/// A user's validated preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub version: u32,
    pub theme: String,
    pub density: String,
    pub sound_enabled: bool,
    pub notifications_enabled: bool,
    pub auto_scroll: bool,
    pub send_on_enter: bool,
    pub font_size: u64,
    pub history_limit: u64,
    pub pinned_models: Vec<String>,
    pub dismissed_hints: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Preferences {
            version: PREFS_VERSION,
            theme: "system".to_string(),
            density: "comfortable".to_string(),
            sound_enabled: true,
            notifications_enabled: true,
            auto_scroll: true,
            send_on_enter: true,
            font_size: 14,
            history_limit: 1000,
            pinned_models: Vec::new(),
            dismissed_hints: Vec::new(),
        }
    }
}

impl Preferences {
    /// Apply a client-supplied patch, keeping only whitelisted, well-typed
    /// fields. Unknown keys and ill-typed values are ignored.
    pub fn merge(&mut self, patch: &serde_json::Value) {
        let patch = match patch.as_object() {
            Some(map) => map,
            None => return,
        };

        if let Some(theme) = patch.get("theme").and_then(|v| v.as_str()) {
            if THEMES.contains(&theme) {
                self.theme = theme.to_string();
            }
        }
        if let Some(density) = patch.get("density").and_then(|v| v.as_str()) {
            if DENSITIES.contains(&density) {
                self.density = density.to_string();
            }
        }
        if let Some(v) = patch.get("soundEnabled").and_then(|v| v.as_bool()) {
            self.sound_enabled = v;
        }
        if let Some(v) = patch.get("notificationsEnabled").and_then(|v| v.as_bool()) {
            self.notifications_enabled = v;
        }
        if let Some(v) = patch.get("autoScroll").and_then(|v| v.as_bool()) {
            self.auto_scroll = v;
        }
        if let Some(v) = patch.get("sendOnEnter").and_then(|v| v.as_bool()) {
            self.send_on_enter = v;
        }
        if let Some(v) = patch.get("fontSize").and_then(|v| v.as_u64()) {
            if FONT_SIZE_RANGE.contains(&v) {
                self.font_size = v;
            }
        }
        if let Some(v) = patch.get("historyLimit").and_then(|v| v.as_u64()) {
            if HISTORY_LIMIT_RANGE.contains(&v) {
                self.history_limit = v;
            }
        }
        if let Some(list) = string_array(patch.get("pinnedModels")) {
            self.pinned_models = list;
        }
        if let Some(list) = string_array(patch.get("dismissedHints")) {
            self.dismissed_hints = list;
        }
    }
}

/// An array value all of whose elements are strings, else `None`.
fn string_array(value: Option<&serde_json::Value>) -> Option<Vec<String>> {
    let array = value?.as_array()?;
    array
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

/// Store over per-user preference files.
pub struct PreferencesStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl PreferencesStore {
    pub fn new(state_dir: &Path) -> Self {
        PreferencesStore {
            dir: state_dir.join("user-preferences"),
            lock: Mutex::new(()),
        }
    }

    fn user_path(&self, username: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_username(username)))
    }

    /// Current preferences, defaults when the user has none on disk or the
    /// file is unreadable.
    pub async fn get(&self, username: &str) -> Preferences {
        let _guard = self.lock.lock().await;
        self.read(username)
    }

    fn read(&self, username: &str) -> Preferences {
        match fs::read_to_string(self.user_path(username)) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Preferences::default(),
        }
    }

    /// Merge a patch into the stored document and persist the result.
    pub async fn set(
        &self,
        username: &str,
        patch: &serde_json::Value,
    ) -> Result<Preferences, GatewayError> {
        let _guard = self.lock.lock().await;
        let mut prefs = self.read(username);
        prefs.merge(patch);
        let bytes = serde_json::to_vec_pretty(&prefs)
            .map_err(|e| GatewayError::Fatal(format!("preferences serialization failed: {e}")))?;
        write_file_0600(&self.user_path(username), &bytes)?;
        Ok(prefs)
    }
}
