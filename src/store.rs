//! Model selection store, shared with the opencode TUI.
//!
//! `~/.local/state/opencode/model.json` remembers recently used and
//! favorite models as `provider/model` strings. We read it to pick a
//! default model when none is given on the command line, and push our
//! selection back so the native TUI agrees on what was last used. The file
//! is owned by another program: reads tolerate anything malformed and
//! writes are best-effort.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const RECENT_CAP: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStore {
    #[serde(default)]
    pub recent: Vec<String>,
    #[serde(default)]
    pub favorite: Vec<String>,
}

impl ModelStore {
    /// Load the store, treating a missing or unreadable file as empty.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), "model store not readable, starting empty: {e}");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(store) => store,
            Err(e) => {
                debug!(path = %path.display(), "model store malformed, starting empty: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state directory: {}", parent.display())
            })?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize model store")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write model store: {}", path.display()))?;
        Ok(())
    }

    /// Most recently used model, if any.
    pub fn most_recent(&self) -> Option<&str> {
        self.recent.first().map(String::as_str)
    }

    /// Record a model as most recently used. Deduplicates and caps the list.
    pub fn add_recent(&mut self, model: &str) {
        self.recent.retain(|m| m != model);
        self.recent.insert(0, model.to_string());
        self.recent.truncate(RECENT_CAP);
    }

    /// Favorites are curated in the native TUI; we only read them.
    pub fn is_favorite(&self, model: &str) -> bool {
        self.favorite.iter().any(|m| m == model)
    }
}
