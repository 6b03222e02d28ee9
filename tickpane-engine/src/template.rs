//! Configuration snapshots.
//!
//! A snapshot reads the current surface and overlay parameters into an
//! immutable [`ChartTemplate`] and persists it append-only: load the
//! existing list, append, write the whole list back. Applying a template
//! is the only path that writes template state back into the chart.
//!
//! Store failures are recoverable notifications; they never corrupt the
//! in-memory chart state.

use crate::overlay::IndicatorOverlayEngine;
use crate::surface::ChartSurfaceManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tickpane_core::{ChartTemplate, EngineError, PaneId, TemplateOverlay};
use tracing::{debug, info};

/// Persistence capability for the template list
pub trait TemplateStore: Send + Sync {
    fn load(&self) -> Result<Vec<ChartTemplate>, EngineError>;
    fn save(&self, templates: &[ChartTemplate]) -> Result<(), EngineError>;
}

/// Template file path from TICKPANE_TEMPLATES (default: ./tickpane-templates.json)
fn default_template_path() -> &'static Path {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        std::env::var("TICKPANE_TEMPLATES")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tickpane-templates.json"))
    })
}

/// Whole-list JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new() -> Self {
        Self {
            path: default_template_path().to_path_buf(),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for JsonFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore for JsonFileStore {
    fn load(&self) -> Result<Vec<ChartTemplate>, EngineError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|error| EngineError::Template(error.to_string()))?;
        serde_json::from_str(&raw).map_err(|error| EngineError::Template(error.to_string()))
    }

    fn save(&self, templates: &[ChartTemplate]) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|error| EngineError::Template(error.to_string()))?;
            }
        }
        let raw = serde_json::to_string_pretty(templates)
            .map_err(|error| EngineError::Template(error.to_string()))?;
        fs::write(&self.path, raw).map_err(|error| EngineError::Template(error.to_string()))?;
        debug!(path = %self.path.display(), count = templates.len(), "template list persisted");
        Ok(())
    }
}

/// Reads chart state into templates and persists them append-only
pub struct ConfigurationSnapshot<S: TemplateStore> {
    store: S,
}

impl<S: TemplateStore> ConfigurationSnapshot<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Capture the current primary-pane configuration as a template
    pub fn capture(
        &self,
        name: impl Into<String>,
        surface: &ChartSurfaceManager,
        overlays: &IndicatorOverlayEngine,
    ) -> Option<ChartTemplate> {
        let primary = surface.pane(PaneId(0))?;
        let template_overlays = overlays
            .pane_overlays(PaneId(0))
            .map(|state| TemplateOverlay {
                indicator: state.indicator.clone(),
                parameters: state.parameters.clone(),
                color: state.color,
            })
            .collect();

        Some(ChartTemplate::new(
            name,
            primary.symbol.clone(),
            primary.timeframe,
            surface.panes().len(),
            template_overlays,
        ))
    }

    /// Append a template to the persisted list (read list, append, write
    /// the whole list back). Existing templates are never mutated.
    pub fn save(&self, template: ChartTemplate) -> Result<(), EngineError> {
        let mut templates = self.store.load()?;
        info!(name = %template.name, "saving chart template");
        templates.push(template);
        self.store.save(&templates)
    }

    /// All saved templates, oldest first
    pub fn list(&self) -> Result<Vec<ChartTemplate>, EngineError> {
        self.store.load()
    }

    /// Most recently saved template with the given name
    pub fn find(&self, name: &str) -> Result<Option<ChartTemplate>, EngineError> {
        Ok(self
            .store
            .load()?
            .into_iter()
            .rev()
            .find(|template| template.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tickpane_core::Timeframe;

    fn template(name: &str) -> ChartTemplate {
        ChartTemplate::new(name, "BTCUSDT", Timeframe::M1, 1, Vec::new())
    }

    #[test]
    fn test_load_missing_file_is_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path().join("templates.json"));
        assert_eq!(store.load().unwrap(), Vec::new());
    }

    #[test]
    fn test_template_round_trip_preserves_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path().join("templates.json"));
        let snapshot = ConfigurationSnapshot::new(store);

        let first = template("first");
        let second = template("second");
        snapshot.save(first.clone()).unwrap();
        snapshot.save(second.clone()).unwrap();

        let listed = snapshot.list().unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[test]
    fn test_find_returns_latest_save_for_name() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot =
            ConfigurationSnapshot::new(JsonFileStore::at(dir.path().join("templates.json")));

        let older = template("scalp");
        let mut newer = template("scalp");
        newer.timeframe = Timeframe::M5;
        snapshot.save(older).unwrap();
        snapshot.save(newer.clone()).unwrap();

        let found = snapshot.find("scalp").unwrap().unwrap();
        assert_eq!(found.timeframe, Timeframe::M5);
        assert_eq!(found, newer);
        assert!(snapshot.find("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_failure_is_recoverable_template_error() {
        // Point the store at a path whose parent is a file, so the write fails
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();

        let snapshot =
            ConfigurationSnapshot::new(JsonFileStore::at(blocker.join("templates.json")));
        let result = snapshot.save(template("doomed"));
        assert!(matches!(result, Err(EngineError::Template(_))));
    }
}
