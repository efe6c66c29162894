//! Command modules - one file per CLI command

pub mod install;
pub mod list;
pub mod sources;
pub mod r#use;

use std::sync::Arc;

use tvm_core::error::{ClassifiedError, ErrorKind};
use tvm_core::{HttpProbe, JsonVersionStore, Layout, MirrorSelector, Settings};

/// Everything a command needs from the tvm home: layout, settings, sources and records.
#[derive(Debug)]
pub struct Env {
    pub layout: Layout,
    pub settings: Settings,
    pub selector: MirrorSelector,
    pub store: Arc<JsonVersionStore>,
    pub client: reqwest::Client,
}

impl Env {
    /// Load settings and `mirrors.json` from `TVM_HOME` (or `~/.tvm`).
    pub fn load() -> Result<Self, ClassifiedError> {
        let layout = Layout::from_env().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Configuration,
                "Could not determine the home directory; set TVM_HOME",
            )
        })?;
        Self::at(layout)
    }

    pub fn at(layout: Layout) -> Result<Self, ClassifiedError> {
        let settings = Settings::load_with_env(&layout.settings_path())?;
        let client = tvm_core::http_client().map_err(|e| {
            ClassifiedError::new(ErrorKind::Configuration, format!("Failed to build HTTP client: {e}")).with_cause(e)
        })?;
        let selector = MirrorSelector::load(&layout.mirrors_path(), Arc::new(HttpProbe::new(client.clone())))?
            .with_ttl(settings.probe_ttl());
        let store = Arc::new(JsonVersionStore::new(layout.records_path()));
        tracing::debug!(home = %layout.base().display(), "Loaded environment");
        Ok(Self {
            layout,
            settings,
            selector,
            store,
            client,
        })
    }

    /// Persist custom sources and the probe cache.
    pub fn save_sources(&self) -> Result<(), ClassifiedError> {
        self.selector.save(&self.layout.mirrors_path())?;
        Ok(())
    }
}
