use crate::WidgetKind;
use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use widget_geometry::Bounds;

pub const LAYOUT_VERSION: u32 = 1;

/// One widget as saved between sessions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedWidget {
    pub kind: WidgetKind,
    pub bounds: Bounds,
    pub z_index: u32,
}

/// A dashboard's widgets as saved between sessions. Best effort only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedLayout {
    pub version: u32,
    #[serde(default)]
    pub widgets: Vec<PersistedWidget>,
}

impl Default for PersistedLayout {
    fn default() -> Self {
        Self {
            version: LAYOUT_VERSION,
            widgets: Vec::new(),
        }
    }
}

impl PersistedLayout {
    /// Load the layout stored in `config_dir`. A missing file yields an empty layout.
    pub fn load(config_dir: &Path, file_name: &str) -> Result<Self> {
        let file_path = config_dir.join(file_name);
        if !file_path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&file_path)
            .with_context(|| format!("reading layout from {}", file_path.display()))?;
        let layout: PersistedLayout = serde_json::from_str(&contents)
            .with_context(|| format!("parsing layout in {}", file_path.display()))?;
        if layout.version > LAYOUT_VERSION {
            return Err(anyhow!(
                "Layout version {} is newer than supported version {LAYOUT_VERSION}",
                layout.version
            ));
        }
        Ok(layout)
    }

    pub fn save(&self, config_dir: &Path, file_name: &str) -> Result<()> {
        fs::create_dir_all(config_dir)
            .with_context(|| format!("creating {}", config_dir.display()))?;
        let file_path = config_dir.join(file_name);
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(&file_path, contents)
            .with_context(|| format!("writing layout to {}", file_path.display()))?;
        log::debug!("saved {} widgets to {}", self.widgets.len(), file_path.display());
        Ok(())
    }

    /// Widgets ordered back to front.
    pub fn widgets_by_z_index(&self) -> Vec<&PersistedWidget> {
        let mut widgets: Vec<_> = self.widgets.iter().collect();
        widgets.sort_by_key(|widget| widget.z_index);
        widgets
    }
}

/// `<config dir>/trading-dashboard`, if the platform has a config directory.
pub fn default_layout_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("trading-dashboard"))
}
