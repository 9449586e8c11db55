use crate::WidgetKind;
use anyhow::{Context as _, Result, anyhow};
use market_subscriptions::{Market, Timeframe};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use widget_geometry::{Bounds, GestureConfig, Size, point, size};

/// Runtime dashboard settings, validated and converted from
/// [`DashboardSettingsContent`].
#[derive(Clone, Debug, PartialEq)]
pub struct DashboardSettings {
    pub snapping: SnappingSettings,
    pub widgets: WidgetSettings,
    /// Size of the canvas widgets are laid out on. Its origin is always (0, 0).
    pub container_size: Size,
    pub subscriptions: SubscriptionSettings,
    pub layout: LayoutSettings,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnappingSettings {
    pub enabled: bool,
    /// Maximum distance in pixels at which an edge snaps to a guide.
    pub threshold: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WidgetSettings {
    pub min_size: Size,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionSettings {
    pub default_exchange: String,
    pub default_market: Market,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayoutSettings {
    pub restore_on_startup: bool,
    pub file_name: String,
}

/// Widgets created through these helpers subscribe on the default exchange
/// and market.
impl SubscriptionSettings {
    pub fn chart(&self, symbol: &str, timeframe: Timeframe) -> WidgetKind {
        WidgetKind::chart(&self.default_exchange, symbol, timeframe, self.default_market)
    }

    pub fn order_book(&self, symbol: &str) -> WidgetKind {
        WidgetKind::order_book(&self.default_exchange, symbol, self.default_market)
    }

    pub fn trade_feed(&self, symbol: &str) -> WidgetKind {
        WidgetKind::trade_feed(&self.default_exchange, symbol, self.default_market)
    }
}

impl DashboardSettings {
    /// Read settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no dashboard settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading dashboard settings from {}", path.display()))?;
        let content: DashboardSettingsContent = serde_json::from_str(&contents)
            .with_context(|| format!("parsing dashboard settings in {}", path.display()))?;
        let settings = Self::from(content);
        validate_settings(&settings)?;
        Ok(settings)
    }

    pub fn container_bounds(&self) -> Bounds {
        Bounds {
            origin: point(0.0, 0.0),
            size: self.container_size,
        }
    }

    pub fn gesture_config(&self) -> GestureConfig {
        GestureConfig {
            snap_enabled: self.snapping.enabled,
            min_size: self.widgets.min_size,
        }
    }
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self::from(DashboardSettingsContent::default())
    }
}

impl From<DashboardSettingsContent> for DashboardSettings {
    fn from(content: DashboardSettingsContent) -> Self {
        Self {
            snapping: SnappingSettings {
                enabled: content.snapping.enabled,
                threshold: content.snapping.threshold,
            },
            widgets: WidgetSettings {
                min_size: size(content.widgets.min_width, content.widgets.min_height),
            },
            container_size: size(content.container.width, content.container.height),
            subscriptions: SubscriptionSettings {
                default_exchange: content.subscriptions.default_exchange.trim().to_lowercase(),
                default_market: content.subscriptions.default_market.into(),
            },
            layout: LayoutSettings {
                restore_on_startup: content.layout.restore_on_startup,
                file_name: content.layout.file_name,
            },
        }
    }
}

/// Dashboard settings as written in the settings file
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct DashboardSettingsContent {
    /// Alignment guides while dragging and resizing
    #[serde(default)]
    pub snapping: SnappingSettingsContent,

    /// Widget size limits
    #[serde(default)]
    pub widgets: WidgetSettingsContent,

    /// Canvas dimensions
    #[serde(default)]
    pub container: ContainerSettingsContent,

    /// Defaults for new market data subscriptions
    #[serde(default)]
    pub subscriptions: SubscriptionSettingsContent,

    /// Layout persistence
    #[serde(default)]
    pub layout: LayoutSettingsContent,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SnappingSettingsContent {
    #[serde(default = "default_snapping_enabled")]
    pub enabled: bool,

    #[serde(default = "default_snap_threshold")]
    pub threshold: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct WidgetSettingsContent {
    #[serde(default = "default_min_width")]
    pub min_width: f32,

    #[serde(default = "default_min_height")]
    pub min_height: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ContainerSettingsContent {
    #[serde(default = "default_container_width")]
    pub width: f32,

    #[serde(default = "default_container_height")]
    pub height: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SubscriptionSettingsContent {
    #[serde(default = "default_exchange")]
    pub default_exchange: String,

    #[serde(default)]
    pub default_market: MarketContent,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct LayoutSettingsContent {
    #[serde(default = "default_restore_on_startup")]
    pub restore_on_startup: bool,

    #[serde(default = "default_layout_file_name")]
    pub file_name: String,
}

/// Market content for JSON serialization
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MarketContent {
    #[default]
    Spot,
    Futures,
}

impl From<MarketContent> for Market {
    fn from(content: MarketContent) -> Self {
        match content {
            MarketContent::Spot => Market::Spot,
            MarketContent::Futures => Market::Futures,
        }
    }
}

fn default_snapping_enabled() -> bool {
    true
}

fn default_snap_threshold() -> f32 {
    14.0
}

fn default_min_width() -> f32 {
    250.0
}

fn default_min_height() -> f32 {
    150.0
}

fn default_container_width() -> f32 {
    1920.0
}

fn default_container_height() -> f32 {
    1080.0
}

fn default_exchange() -> String {
    "binance".to_string()
}

fn default_restore_on_startup() -> bool {
    true
}

fn default_layout_file_name() -> String {
    "dashboard_layout.json".to_string()
}

impl Default for SnappingSettingsContent {
    fn default() -> Self {
        Self {
            enabled: default_snapping_enabled(),
            threshold: default_snap_threshold(),
        }
    }
}

impl Default for WidgetSettingsContent {
    fn default() -> Self {
        Self {
            min_width: default_min_width(),
            min_height: default_min_height(),
        }
    }
}

impl Default for ContainerSettingsContent {
    fn default() -> Self {
        Self {
            width: default_container_width(),
            height: default_container_height(),
        }
    }
}

impl Default for SubscriptionSettingsContent {
    fn default() -> Self {
        Self {
            default_exchange: default_exchange(),
            default_market: MarketContent::default(),
        }
    }
}

impl Default for LayoutSettingsContent {
    fn default() -> Self {
        Self {
            restore_on_startup: default_restore_on_startup(),
            file_name: default_layout_file_name(),
        }
    }
}

pub fn validate_settings(settings: &DashboardSettings) -> Result<()> {
    let threshold = settings.snapping.threshold;
    if threshold.is_nan() || threshold < 0.0 {
        return Err(anyhow!("Snap threshold must not be negative, got {threshold}"));
    }

    let min_size = settings.widgets.min_size;
    if min_size.is_empty() {
        return Err(anyhow!(
            "Minimum widget size must be positive, got {}x{}",
            min_size.width,
            min_size.height
        ));
    }

    let container = settings.container_size;
    if container.width < min_size.width || container.height < min_size.height {
        return Err(anyhow!(
            "Container {}x{} is smaller than the minimum widget size {}x{}",
            container.width,
            container.height,
            min_size.width,
            min_size.height
        ));
    }

    if settings.subscriptions.default_exchange.is_empty() {
        return Err(anyhow!("Default exchange cannot be empty"));
    }

    if settings.layout.file_name.trim().is_empty() {
        return Err(anyhow!("Layout file name cannot be empty"));
    }

    Ok(())
}

/// JSON schema of the settings file.
pub fn json_schema() -> serde_json::Value {
    schemars::schema_for!(DashboardSettingsContent).to_value()
}
