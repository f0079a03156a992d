//! Configuration management for the patch surface
//!
//! Handles loading, validation, and hot-reloading of the YAML unit
//! configuration. Every tunable is a named field with a serde default so a
//! config file only needs to state what it overrides.

pub mod watcher;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tokio::fs;

use crate::panel::buttons::BUTTON_COUNT;
use crate::panel::knob::MAX_KNOBS;
use crate::panel::leds::{LedBinding, LED_COUNT};
use crate::protocol::SignalType;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct AppConfig {
    pub unit: UnitConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub patching: PatchingConfig,
    pub panel: PanelConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Identity of this unit on the patch network
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitConfig {
    pub id: u16,
    #[serde(default = "default_unit_name")]
    pub name: String,
}

/// Multicast control channel
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct NetworkConfig {
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Receive our own datagrams back (several units on one host)
    #[serde(default = "default_true")]
    pub multicast_loop: bool,
}

/// Timing and filter tunables, all re-applied on hot reload
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct TuningConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Knob hysteresis as a fraction of full range
    #[serde(default = "default_hysteresis")]
    pub hysteresis: f32,
    /// Distance at which a chasing knob picks up the live position
    #[serde(default = "default_chase_threshold")]
    pub chase_threshold: f32,
    #[serde(default = "default_long_press_ms")]
    pub long_press_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_blink_fast_ms")]
    pub blink_fast_ms: u64,
    #[serde(default = "default_blink_slow_ms")]
    pub blink_slow_ms: u64,
    /// How long an output LED flashes after an identify request
    #[serde(default = "default_identify_flash_ms")]
    pub identify_flash_ms: u64,
}

/// What happens when a connected input receives a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacePolicy {
    /// Connected inputs do not offer; the user must disconnect first
    #[default]
    RequireDisconnect,
    /// Connected inputs offer and a completion replaces the old source
    Replace,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PatchingConfig {
    #[serde(default)]
    pub replace_policy: ReplacePolicy,
    #[serde(default = "default_scale")]
    pub default_scale: f32,
}

/// Physical panel layout
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PanelConfig {
    #[serde(default = "default_knobs")]
    pub knobs: usize,
    #[serde(default = "default_raw_max")]
    pub raw_max: u16,
    /// Button that switches knobs to their second mode while held
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modifier_button: Option<usize>,
    #[serde(default)]
    pub jacks: Vec<JackConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JackDirection {
    Input,
    Output,
}

/// One patchable jack: its button, its LED and what it carries
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct JackConfig {
    pub id: u8,
    #[serde(default)]
    pub name: String,
    pub direction: JackDirection,
    pub signal: SignalType,
    pub button: usize,
    pub led: LedBinding,
    /// Scale applied to connections completed on this input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct PersistenceConfig {
    /// sled database directory; defaults to the platform state dir
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Human-readable CSV copy of the connections, rewritten on change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_csv: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default = "default_log_prefix")]
    pub file_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            bind: default_bind(),
            multicast_loop: true,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            hysteresis: default_hysteresis(),
            chase_threshold: default_chase_threshold(),
            long_press_ms: default_long_press_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            blink_fast_ms: default_blink_fast_ms(),
            blink_slow_ms: default_blink_slow_ms(),
            identify_flash_ms: default_identify_flash_ms(),
        }
    }
}

impl TuningConfig {
    /// Convert a blink interval to ticks-to-toggle (at least one tick)
    pub fn ticks(&self, interval_ms: u64) -> u32 {
        (interval_ms / self.tick_ms.max(1)).max(1) as u32
    }

    pub fn fast_ticks(&self) -> u32 {
        self.ticks(self.blink_fast_ms)
    }

    pub fn slow_ticks(&self) -> u32 {
        self.ticks(self.blink_slow_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            anyhow::bail!("tuning.tick_ms must be greater than 0");
        }
        // Classification error is bounded by one tick; keep it under 10%
        if self.tick_ms * 10 > self.long_press_ms {
            anyhow::bail!(
                "tuning.tick_ms ({}) must be at most 1/10 of long_press_ms ({})",
                self.tick_ms,
                self.long_press_ms
            );
        }
        if !(self.hysteresis > 0.0 && self.hysteresis < 0.5) {
            anyhow::bail!("tuning.hysteresis {} must be in (0, 0.5)", self.hysteresis);
        }
        if !(self.chase_threshold > 0.0 && self.chase_threshold <= 1.0) {
            anyhow::bail!(
                "tuning.chase_threshold {} must be in (0, 1]",
                self.chase_threshold
            );
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("tuning.request_timeout_ms must be greater than 0");
        }
        if self.blink_fast_ms < self.tick_ms || self.blink_slow_ms < self.tick_ms {
            anyhow::bail!("blink intervals must be at least one tick ({} ms)", self.tick_ms);
        }
        Ok(())
    }
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            replace_policy: ReplacePolicy::default(),
            default_scale: default_scale(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: default_debounce_ms(),
            export_csv: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        self.tuning.validate()?;

        let group: Ipv4Addr = self
            .network
            .group
            .parse()
            .with_context(|| format!("network.group '{}' is not an IPv4 address", self.network.group))?;
        if !group.is_multicast() {
            anyhow::bail!("network.group {} is not a multicast address", group);
        }
        if self.network.port == 0 {
            anyhow::bail!("network.port cannot be 0");
        }

        if !self.patching.default_scale.is_finite() {
            anyhow::bail!("patching.default_scale must be finite");
        }

        let panel = &self.panel;
        if panel.knobs > MAX_KNOBS {
            anyhow::bail!("panel.knobs {} exceeds {}", panel.knobs, MAX_KNOBS);
        }
        if panel.raw_max == 0 {
            anyhow::bail!("panel.raw_max cannot be 0");
        }
        if let Some(modifier) = panel.modifier_button {
            if modifier >= BUTTON_COUNT {
                anyhow::bail!("panel.modifier_button {} must be below {}", modifier, BUTTON_COUNT);
            }
        }

        let mut jack_ids = HashSet::new();
        let mut buttons = HashSet::new();
        let mut leds = HashSet::new();
        if let Some(modifier) = panel.modifier_button {
            buttons.insert(modifier);
        }

        for jack in &panel.jacks {
            if !jack_ids.insert(jack.id) {
                anyhow::bail!("Duplicate jack id {}", jack.id);
            }
            if jack.button >= BUTTON_COUNT {
                anyhow::bail!(
                    "Jack {} uses button {} (must be below {})",
                    jack.id,
                    jack.button,
                    BUTTON_COUNT
                );
            }
            if !buttons.insert(jack.button) {
                anyhow::bail!("Jack {} reuses button {}", jack.id, jack.button);
            }
            for led in jack.led.indices() {
                if led >= LED_COUNT {
                    anyhow::bail!("Jack {} uses LED {} (must be below {})", jack.id, led, LED_COUNT);
                }
                if !leds.insert(led) {
                    anyhow::bail!("Jack {} reuses LED {}", jack.id, led);
                }
            }
            if let Some(scale) = jack.scale {
                if !scale.is_finite() {
                    anyhow::bail!("Jack {} scale must be finite", jack.id);
                }
            }
        }

        Ok(())
    }

    /// Find the jack bound to a button
    pub fn jack_for_button(&self, button: usize) -> Option<&JackConfig> {
        self.panel.jacks.iter().find(|j| j.button == button)
    }
}

// Default value functions
fn default_unit_name() -> String { "unit".to_string() }
fn default_group() -> String { "239.50.0.1".to_string() }
fn default_port() -> u16 { 5004 }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_true() -> bool { true }
fn default_tick_ms() -> u64 { 10 }
fn default_hysteresis() -> f32 { 0.012 }
fn default_chase_threshold() -> f32 { 0.05 }
fn default_long_press_ms() -> u64 { 1000 }
fn default_request_timeout_ms() -> u64 { 10_000 }
fn default_blink_fast_ms() -> u64 { 120 }
fn default_blink_slow_ms() -> u64 { 240 }
fn default_identify_flash_ms() -> u64 { 2000 }
fn default_scale() -> f32 { 1.0 }
fn default_knobs() -> usize { 8 }
fn default_raw_max() -> u16 { 4095 }
fn default_debounce_ms() -> u64 { 500 }
fn default_log_prefix() -> String { "patch-surface.log".to_string() }
