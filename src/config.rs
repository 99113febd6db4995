use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::loadpoint::{ChargeMode, LoadpointTunables, PhaseSwitchConfig};
use crate::planner::PlanStrategy;
use crate::site::{BatteryModeConfig, SiteTunables};

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    #[serde(default)]
    pub controller: ControllerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub site: SiteConfig,

    #[validate(nested)]
    #[serde(default)]
    pub battery: BatteryConfig,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[validate(nested)]
    #[serde(default)]
    pub loadpoints: Vec<LoadpointConfig>,

    #[validate(nested)]
    #[serde(default)]
    pub vehicles: Vec<VehicleConfig>,

    #[serde(default)]
    pub settings_path: Option<PathBuf>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Control loop cadence and per-capability deadlines
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ControllerConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_tick_ms")]
    #[validate(range(min = 100, max = 10_000))]
    pub tick_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    #[validate(range(min = 100, max = 30_000))]
    pub read_timeout_ms: u64,

    #[serde(default = "default_command_timeout_ms")]
    #[validate(range(min = 100, max = 60_000))]
    pub command_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

/// Site-level power balance tunables
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SiteConfig {
    /// Configured home-baseline power subtracted from the surplus (W)
    #[serde(default)]
    pub residual_power_w: f64,

    #[serde(default = "default_max_grid_import_w")]
    #[validate(range(min = 1000.0, max = 100_000.0))]
    pub max_grid_import_w: f64,

    /// Residual tolerance of the power balance diagnostic (W)
    #[serde(default = "default_tolerance_w")]
    #[validate(range(min = 0.0, max = 10_000.0))]
    pub tolerance_w: f64,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub buffer_soc: f64,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub buffer_start_soc: f64,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub priority_soc: f64,

    #[serde(default = "default_true")]
    pub discharge_control: bool,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            residual_power_w: 0.0,
            max_grid_import_w: default_max_grid_import_w(),
            tolerance_w: default_tolerance_w(),
            buffer_soc: 0.0,
            buffer_start_soc: 0.0,
            priority_soc: 0.0,
            discharge_control: true,
        }
    }
}

/// Battery mode decision tunables
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BatteryConfig {
    /// Forced charging fills up to this SoC (%)
    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub charge_soc_limit: f64,

    /// Forced charging engages only below this price
    #[serde(default)]
    pub grid_charge_limit: Option<f64>,

    #[serde(default = "default_mode_dwell_secs")]
    #[validate(range(min = 0, max = 3600))]
    pub mode_dwell_secs: u64,

    #[serde(default = "default_peak_ratio")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub peak_ratio: f64,

    #[serde(default = "default_peak_horizon_hours")]
    #[validate(range(min = 1, max = 48))]
    pub peak_horizon_hours: i64,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            charge_soc_limit: 0.0,
            grid_charge_limit: None,
            mode_dwell_secs: default_mode_dwell_secs(),
            peak_ratio: default_peak_ratio(),
            peak_horizon_hours: default_peak_horizon_hours(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub strategy: PlanStrategy,
}

/// One charge point
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoadpointConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub title: String,

    #[serde(default = "default_mode")]
    pub mode: ChargeMode,

    #[serde(default = "default_min_current")]
    #[validate(range(min = 0.0, max = 64.0))]
    pub min_current_a: f64,

    #[serde(default = "default_max_current")]
    #[validate(range(min = 0.0, max = 64.0))]
    pub max_current_a: f64,

    /// 0 = automatic phase selection
    #[serde(default)]
    pub phases: u8,

    #[serde(default = "default_voltage")]
    #[validate(range(min = 100.0, max = 400.0))]
    pub voltage_v: f64,

    #[serde(default = "default_current_resolution")]
    pub current_resolution_a: f64,

    #[serde(default)]
    pub priority: u32,

    #[serde(default = "default_enable_delay_secs")]
    pub enable_delay_secs: u64,

    #[serde(default = "default_disable_delay_secs")]
    pub disable_delay_secs: u64,

    #[serde(default = "default_switch_delay_secs")]
    pub phase_switch_up_delay_secs: u64,

    #[serde(default = "default_switch_delay_secs")]
    pub phase_switch_down_delay_secs: u64,

    #[serde(default = "default_switch_dwell_secs")]
    pub phase_switch_dwell_secs: u64,

    #[serde(default = "default_switch_interval_secs")]
    pub phase_switch_min_interval_secs: u64,
}

impl LoadpointConfig {
    pub fn tunables(&self) -> LoadpointTunables {
        LoadpointTunables {
            title: self.title.clone(),
            mode: self.mode,
            min_current_a: self.min_current_a,
            max_current_a: self.max_current_a,
            phases: self.phases,
            voltage_v: self.voltage_v,
            current_resolution_a: self.current_resolution_a,
            priority: self.priority,
            enable_delay: Duration::from_secs(self.enable_delay_secs),
            disable_delay: Duration::from_secs(self.disable_delay_secs),
            phase_switch: PhaseSwitchConfig {
                up_delay: Duration::from_secs(self.phase_switch_up_delay_secs),
                down_delay: Duration::from_secs(self.phase_switch_down_delay_secs),
                device_dwell: Duration::from_secs(self.phase_switch_dwell_secs),
                min_interval: Duration::from_secs(self.phase_switch_min_interval_secs),
            },
        }
    }
}

/// One known vehicle
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct VehicleConfig {
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default)]
    pub title: String,

    #[validate(range(min = 1.0, max = 300.0))]
    pub capacity_kwh: f64,

    #[serde(default)]
    #[validate(range(min = 0.0, max = 100.0))]
    pub min_soc_percent: f64,

    #[serde(default = "default_limit_soc")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub limit_soc_percent: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_tick_ms() -> u64 { 1000 }
fn default_read_timeout_ms() -> u64 { 2000 }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_max_grid_import_w() -> f64 { 25_000.0 }
fn default_tolerance_w() -> f64 { 500.0 }
fn default_true() -> bool { true }
fn default_mode_dwell_secs() -> u64 { 300 }
fn default_peak_ratio() -> f64 { 1.5 }
fn default_peak_horizon_hours() -> i64 { 6 }
fn default_mode() -> ChargeMode { ChargeMode::Pv }
fn default_min_current() -> f64 { 6.0 }
fn default_max_current() -> f64 { 16.0 }
fn default_voltage() -> f64 { 230.0 }
fn default_current_resolution() -> f64 { 1.0 }
fn default_enable_delay_secs() -> u64 { 60 }
fn default_disable_delay_secs() -> u64 { 180 }
fn default_switch_delay_secs() -> u64 { 300 }
fn default_switch_dwell_secs() -> u64 { 10 }
fn default_switch_interval_secs() -> u64 { 600 }
fn default_limit_soc() -> f64 { 100.0 }
fn default_log_level() -> String { "info".to_string() }

impl AppConfig {
    /// Load configuration from `chargeflow.toml` overlaid with
    /// `CHARGEFLOW__`-prefixed environment variables
    /// (`CHARGEFLOW__CONTROLLER__TICK_MS` → `controller.tick_ms`).
    pub fn load() -> Result<Self> {
        Self::load_figment(Figment::new().merge(Toml::file("chargeflow.toml")))
    }

    pub fn load_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .merge(Env::prefixed("CHARGEFLOW__").split("__"))
            .extract()
            .context("failed to parse configuration")?;

        config
            .validate()
            .context("configuration validation failed")?;

        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.controller.tick_ms)
    }

    pub fn site_tunables(&self) -> SiteTunables {
        SiteTunables {
            residual_power_w: self.site.residual_power_w,
            max_grid_import_w: self.site.max_grid_import_w,
            tolerance_w: self.site.tolerance_w,
            tick: self.tick_interval(),
            read_timeout: Duration::from_millis(self.controller.read_timeout_ms),
            command_timeout: Duration::from_millis(self.controller.command_timeout_ms),
            planner_strategy: self.planner.strategy,
            buffer_soc: self.site.buffer_soc,
            buffer_start_soc: self.site.buffer_start_soc,
            priority_soc: self.site.priority_soc,
            discharge_control: self.site.discharge_control,
            battery: BatteryModeConfig {
                charge_soc_limit: self.battery.charge_soc_limit,
                grid_charge_limit: self.battery.grid_charge_limit,
                mode_dwell: Duration::from_secs(self.battery.mode_dwell_secs),
                peak_ratio: self.battery.peak_ratio,
                peak_horizon: chrono::Duration::hours(self.battery.peak_horizon_hours),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            site: SiteConfig::default(),
            battery: BatteryConfig::default(),
            planner: PlannerConfig::default(),
            loadpoints: Vec::new(),
            vehicles: Vec::new(),
            settings_path: None,
            telemetry: TelemetryConfig::default(),
        }
    }
}
