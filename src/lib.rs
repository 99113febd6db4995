pub mod bus;
pub mod config;
pub mod device;
pub mod energy;
pub mod loadpoint;
pub mod planner;
pub mod rates;
pub mod settings;
pub mod site;
pub mod telemetry;
pub mod vehicle;

pub use bus::EventBus;
pub use config::AppConfig;
pub use device::{AdapterError, BatteryMode, ChargerStatus};
pub use loadpoint::{ChargeMode, Loadpoint, LoadpointState};
pub use planner::{ChargePlan, PlanGoal, PlanStrategy, Planner};
pub use rates::{Rate, RateWindow};
pub use settings::Settings;
pub use site::{Site, SiteBattery, SiteBuilder, SiteMeter, SiteTunables};
pub use vehicle::Vehicle;
