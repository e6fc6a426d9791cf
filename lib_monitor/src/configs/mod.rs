pub mod config_monitor;

pub use config_monitor::{load_config, load_config_from, MonitorConfig, MonitorSettings, SourceSpec, TransportKind};
