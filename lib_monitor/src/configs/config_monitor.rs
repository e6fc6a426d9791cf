//! # Monitor Configuration
//!
//! Three layers, later ones winning: built-in defaults, an optional JSON file
//! (`om_monitor.json` unless `--config-path` says otherwise, camelCase keys), then
//! command-line flags and their `OM_*` environment variables.
//!
//! Every field of [`MonitorConfig`] is optional so the layers can be merged; the
//! merged result is checked once by [`MonitorConfig::validate`], which turns it into
//! the typed [`MonitorSettings`] the rest of the monitor runs on.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::core::engine::PollPolicy;
use crate::core::event_counter::CounterIntervals;
use crate::core::topology::Topology;
use crate::errors::ConfigurationError;
use crate::transport::TcpEndpoint;

/// Config file looked up when `--config-path` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "om_monitor.json";

/// Raw configuration layer. Every field is optional so that defaults, the JSON file
/// and the command line can be merged field by field.
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(name = "om_monitor", about = "Real-time data-reduction monitor node", version)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    /// Path to the JSON configuration file.
    #[clap(long, env = "OM_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Total number of nodes, collecting node included.
    #[clap(long, env = "OM_NODE_POOL_SIZE")]
    pub node_pool_size: Option<usize>,

    /// Rank of this node (0 is the collecting node).
    #[clap(long, env = "OM_RANK")]
    pub rank: Option<usize>,

    /// Transport backend: local or socket.
    #[clap(long, env = "OM_TRANSPORT")]
    pub transport: Option<String>,

    /// tcp:// address where the collecting node receives data.
    #[clap(long, env = "OM_DATA_ENDPOINT")]
    pub data_endpoint: Option<String>,

    /// tcp:// address where the collecting node publishes feedback.
    #[clap(long, env = "OM_FEEDBACK_ENDPOINT")]
    pub feedback_endpoint: Option<String>,

    /// tcp:// address for broadcasting data to viewers.
    #[clap(long, env = "OM_DATA_BROADCAST_URL")]
    pub data_broadcast_url: Option<String>,

    /// tcp:// address for answering viewer requests.
    #[clap(long, env = "OM_RESPONDING_URL")]
    pub responding_url: Option<String>,

    /// Events between two speed reports.
    #[clap(long, env = "OM_SPEED_REPORT_INTERVAL")]
    pub speed_report_interval: Option<u64>,

    /// Events between two data broadcasts.
    #[clap(long, env = "OM_DATA_BROADCAST_INTERVAL")]
    pub data_broadcast_interval: Option<u64>,

    /// Events between two sampled hit frames.
    #[clap(long, env = "OM_HIT_FRAME_SENDING_INTERVAL")]
    pub hit_frame_sending_interval: Option<u64>,

    /// Events between two sampled non-hit frames.
    #[clap(long, env = "OM_NON_HIT_FRAME_SENDING_INTERVAL")]
    pub non_hit_frame_sending_interval: Option<u64>,

    /// Event source string (a list file for the files source).
    #[clap(long, env = "OM_SOURCE")]
    pub source: Option<String>,

    /// Event source kind: files or synthetic.
    #[clap(long, env = "OM_SOURCE_KIND")]
    pub source_kind: Option<String>,

    /// Events generated per processing node by the synthetic source.
    #[clap(long, env = "OM_SYNTHETIC_EVENTS")]
    pub synthetic_events: Option<u64>,

    /// Pause after an idle loop iteration, 0 to busy-poll.
    #[clap(long, env = "OM_IDLE_SLEEP_MICROS")]
    pub idle_sleep_micros: Option<u64>,

    /// Rank 0 starts the processing nodes as child processes (socket transport).
    #[clap(long, env = "OM_SPAWN_WORKERS")]
    pub spawn_workers: Option<bool>,

    /// Directory for log files.
    #[clap(long, env = "OM_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    #[clap(long, env = "OM_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Print the single event with this id and exit.
    #[clap(long, env = "OM_RETRIEVE_EVENT")]
    pub retrieve_event: Option<String>,
}

/// Which transport backend a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Whole pool inside this process.
    Local,
    /// One process per rank over TCP.
    Socket,
}

impl FromStr for TransportKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(TransportKind::Local),
            "socket" => Ok(TransportKind::Socket),
            other => Err(invalid("transport", format!("unknown backend '{}'", other))),
        }
    }
}

/// Where events come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Files named in a list file.
    Files(PathBuf),
    /// Generated events, this many per processing node.
    Synthetic(u64),
}

/// # Monitor Settings
///
/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    /// Rank and pool size of this node.
    pub topology: Topology,
    /// Transport backend.
    pub transport: TransportKind,
    /// Collector's data listener.
    pub data_endpoint: TcpEndpoint,
    /// Collector's feedback publisher.
    pub feedback_endpoint: TcpEndpoint,
    /// Viewer broadcast address, if any.
    pub data_broadcast_url: Option<TcpEndpoint>,
    /// Viewer request address, if any.
    pub responding_url: Option<TcpEndpoint>,
    /// Cadence of the event counter.
    pub intervals: CounterIntervals,
    /// Event source.
    pub source: SourceSpec,
    /// Idle behavior of the loops.
    pub poll: PollPolicy,
    /// Whether rank 0 starts the other ranks.
    pub spawn_workers: bool,
    /// Log file directory.
    pub log_dir: PathBuf,
    /// Log verbosity.
    pub log_level: LevelFilter,
    /// Single event to print instead of running the pool.
    pub retrieve_event: Option<String>,
}

fn invalid(name: &str, reason: String) -> ConfigurationError {
    ConfigurationError::InvalidParameter {
        name: name.to_string(),
        reason,
    }
}

fn endpoint(value: Option<&String>) -> Result<Option<TcpEndpoint>, ConfigurationError> {
    value
        .filter(|v| !v.trim().is_empty())
        .map(|v| TcpEndpoint::parse(v))
        .transpose()
}

impl MonitorConfig {
    /// Built-in defaults.
    pub fn defaults() -> Self {
        MonitorConfig {
            rank: Some(0),
            transport: Some("local".to_string()),
            data_endpoint: Some("tcp://127.0.0.1:5555".to_string()),
            feedback_endpoint: Some("tcp://127.0.0.1:5556".to_string()),
            source_kind: Some("synthetic".to_string()),
            synthetic_events: Some(100),
            idle_sleep_micros: Some(0),
            spawn_workers: Some(false),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Merges two configs; `Some` values of `other` win.
    pub fn merge(self, other: MonitorConfig) -> MonitorConfig {
        MonitorConfig {
            config_path: other.config_path.or(self.config_path),
            node_pool_size: other.node_pool_size.or(self.node_pool_size),
            rank: other.rank.or(self.rank),
            transport: other.transport.or(self.transport),
            data_endpoint: other.data_endpoint.or(self.data_endpoint),
            feedback_endpoint: other.feedback_endpoint.or(self.feedback_endpoint),
            data_broadcast_url: other.data_broadcast_url.or(self.data_broadcast_url),
            responding_url: other.responding_url.or(self.responding_url),
            speed_report_interval: other.speed_report_interval.or(self.speed_report_interval),
            data_broadcast_interval: other.data_broadcast_interval.or(self.data_broadcast_interval),
            hit_frame_sending_interval: other.hit_frame_sending_interval.or(self.hit_frame_sending_interval),
            non_hit_frame_sending_interval: other
                .non_hit_frame_sending_interval
                .or(self.non_hit_frame_sending_interval),
            source: other.source.or(self.source),
            source_kind: other.source_kind.or(self.source_kind),
            synthetic_events: other.synthetic_events.or(self.synthetic_events),
            idle_sleep_micros: other.idle_sleep_micros.or(self.idle_sleep_micros),
            spawn_workers: other.spawn_workers.or(self.spawn_workers),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            retrieve_event: other.retrieve_event.or(self.retrieve_event),
        }
    }

    /// Command-line flags reproducing every value that is set, for starting a child
    /// process with the same configuration.
    pub fn to_args(&self) -> Vec<String> {
        fn push<T: ToString>(args: &mut Vec<String>, flag: &str, value: &Option<T>) {
            if let Some(value) = value {
                args.push(format!("--{}", flag));
                args.push(value.to_string());
            }
        }
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());

        let mut args = Vec::new();
        push(&mut args, "config-path", &path(&self.config_path));
        push(&mut args, "node-pool-size", &self.node_pool_size);
        push(&mut args, "rank", &self.rank);
        push(&mut args, "transport", &self.transport);
        push(&mut args, "data-endpoint", &self.data_endpoint);
        push(&mut args, "feedback-endpoint", &self.feedback_endpoint);
        push(&mut args, "data-broadcast-url", &self.data_broadcast_url);
        push(&mut args, "responding-url", &self.responding_url);
        push(&mut args, "speed-report-interval", &self.speed_report_interval);
        push(&mut args, "data-broadcast-interval", &self.data_broadcast_interval);
        push(&mut args, "hit-frame-sending-interval", &self.hit_frame_sending_interval);
        push(&mut args, "non-hit-frame-sending-interval", &self.non_hit_frame_sending_interval);
        push(&mut args, "source", &self.source);
        push(&mut args, "source-kind", &self.source_kind);
        push(&mut args, "synthetic-events", &self.synthetic_events);
        push(&mut args, "idle-sleep-micros", &self.idle_sleep_micros);
        push(&mut args, "spawn-workers", &self.spawn_workers);
        push(&mut args, "log-dir", &path(&self.log_dir));
        push(&mut args, "log-level", &self.log_level);
        push(&mut args, "retrieve-event", &self.retrieve_event);
        args
    }

    /// Checks the merged config and converts it into settings.
    pub fn validate(&self) -> Result<MonitorSettings, ConfigurationError> {
        let pool_size = self
            .node_pool_size
            .ok_or_else(|| ConfigurationError::MissingParameter("node_pool_size".to_string()))?;
        let topology = Topology::new(self.rank.unwrap_or(0), pool_size)?;

        let transport = self.transport.as_deref().unwrap_or("local").parse()?;
        let data_endpoint = endpoint(self.data_endpoint.as_ref())?
            .ok_or_else(|| ConfigurationError::MissingParameter("data_endpoint".to_string()))?;
        let feedback_endpoint = endpoint(self.feedback_endpoint.as_ref())?
            .ok_or_else(|| ConfigurationError::MissingParameter("feedback_endpoint".to_string()))?;
        if data_endpoint == feedback_endpoint && data_endpoint.port != 0 {
            return Err(invalid(
                "feedback_endpoint",
                "must differ from data_endpoint".to_string(),
            ));
        }

        let source = match self.source_kind.as_deref().unwrap_or("synthetic").to_ascii_lowercase().as_str() {
            "files" => SourceSpec::Files(PathBuf::from(
                self.source
                    .clone()
                    .ok_or_else(|| ConfigurationError::MissingParameter("source".to_string()))?,
            )),
            "synthetic" => SourceSpec::Synthetic(self.synthetic_events.unwrap_or(0)),
            other => return Err(invalid("source_kind", format!("unknown source kind '{}'", other))),
        };

        let spawn_workers = self.spawn_workers.unwrap_or(false);
        if spawn_workers && transport != TransportKind::Socket {
            return Err(invalid(
                "spawn_workers",
                "worker processes need the socket transport".to_string(),
            ));
        }

        let log_level = self
            .log_level
            .as_deref()
            .unwrap_or("info")
            .parse::<LevelFilter>()
            .map_err(|e| invalid("log_level", e.to_string()))?;

        Ok(MonitorSettings {
            topology,
            transport,
            data_endpoint,
            feedback_endpoint,
            data_broadcast_url: endpoint(self.data_broadcast_url.as_ref())?,
            responding_url: endpoint(self.responding_url.as_ref())?,
            intervals: CounterIntervals {
                speed_report: self.speed_report_interval,
                data_broadcast: self.data_broadcast_interval,
                hit_frame_sending: self.hit_frame_sending_interval,
                non_hit_frame_sending: self.non_hit_frame_sending_interval,
            },
            source,
            poll: PollPolicy::from_micros(self.idle_sleep_micros.unwrap_or(0)),
            spawn_workers,
            log_dir: self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs")),
            log_level,
            retrieve_event: self.retrieve_event.clone(),
        })
    }
}

/// Layers defaults, the config file named by `cli` (or the default file) and `cli`.
///
/// A missing file is not an error; an unreadable or malformed one is.
pub fn load_config_from(cli: MonitorConfig) -> Result<MonitorConfig, ConfigurationError> {
    // 1. Defaults
    let mut current = MonitorConfig::defaults();

    // 2. Config file
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if config_file_path.exists() {
        let content = fs::read_to_string(&config_file_path)?;
        let file_config: MonitorConfig = serde_json::from_str(&content)?;
        current = current.merge(file_config);
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    // 3. CLI and environment
    Ok(current.merge(cli))
}

/// Parses the process arguments and layers them over the file and the defaults.
pub fn load_config() -> Result<MonitorConfig, ConfigurationError> {
    load_config_from(MonitorConfig::parse())
}
