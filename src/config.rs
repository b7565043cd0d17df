//! Daemon configuration loaded from an INI file.
//!
//! ```ini
//! [scheduler]
//! poll_interval = 90
//! misfire_grace = 30
//!
//! [store]
//! path = messages.json
//!
//! [beacon]
//! host = 0.0.0.0
//! port = 8888
//! cert = certs/beacon.pem
//! key = certs/beacon.key
//! ca = certs/ca.pem
//! timeout = 10
//! repeat_attempts = 10
//! keepalive_interval = 5
//!
//! [dispatcher]
//! host = 127.0.0.1
//! port = 32769
//!
//! [reference.1]
//! port = 8889
//!
//! [window]
//! offsets = 0, 900, 1800, 2700
//! tolerance = 120
//! ```
//!
//! Every key is optional and overlays the defaults below.
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::link::LinkConfig;
use crate::scheduler::{SchedulerConfig, DEFAULT_MISFIRE_GRACE, DEFAULT_POLL_INTERVAL};
use crate::transport::{ListenConfig, TlsFiles, DEFAULT_IO_TIMEOUT};
use crate::window::{RecurrencePattern, DEFAULT_TOLERANCE};

pub const DEFAULT_BEACON_PORT: u16 = 8888;
pub const DEFAULT_REFERENCE_PORT: u16 = 8889;
pub const DEFAULT_DISPATCHER_PORT: u16 = 32769;
pub const DEFAULT_STORE_PATH: &str = "messages.json";
pub const DEFAULT_REPEAT_ATTEMPTS: u32 = 10;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
/// Worst case of one relayed reference request with default link settings.
/// Clients of the dispatcher must wait at least this long for a reply.
pub const DEFAULT_RELAY_BOUND: Duration =
    Duration::from_secs(DEFAULT_IO_TIMEOUT.as_secs() * (DEFAULT_REPEAT_ATTEMPTS as u64 + 2));

const REFERENCE_PREFIX: &str = "reference.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] ini::Error),

    #[error("invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    #[error("[{section}]: cert, key and ca must be given together")]
    PartialTls { section: String },

    #[error("[{section}]: station id must be a number between 0 and 255")]
    StationId { section: String },
}

/// A hardware listener: where it listens and how the link behaves.
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub listen: ListenConfig,
    pub repeat_attempts: u32,
    pub keepalive_interval: Duration,
}

impl LinkSettings {
    fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            listen: ListenConfig::new(name, host, port),
            repeat_attempts: DEFAULT_REPEAT_ATTEMPTS,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            name: self.listen.name.clone(),
            io_timeout: self.listen.io_timeout,
            keepalive_interval: self.keepalive_interval,
            repeat_attempts: self.repeat_attempts,
            connect_wait: self.listen.io_timeout,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReferenceSettings {
    pub station_id: u8,
    pub link: LinkSettings,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub scheduler: SchedulerConfig,
    pub store_path: PathBuf,
    pub beacon: LinkSettings,
    pub dispatcher: ListenConfig,
    pub references: Vec<ReferenceSettings>,
    /// Scoring windows reference measurements are checked against.
    pub window: RecurrencePattern,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig {
                poll_interval: DEFAULT_POLL_INTERVAL,
                default_misfire_grace: DEFAULT_MISFIRE_GRACE,
            },
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            beacon: LinkSettings::new("beacon", "0.0.0.0", DEFAULT_BEACON_PORT),
            dispatcher: ListenConfig::new("dispatcher", "127.0.0.1", DEFAULT_DISPATCHER_PORT),
            references: Vec::new(),
            window: RecurrencePattern::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)?;
        Self::from_ini(&ini)
    }

    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("scheduler")) {
            if let Some(v) = parse::<u64>(section, "scheduler", "poll_interval")? {
                config.scheduler.poll_interval = Duration::from_secs(v.max(1));
            }
            if let Some(v) = parse(section, "scheduler", "misfire_grace")? {
                config.scheduler.default_misfire_grace = v;
            }
        }

        if let Some(section) = ini.section(Some("store")) {
            if let Some(v) = section.get("path").map(str::trim).filter(|v| !v.is_empty()) {
                config.store_path = PathBuf::from(v);
            }
        }

        if let Some(section) = ini.section(Some("beacon")) {
            apply_link(&mut config.beacon, section, "beacon")?;
        }

        if let Some(section) = ini.section(Some("dispatcher")) {
            apply_listen(&mut config.dispatcher, section, "dispatcher")?;
        }

        for (name, section) in ini.iter() {
            let Some(name) = name else { continue };
            let Some(id) = name.strip_prefix(REFERENCE_PREFIX) else {
                continue;
            };
            let station_id: u8 = id.trim().parse().map_err(|_| ConfigError::StationId {
                section: name.to_string(),
            })?;
            let mut link = LinkSettings::new(
                &format!("reference-{station_id}"),
                "0.0.0.0",
                DEFAULT_REFERENCE_PORT,
            );
            apply_link(&mut link, section, name)?;
            config.references.push(ReferenceSettings { station_id, link });
        }
        config.references.sort_by_key(|r| r.station_id);

        if let Some(section) = ini.section(Some("window")) {
            let tolerance = parse(section, "window", "tolerance")?.unwrap_or(DEFAULT_TOLERANCE);
            if tolerance < 0 {
                return Err(ConfigError::InvalidValue {
                    section: "window".into(),
                    key: "tolerance".into(),
                    value: tolerance.to_string(),
                    reason: "must not be negative".into(),
                });
            }
            if let Some(raw) = section.get("offsets") {
                config.window = RecurrencePattern::parse_offsets(raw, tolerance).map_err(|e| {
                    ConfigError::InvalidValue {
                        section: "window".into(),
                        key: "offsets".into(),
                        value: raw.to_string(),
                        reason: e.to_string(),
                    }
                })?;
            } else {
                config.window.tolerance = tolerance;
            }
        }

        Ok(config)
    }
}

fn apply_link(link: &mut LinkSettings, section: &Properties, name: &str) -> Result<(), ConfigError> {
    apply_listen(&mut link.listen, section, name)?;
    if let Some(v) = parse(section, name, "repeat_attempts")? {
        link.repeat_attempts = v;
    }
    if let Some(v) = parse::<u64>(section, name, "keepalive_interval")? {
        link.keepalive_interval = Duration::from_secs(v);
    }
    Ok(())
}

fn apply_listen(listen: &mut ListenConfig, section: &Properties, name: &str) -> Result<(), ConfigError> {
    if let Some(v) = section.get("host").map(str::trim).filter(|v| !v.is_empty()) {
        listen.host = v.to_string();
    }
    if let Some(v) = parse(section, name, "port")? {
        listen.port = v;
    }
    if let Some(v) = parse::<u64>(section, name, "timeout")? {
        listen.io_timeout = if v == 0 {
            DEFAULT_IO_TIMEOUT
        } else {
            Duration::from_secs(v)
        };
    }

    let path = |key: &str| {
        section
            .get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    };
    listen.tls = match (path("cert"), path("key"), path("ca")) {
        (Some(cert), Some(key), Some(ca)) => Some(TlsFiles { cert, key, ca }),
        (None, None, None) => None,
        _ => {
            return Err(ConfigError::PartialTls {
                section: name.to_string(),
            })
        }
    };
    Ok(())
}

fn parse<T: FromStr>(section: &Properties, name: &str, key: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = section.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            section: name.to_string(),
            key: key.to_string(),
            value: raw.to_string(),
            reason: format!("expected a non-negative integer ({})", std::any::type_name::<T>()),
        })
}
