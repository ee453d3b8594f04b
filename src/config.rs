//! Engine configuration.
//!
//! [`RpcConfig`] carries the settings an engine starts with. Every one of them
//! can be changed later on a live engine through its setters; the change
//! applies from the next operation that uses it.
//!
//! Settings can also be given as mount-style options, `key=value` pairs joined
//! by `&` as they appear in an NFS URL query string:
//!
//! ```text
//! timeo=600&retrans=3&uid=1000&gid=1000&autoreconnect=-1
//! ```
//!
//! `timeo` is in deciseconds and may not be less than 100 (10 s). Keys that
//! belong to the NFS layer (`rsize`, `nfsport`, `dircache`, ...) are accepted
//! and reported back as not consumed here. Unknown keys are an error.

use std::time::Duration;

use thiserror::Error;

/// Largest NFS READ/WRITE payload the engine must accept in one reply.
pub const MAX_NFS_TRANSFER_SIZE: usize = 4 * 1024 * 1024;

/// Room for RPC and NFS headers around the largest payload.
pub const MESSAGE_HEADER_SLACK: usize = 4096;

/// Identity used where the process ids are not available.
pub const NOBODY_ID: u32 = 65534;

/// Machine name used when the host name cannot be determined.
pub const DEFAULT_MACHINE_NAME: &str = "nfs-client";

/// Options the NFS layer owns; accepted but not consumed by the engine.
const NFS_LAYER_OPTIONS: &[&str] = &[
    "tcp-syncnt",
    "auto-traverse-mounts",
    "dircache",
    "version",
    "nfsport",
    "mountport",
    "rsize",
    "wsize",
    "readdir-buffer",
];

/// What to do when the connection goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ReconnectPolicy {
    /// Fail every pending call at once.
    #[default]
    Never,
    /// Try up to this many times, then fail every pending call.
    Limited(u32),
    /// Keep trying.
    Infinite,
}

impl From<i32> for ReconnectPolicy {
    /// Classic encoding: negative retries forever, 0 never reconnects,
    /// N > 0 retries N times.
    fn from(value: i32) -> Self {
        match value {
            v if v < 0 => ReconnectPolicy::Infinite,
            0 => ReconnectPolicy::Never,
            v => ReconnectPolicy::Limited(v as u32),
        }
    }
}

impl From<ReconnectPolicy> for i32 {
    fn from(policy: ReconnectPolicy) -> Self {
        match policy {
            ReconnectPolicy::Infinite => -1,
            ReconnectPolicy::Never => 0,
            ReconnectPolicy::Limited(n) => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown option {0:?}")]
    UnknownOption(String),

    #[error("invalid value {value:?} for option {key:?}")]
    InvalidValue { key: String, value: String },

    #[error("timeo cannot be less than 100: {0}")]
    TimeoTooSmall(i64),

    #[error("retrans cannot be less than 0: {0}")]
    NegativeRetrans(i64),

    #[error("option {0:?} has no value")]
    MissingValue(String),
}

/// Settings of one engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcConfig {
    /// Time a call may go unanswered before it is retransmitted or failed
    pub timeout: Duration,
    /// Retransmissions before a call fails with a major timeout
    pub retrans: u32,
    pub auto_reconnect: ReconnectPolicy,
    /// Correlation buckets
    pub hash_size: usize,
    /// How often the host should tick the engine
    pub poll_interval: Duration,
    /// Pause between reconnect attempts of the async client
    pub reconnect_delay: Duration,
    /// Largest inbound message accepted before the stream is declared broken
    pub max_message_size: usize,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    /// Verbosity; 2 and up traces every PDU
    pub debug: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let (uid, gid) = process_identity();
        Self {
            timeout: Duration::from_secs(60),
            retrans: 0,
            auto_reconnect: ReconnectPolicy::Never,
            hash_size: 4,
            poll_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(100),
            max_message_size: MAX_NFS_TRANSFER_SIZE + MESSAGE_HEADER_SLACK,
            machine_name: host_name(),
            uid,
            gid,
            groups: Vec::new(),
            debug: 0,
        }
    }
}

impl RpcConfig {
    /// Settings an NFS mount starts with: reconnect forever, retransmit
    /// twice.
    pub fn for_nfs() -> Self {
        Self { auto_reconnect: ReconnectPolicy::Infinite, retrans: 2, ..Self::default() }
    }

    /// Applies one option. Returns `Ok(false)` for options owned by the NFS
    /// layer, which are left alone.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key {
            "uid" => self.uid = parse_value(key, value)?,
            "gid" => self.gid = parse_value(key, value)?,
            "timeo" => {
                let deciseconds: i64 = parse_value(key, value)?;
                if deciseconds < 100 {
                    return Err(ConfigError::TimeoTooSmall(deciseconds));
                }
                self.timeout = Duration::from_millis(deciseconds as u64 * 100);
            }
            "retrans" => {
                let retrans: i64 = parse_value(key, value)?;
                if retrans < 0 {
                    return Err(ConfigError::NegativeRetrans(retrans));
                }
                self.retrans = u32::try_from(retrans).map_err(|_| invalid(key, value))?;
            }
            "debug" => self.debug = parse_value(key, value)?,
            "autoreconnect" => {
                self.auto_reconnect = ReconnectPolicy::from(parse_value::<i32>(key, value)?)
            }
            k if NFS_LAYER_OPTIONS.contains(&k) => return Ok(false),
            k => return Err(ConfigError::UnknownOption(k.to_string())),
        }
        Ok(true)
    }

    /// Applies `key=value` pairs separated by `&`. Returns the keys left for
    /// the NFS layer, in order.
    pub fn apply_options(&mut self, options: &str) -> Result<Vec<String>, ConfigError> {
        let mut unconsumed = Vec::new();
        for pair in options.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::MissingValue(pair.to_string()));
            };
            if !self.apply_option(key, value)? {
                unconsumed.push(key.to_string());
            }
        }
        Ok(unconsumed)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string() }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Real uid and gid of the current process.
#[cfg(unix)]
pub fn process_identity() -> (u32, u32) {
    (nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
}

#[cfg(not(unix))]
pub fn process_identity() -> (u32, u32) {
    (NOBODY_ID, NOBODY_ID)
}

/// Name of this host, or [`DEFAULT_MACHINE_NAME`].
pub fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_MACHINE_NAME.to_string())
}
