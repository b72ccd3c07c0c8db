// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Session configuration loaded from `kaccess.toml`
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (tempfile)
//!
//! The file path defaults to `kaccess.toml` in the working directory and can be overridden with
//! `KACCESS_CONFIG`. A missing file yields the defaults; a malformed one is an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kaccess_abi::rtprio::{RtPrioType, SchedulingClass, RTP_PRIO_MAX};
use kaccess_abi::{KernelAddress, Width};
use serde::Deserialize;

use crate::command::{IdlePolicy, WorkerBuilder};
use crate::host::STAGING_LIMIT;

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "KACCESS_CONFIG";

/// Path used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_PATH: &str = "kaccess.toml";

/// Result alias for configuration loading.
pub type Result<T> = core::result::Result<T, ConfigError>;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value `{key}`: {reason}")]
    Invalid {
        /// Dotted key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Validated configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Privileged worker settings.
    pub worker: WorkerConfig,
    /// Accessor settings.
    pub accessor: AccessorConfig,
    /// Emulated kernel settings.
    pub emulation: EmulationConfig,
}

/// `[worker]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Thread name.
    pub name: String,
    /// Idle polling policy.
    pub idle: IdlePolicy,
    /// Scheduling record applied by the worker to itself.
    pub priority: Option<RtPrioType>,
}

/// `[accessor]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessorConfig {
    /// Staging buffer size; bounds a single transfer.
    pub scratch_size: usize,
}

/// `[emulation]`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmulationConfig {
    /// Address of the first byte of the emulated kernel image.
    pub kernel_base: KernelAddress,
    /// Size of the emulated kernel image.
    pub image_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                name: WorkerBuilder::DEFAULT_NAME.to_string(),
                idle: IdlePolicy::default(),
                priority: None,
            },
            accessor: AccessorConfig { scratch_size: 4096 },
            emulation: EmulationConfig {
                kernel_base: KernelAddress::new(0xffff_8000_0000_0000),
                image_size: 64 * 1024,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    worker: RawWorker,
    #[serde(default)]
    accessor: RawAccessor,
    #[serde(default)]
    emulation: RawEmulation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorker {
    name: Option<String>,
    idle: Option<IdlePolicy>,
    priority: Option<RawPriority>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPriority {
    class: ClassName,
    level: u16,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ClassName {
    InterruptThread,
    Realtime,
    Normal,
    Idle,
    Fifo,
}

impl From<ClassName> for SchedulingClass {
    fn from(name: ClassName) -> Self {
        match name {
            ClassName::InterruptThread => Self::InterruptThread,
            ClassName::Realtime => Self::Realtime,
            ClassName::Normal => Self::Normal,
            ClassName::Idle => Self::Idle,
            ClassName::Fifo => Self::Fifo,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAccessor {
    scratch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEmulation {
    // TOML integers are signed 64-bit, so kernel addresses travel as hex strings.
    kernel_base: Option<String>,
    image_size: Option<usize>,
}

/// Configuration path: `$KACCESS_CONFIG` or [`DEFAULT_PATH`].
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(DEFAULT_PATH), PathBuf::from)
}

impl Config {
    /// Loads from [`config_path`].
    pub fn load() -> Result<Self> {
        Self::load_from(config_path())
    }

    /// Loads from `path`; a missing file yields the defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("config: {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        let raw: RawConfig = toml::from_str(&data)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        let config = Self::from_raw(raw)?;
        log::debug!("config: loaded {}", path.display());
        Ok(config)
    }

    /// Parses TOML text without touching the filesystem.
    pub fn from_toml(data: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(data)
            .map_err(|source| ConfigError::Parse { path: PathBuf::from("<inline>"), source })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let defaults = Self::default();

        let name = raw.worker.name.unwrap_or(defaults.worker.name);
        if name.is_empty() || name.contains('\0') {
            return Err(invalid("worker.name", "must be a non-empty thread name"));
        }
        let priority = match raw.worker.priority {
            Some(RawPriority { level, .. }) if level > RTP_PRIO_MAX => {
                return Err(invalid("worker.priority.level", format!("{level} > {RTP_PRIO_MAX}")));
            }
            Some(RawPriority { class, level }) => Some(RtPrioType::new(class.into(), level)),
            None => None,
        };

        let scratch_size = raw.accessor.scratch_size.unwrap_or(defaults.accessor.scratch_size);
        let widest = Width::Qword.bytes();
        if scratch_size < widest {
            return Err(invalid("accessor.scratch_size", format!("must be at least {widest}")));
        }
        if scratch_size > STAGING_LIMIT {
            let reason = format!("must be at most {STAGING_LIMIT}");
            return Err(invalid("accessor.scratch_size", reason));
        }

        let kernel_base = match raw.emulation.kernel_base {
            Some(text) => parse_address(&text)?,
            None => defaults.emulation.kernel_base,
        };
        let image_size = raw.emulation.image_size.unwrap_or(defaults.emulation.image_size);
        if image_size == 0 {
            return Err(invalid("emulation.image_size", "must be non-zero"));
        }
        if kernel_base.offset(image_size as u64).is_none() {
            return Err(invalid("emulation.image_size", "image wraps the address space"));
        }

        Ok(Self {
            worker: WorkerConfig {
                name,
                idle: raw.worker.idle.unwrap_or(defaults.worker.idle),
                priority,
            },
            accessor: AccessorConfig { scratch_size },
            emulation: EmulationConfig { kernel_base, image_size },
        })
    }
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.into() }
}

fn parse_address(text: &str) -> Result<KernelAddress> {
    let digits = text.trim().trim_start_matches("0x").replace('_', "");
    u64::from_str_radix(&digits, 16)
        .map(KernelAddress::new)
        .map_err(|err| invalid("emulation.kernel_base", format!("`{text}`: {err}")))
}
