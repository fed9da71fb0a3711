// bluetrace-config/src/interface.rs
//! Controller interface handling: bring-up command and enumeration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::{self, Validate};

use crate::capture::CommandConfig;
use crate::validation;

/// Interface configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct InterfaceConfig {
    /// Command that brings a controller interface up.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_bring_up))]
    #[serde(default = "default_bring_up")]
    pub bring_up: CommandConfig,

    /// Upper bound on the bring-up command's runtime (milliseconds).
    #[validate(range(min = 1, max = 60000))]
    #[serde(default = "default_bring_up_timeout")]
    pub bring_up_timeout_ms: u64,

    /// Pause after bring-up before the packet dump is started (milliseconds).
    #[validate(range(max = 60000))]
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Directory listing the host's controller interfaces.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

fn default_bring_up() -> CommandConfig {
    CommandConfig::new("hciconfig", &["{interface}", "up"])
}

fn default_bring_up_timeout() -> u64 {
    5000
}

fn default_settle() -> u64 {
    1000
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/bluetooth")
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            bring_up: default_bring_up(),
            bring_up_timeout_ms: default_bring_up_timeout(),
            settle_ms: default_settle(),
            sysfs_root: default_sysfs_root(),
        }
    }
}
