//! Device capability profile used to size the storage-mode threshold.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use sysinfo::System;

const MOBILE_USER_AGENT: &str = r"(?i)Android|webOS|iPhone|iPad|iPod|BlackBerry|IEMobile|Opera Mini";

static MOBILE_UA: OnceLock<Option<Regex>> = OnceLock::new();

/// Capabilities of the device this node runs on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub total_memory_gb: f64,
    pub cpu_cores: usize,
    pub mobile: bool,
}

impl DeviceProfile {
    /// Detect the running host
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let total_memory_gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

        Self {
            total_memory_gb,
            cpu_cores: num_cpus::get(),
            mobile: cfg!(any(target_os = "android", target_os = "ios")),
        }
    }

    /// Profile for a client identified by its user agent string
    pub fn from_user_agent(user_agent: &str, total_memory_gb: f64) -> Self {
        let mobile = MOBILE_UA
            .get_or_init(|| Regex::new(MOBILE_USER_AGENT).ok())
            .as_ref()
            .map(|re| re.is_match(user_agent))
            .unwrap_or(false);

        Self {
            total_memory_gb,
            cpu_cores: 1,
            mobile,
        }
    }

    pub fn desktop(total_memory_gb: f64) -> Self {
        Self {
            total_memory_gb,
            cpu_cores: num_cpus::get(),
            mobile: false,
        }
    }

    /// Records a country may hold before switching to chunked storage.
    ///
    /// Mobile devices get a fixed budget regardless of reported memory.
    pub fn storage_threshold(&self) -> usize {
        if self.mobile {
            1500
        } else if self.total_memory_gb >= 8.0 {
            3000
        } else if self.total_memory_gb >= 4.0 {
            2000
        } else {
            1000
        }
    }
}
