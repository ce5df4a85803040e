// Copyright 2024 Saorsa Labs Ltd.
//
// This Saorsa Network Software is licensed under the General Public License (GPL), version 3.
// Please see the file LICENSE-GPL, or visit <http://www.gnu.org/licenses/> for the full text.
//
// Full details available at https://saorsalabs.com/licenses

//! Device-wide configuration overrides

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Keepalive delay, in seconds, used for automatic keepalives on cellular networks
pub const CONFIG_AUTO_NATT_KEEPALIVES_CELLULAR_TIMEOUT_OVERRIDE_SECONDS: &str =
    "auto_natt_keepalives_cellular_timeout_override_seconds";

/// Allow mobility updates to reuse cached server addresses across networks
pub const CONFIG_USE_CACHED_ADDRS: &str = "use_cached_addresses";

/// Read access to the device configuration store
pub trait DeviceConfig: Send + Sync + 'static {
    /// Read integer `key` clamped to `[min, max]`, or `default` if it is absent
    fn get_int(&self, key: &str, min: i64, max: i64, default: i64) -> i64;

    /// Read boolean `key`, returning `default` if it is absent
    fn get_bool(&self, key: &str, default: bool) -> bool;
}

/// In-memory device configuration, loadable through serde
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticDeviceConfig {
    ints: HashMap<String, i64>,
    bools: HashMap<String, bool>,
}

impl StaticDeviceConfig {
    /// Empty configuration, every read returns its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set integer `key`
    pub fn with_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.ints.insert(key.into(), value);
        self
    }

    /// Set boolean `key`
    pub fn with_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.bools.insert(key.into(), value);
        self
    }
}

impl DeviceConfig for StaticDeviceConfig {
    fn get_int(&self, key: &str, min: i64, max: i64, default: i64) -> i64 {
        self.ints
            .get(key)
            .map_or(default, |value| (*value).clamp(min, max))
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.bools.get(key).copied().unwrap_or(default)
    }
}
