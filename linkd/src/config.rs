// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::LinkdError;
use crate::types::LinkdResult;

/// The annotation that turns discovery off for a device or port.
pub const DEFAULT_SUPPRESSION_KEY: &str = "no-lldp";

/// Tunables for the discovery engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// Time between probes on a single port, in milliseconds.
    pub probe_interval_ms: u64,
    /// A neighbor that hasn't been heard from in this many probe intervals
    /// is declared gone.
    pub aging_multiplier: u32,
    /// Annotation key checked on devices and ports.  A value of "true",
    /// in any case, disables discovery.
    pub suppression_key: String,
    /// When a port keeps receiving malformed probes, only every Nth is
    /// logged.
    pub decode_log_every: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            probe_interval_ms: 3000,
            aging_multiplier: 3,
            suppression_key: DEFAULT_SUPPRESSION_KEY.to_string(),
            decode_log_every: 100,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn aging_timeout(&self) -> Duration {
        self.probe_interval().saturating_mul(self.aging_multiplier)
    }

    pub fn validate(&self) -> LinkdResult<()> {
        if self.probe_interval_ms == 0 {
            return Err(LinkdError::Config(
                "probe_interval_ms must be non-zero".into(),
            ));
        }
        if self.aging_multiplier == 0 {
            return Err(LinkdError::Config(
                "aging_multiplier must be non-zero".into(),
            ));
        }
        if self.suppression_key.is_empty() {
            return Err(LinkdError::Config(
                "suppression_key must not be empty".into(),
            ));
        }
        if self.decode_log_every == 0 {
            return Err(LinkdError::Config(
                "decode_log_every must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.  Missing fields take their
    /// default values.
    pub fn from_json(s: &str) -> LinkdResult<Self> {
        let cfg: DiscoveryConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> LinkdResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LinkdError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }
}
