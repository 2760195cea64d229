// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Decide whether discovery is administratively disabled for a device or
//! port.

use crate::types::Annotations;
use crate::types::Device;
use crate::types::DeviceMetadata;
use crate::types::Port;
use crate::types::PortMetadata;

#[derive(Clone, Debug)]
pub struct SuppressionPolicy {
    key: String,
}

impl SuppressionPolicy {
    pub fn new(key: impl ToString) -> Self {
        SuppressionPolicy {
            key: key.to_string(),
        }
    }

    fn is_suppressed(&self, annotations: &Annotations) -> bool {
        annotations
            .get(&self.key)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn is_device_suppressed(&self, annotations: &Annotations) -> bool {
        self.is_suppressed(annotations)
    }

    pub fn is_port_suppressed(&self, annotations: &Annotations) -> bool {
        self.is_suppressed(annotations)
    }

    pub fn device_metadata(&self, device: &Device) -> DeviceMetadata {
        DeviceMetadata {
            id: device.id.clone(),
            available: device.available,
            suppressed: self.is_device_suppressed(&device.annotations),
        }
    }

    /// A suppressed device suppresses all of its ports, whatever the ports
    /// themselves say.
    pub fn port_metadata(
        &self,
        device_suppressed: bool,
        port: &Port,
    ) -> PortMetadata {
        PortMetadata {
            number: port.number,
            enabled: port.enabled,
            suppressed: device_suppressed
                || self.is_port_suppressed(&port.annotations),
        }
    }
}
