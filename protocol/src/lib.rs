// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Wire-level pieces of fabric link discovery: the identities carried in a
//! probe, the link-layer addressing, and the probe codec itself.

pub mod macaddr;
pub mod probe;
pub mod types;

pub use macaddr::MacAddr;
pub use probe::check_identity;
pub use probe::decode;
pub use probe::encode;
pub use probe::DiscoveryProbe;
pub use probe::ProbeError;
pub use probe::ProbeResult;
pub use types::ConnectPoint;
pub use types::DeviceId;
pub use types::PortNumber;
