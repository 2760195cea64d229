// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! Fabric link discovery.
//!
//! Every mastered device runs an agent that sends a probe out each of its
//! enabled ports at a fixed interval.  When a probe sent by one device is
//! received by another, the pair of ports is reported as a link.  When a
//! port stops hearing from its neighbor, goes down, or disappears, the
//! link is reported as gone.

pub mod agent;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod services;
pub mod suppression;
mod timer;
pub mod types;

pub use agent::DeviceAgent;
pub use config::DiscoveryConfig;
pub use errors::LinkdError;
pub use orchestrator::Orchestrator;
pub use services::DeviceEvent;
pub use services::DeviceService;
pub use services::InboundPacket;
pub use services::LinkProviderService;
pub use services::MastershipEvent;
pub use services::MastershipService;
pub use services::PacketService;
pub use services::Services;
pub use suppression::SuppressionPolicy;
pub use types::LinkEvent;
pub use types::LinkdResult;
