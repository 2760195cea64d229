// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

#[derive(Debug, thiserror::Error)]
pub enum LinkdError {
    /// The discovery configuration could not be loaded or is out of range
    #[error("Configuration error: {0}")]
    Config(String),
    /// The engine was constructed outside of a tokio runtime, so it has
    /// nowhere to run its probe timers.
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl convert::From<serde_json::Error> for LinkdError {
    fn from(err: serde_json::Error) -> Self {
        LinkdError::Config(err.to_string())
    }
}
