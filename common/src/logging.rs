// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;

use slog::{o, Drain};

const CHANNEL_SIZE: usize = 32768;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum LogFormat {
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h" | "human" => Ok(LogFormat::Human),
            "j" | "json" => Ok(LogFormat::Json),
            _ => Err("invalid log format".to_string()),
        }
    }
}

/// Build the root logger for a link discovery process.  Records are
/// appended to `log_file` if one is given, and written to stdout otherwise.
pub fn init(
    name: &'static str,
    log_file: Option<&Path>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match (log_file, log_format) {
        (Some(path), LogFormat::Json) => {
            let json = slog_bunyan::with_name(name, open(path)?).build();
            async_drain(json.fuse())
        }
        (Some(path), LogFormat::Human) => {
            let decorator = slog_term::PlainDecorator::new(open(path)?);
            async_drain(slog_term::FullFormat::new(decorator).build().fuse())
        }
        (None, LogFormat::Json) => {
            let json = slog_bunyan::with_name(name, std::io::stdout()).build();
            async_drain(json.fuse())
        }
        (None, LogFormat::Human) => {
            let decorator = slog_term::TermDecorator::new().build();
            async_drain(slog_term::FullFormat::new(decorator).build().fuse())
        }
    };
    Ok(slog::Logger::root(drain, o!("component" => name)))
}

fn open(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn async_drain<D>(drain: D) -> slog::Fuse<slog_async::Async>
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    slog_async::Async::new(drain)
        .chan_size(CHANNEL_SIZE)
        .build()
        .fuse()
}
