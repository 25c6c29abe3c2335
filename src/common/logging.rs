// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Process logging setup.
//!
//! Log lines use the glog layout (`Lyyyymmdd hh:mm:ss.uuuuuu tid file:line] msg`).
//! Output goes to `$OLAPSCAN_LOG_FILE`, else `$OLAPSCAN_LOG_DIR/olapscan.log`,
//! else stderr when the file cannot be opened.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Local, Timelike};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::common::app_config::OlapScanConfig;

static INIT: OnceLock<()> = OnceLock::new();

struct GlogFormatter;

#[derive(Clone)]
struct SharedFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

struct SharedFileWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for SharedFileMakeWriter {
    type Writer = SharedFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileWriter {
            file: Arc::clone(&self.file),
        }
    }
}

impl io::Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        file.flush()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn resolve_log_file_path() -> Option<PathBuf> {
    if let Some(file) = non_empty_env("OLAPSCAN_LOG_FILE") {
        return Some(PathBuf::from(file));
    }
    non_empty_env("OLAPSCAN_LOG_DIR").map(|dir| PathBuf::from(dir).join("olapscan.log"))
}

fn open_log_writer(log_file_path: PathBuf) -> Option<SharedFileMakeWriter> {
    if let Some(parent) = log_file_path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        eprintln!(
            "failed to create log directory {}: {}, fallback to stderr",
            parent.display(),
            err
        );
        return None;
    }

    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file_path)
    {
        Ok(file) => Some(SharedFileMakeWriter {
            file: Arc::new(Mutex::new(file)),
        }),
        Err(err) => {
            eprintln!(
                "failed to open log file {}: {}, fallback to stderr",
                log_file_path.display(),
                err
            );
            None
        }
    }
}

fn level_char(level: &tracing::Level) -> char {
    match *level {
        tracing::Level::ERROR => 'E',
        tracing::Level::WARN => 'W',
        tracing::Level::INFO => 'I',
        tracing::Level::DEBUG => 'D',
        tracing::Level::TRACE => 'T',
    }
}

fn current_thread_number() -> u64 {
    format!("{:?}", std::thread::current().id())
        .trim_start_matches("ThreadId(")
        .trim_end_matches(')')
        .parse::<u64>()
        .unwrap_or(0)
}

impl<S, N> FormatEvent<S, N> for GlogFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let now = Local::now();
        write!(
            writer,
            "{}{}{:02}{:02} {:02}:{:02}:{:02}.{:06} {} {}:{}] ",
            level_char(metadata.level()),
            now.year() % 10000,
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_micros(),
            current_thread_number(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0)
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber once; later calls are no-ops.
pub fn init_with_level(level: &str) {
    INIT.get_or_init(|| {
        let env_filter = EnvFilter::new(level);

        if let Some(make_writer) = resolve_log_file_path().and_then(open_log_writer) {
            let _ = tracing_fmt()
                .with_env_filter(env_filter)
                .with_writer(make_writer)
                .with_ansi(false)
                .event_format(GlogFormatter)
                .try_init();
            return;
        }

        // ANSI codes only when stderr is a terminal.
        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .event_format(GlogFormatter)
            .try_init();
    });
}

pub fn init_from_config(cfg: &OlapScanConfig) {
    init_with_level(cfg.effective_log_filter());
}

pub use tracing::instrument;
pub use tracing::{debug, error, info, trace, warn};
