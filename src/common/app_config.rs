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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<OlapScanConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static OlapScanConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = OlapScanConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG
        .get()
        .ok_or_else(|| anyhow!("config not initialized after set"))
}

pub fn init_from_env_or_default() -> Result<&'static OlapScanConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static OlapScanConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("OLAPSCAN_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("olapscan.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $OLAPSCAN_CONFIG or create ./olapscan.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct OlapScanConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "olapscan=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub scan: ScanConfig,
}

impl OlapScanConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: OlapScanConfig = toml::from_str(s)?;
        cfg.scan.validate()?;
        Ok(cfg)
    }

    /// Filter expression handed to the logging subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for OlapScanConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            scan: ScanConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ScanConfig {
    /// Rows per chunk requested from the storage reader.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Capacity of the per-operator chunk buffer.
    #[serde(default = "default_operator_buffer_chunks")]
    pub operator_buffer_chunks: usize,
    /// Upper bound of chunks produced by one scan task invocation.
    #[serde(default = "default_scan_batch_chunks")]
    pub scan_batch_chunks: usize,
    /// Key ranges of one tablet are grouped so that at most this many scanner ranges exist.
    #[serde(default = "default_scanners_per_tablet")]
    pub scanners_per_tablet: usize,
    #[serde(default = "default_max_scan_key_num")]
    pub max_scan_key_num: usize,
    #[serde(default = "default_max_pushdown_conditions_per_column")]
    pub max_pushdown_conditions_per_column: usize,
    #[serde(default = "default_yield_max_time_spent_ms")]
    pub yield_max_time_spent_ms: u64,
    #[serde(default = "default_yield_preempt_max_time_spent_ms")]
    pub yield_preempt_max_time_spent_ms: u64,
    #[serde(default)]
    pub disable_storage_page_cache: bool,
    #[serde(default)]
    pub scan_thread_pool_thread_num: usize,
    #[serde(default = "default_scan_thread_pool_queue_size")]
    pub scan_thread_pool_queue_size: usize,
}

fn default_chunk_size() -> usize {
    4096
}

fn default_operator_buffer_chunks() -> usize {
    8
}

fn default_scan_batch_chunks() -> usize {
    4
}

fn default_scanners_per_tablet() -> usize {
    64
}

fn default_max_scan_key_num() -> usize {
    1024
}

fn default_max_pushdown_conditions_per_column() -> usize {
    1024
}

fn default_yield_max_time_spent_ms() -> u64 {
    100
}

fn default_yield_preempt_max_time_spent_ms() -> u64 {
    20
}

fn default_scan_thread_pool_queue_size() -> usize {
    102_400
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            operator_buffer_chunks: default_operator_buffer_chunks(),
            scan_batch_chunks: default_scan_batch_chunks(),
            scanners_per_tablet: default_scanners_per_tablet(),
            max_scan_key_num: default_max_scan_key_num(),
            max_pushdown_conditions_per_column: default_max_pushdown_conditions_per_column(),
            yield_max_time_spent_ms: default_yield_max_time_spent_ms(),
            yield_preempt_max_time_spent_ms: default_yield_preempt_max_time_spent_ms(),
            disable_storage_page_cache: false,
            scan_thread_pool_thread_num: 0,
            scan_thread_pool_queue_size: default_scan_thread_pool_queue_size(),
        }
    }
}

impl ScanConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("scan.chunk_size must be positive"));
        }
        if self.operator_buffer_chunks == 0 {
            return Err(anyhow!("scan.operator_buffer_chunks must be positive"));
        }
        if self.yield_preempt_max_time_spent_ms > self.yield_max_time_spent_ms {
            return Err(anyhow!(
                "scan.yield_preempt_max_time_spent_ms ({}) exceeds scan.yield_max_time_spent_ms ({})",
                self.yield_preempt_max_time_spent_ms,
                self.yield_max_time_spent_ms
            ));
        }
        Ok(())
    }

    /// Get the actual number of scan threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_scan_threads(&self) -> usize {
        if self.scan_thread_pool_thread_num > 0 {
            self.scan_thread_pool_thread_num
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
