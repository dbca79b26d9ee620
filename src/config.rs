//! Hierarchical configuration, layered `config.toml` -> `config.local.toml`
//! -> environment (`PLANNER_` prefixed, `__` as the nesting separator),
//! following the same `figment` + `serde` pattern the rest of the ecosystem
//! uses for this kind of tool.

use crate::registry::Engine;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_io_coefficient() -> f64 {
    0.0111
}
fn default_early_insert() -> f64 {
    0.3172
}
fn default_early_total_cell() -> f64 {
    0.00419
}
fn default_early_valid_cell() -> f64 {
    0.0263
}
fn default_late_insert() -> f64 {
    0.7224
}
fn default_late_total_cell() -> f64 {
    0.01
}
fn default_late_valid_cell() -> f64 {
    0.011
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostModelConfig {
    #[serde(default = "default_io_coefficient")]
    pub io_coefficient: f64,
    #[serde(default = "default_early_insert")]
    pub early_insert_coefficient: f64,
    #[serde(default = "default_early_total_cell")]
    pub early_total_cell_coefficient: f64,
    #[serde(default = "default_early_valid_cell")]
    pub early_valid_cell_coefficient: f64,
    #[serde(default = "default_late_insert")]
    pub late_insert_coefficient: f64,
    #[serde(default = "default_late_total_cell")]
    pub late_total_cell_coefficient: f64,
    #[serde(default = "default_late_valid_cell")]
    pub late_valid_cell_coefficient: f64,
}

impl Default for CostModelConfig {
    fn default() -> Self {
        Self {
            io_coefficient: default_io_coefficient(),
            early_insert_coefficient: default_early_insert(),
            early_total_cell_coefficient: default_early_total_cell(),
            early_valid_cell_coefficient: default_early_valid_cell(),
            late_insert_coefficient: default_late_insert(),
            late_total_cell_coefficient: default_late_total_cell(),
            late_valid_cell_coefficient: default_late_valid_cell(),
        }
    }
}

fn default_min_row_num() -> u64 {
    1024 * 1024
}
fn default_max_complex_intervals() -> usize {
    5
}
fn default_max_merge_candidates() -> usize {
    1000
}
fn default_sample_query_count() -> usize {
    30
}
fn default_worker_pool_cap() -> usize {
    12
}
fn default_worker_pool_fraction() -> f64 {
    0.8
}
fn default_engine() -> Engine {
    Engine::Arrow
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionerConfig {
    #[serde(default = "default_min_row_num")]
    pub min_row_num: u64,
    #[serde(default = "default_max_complex_intervals")]
    pub max_complex_intervals: usize,
    #[serde(default = "default_max_merge_candidates")]
    pub max_merge_candidates: usize,
    #[serde(default = "default_sample_query_count")]
    pub sample_query_count: usize,
    #[serde(default = "default_worker_pool_cap")]
    pub worker_pool_cap: usize,
    #[serde(default = "default_worker_pool_fraction")]
    pub worker_pool_fraction: f64,
    /// Which physical-operator vocabulary to target; only affects whether
    /// the aggregation-reconstruction path's fan-in inserts an `exchange`
    /// boundary before the final aggregate.
    #[serde(default = "default_engine")]
    pub engine: Engine,
}

impl PartitionerConfig {
    pub fn engine(&self) -> Engine {
        self.engine
    }
}

impl Default for PartitionerConfig {
    fn default() -> Self {
        Self {
            min_row_num: default_min_row_num(),
            max_complex_intervals: default_max_complex_intervals(),
            max_merge_candidates: default_max_merge_candidates(),
            sample_query_count: default_sample_query_count(),
            worker_pool_cap: default_worker_pool_cap(),
            worker_pool_fraction: default_worker_pool_fraction(),
            engine: default_engine(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_json() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_log_json(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub cost_model: CostModelConfig,
    #[serde(default)]
    pub partitioner: PartitionerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from `config.toml`, then `config.local.toml` if
    /// present, then environment variables prefixed `PLANNER_` with `__` as
    /// the nesting separator (e.g. `PLANNER_PARTITIONER__MIN_ROW_NUM`).
    pub fn load() -> crate::errors::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("PLANNER_").split("__"));
        figment
            .extract()
            .map_err(|e| crate::errors::Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::errors::Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()));
        figment
            .extract()
            .map_err(|e| crate::errors::Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_calibrated_constants() {
        let cfg = Config::default();
        assert!((cfg.cost_model.io_coefficient - 0.0111).abs() < 1e-12);
        assert_eq!(cfg.partitioner.min_row_num, 1024 * 1024);
        assert_eq!(cfg.partitioner.worker_pool_cap, 12);
    }

    #[test]
    fn from_missing_file_falls_back_to_defaults() {
        let cfg = Config::from_file("does-not-exist.toml").unwrap();
        assert_eq!(cfg, Config::default());
    }
}
