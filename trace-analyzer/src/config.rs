//! Run configuration: loaded from a JSON file and overlaid with CLI flags.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sstd,
    Hbos,
    Copod,
}

impl std::str::FromStr for Algorithm {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sstd" => Ok(Algorithm::Sstd),
            "hbos" => Ok(Algorithm::Hbos),
            "copod" => Ok(Algorithm::Copod),
            other => Err(AnalysisError::Config(format!("invalid algorithm: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierStatistic {
    ExclusiveRuntime,
    InclusiveRuntime,
}

/// Run configuration. Algorithm-related defaults are `hbos`, sigma 6.0,
/// hbos threshold 0.99, global-threshold on, max-bins 200, plus the driver-
/// and I/O-level options below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ad_algorithm: Algorithm,
    pub outlier_sigma: f64,
    pub hbos_threshold: f64,
    pub hbos_use_global_threshold: bool,
    pub hbos_max_bins: usize,
    pub outlier_statistic: OutlierStatistic,

    pub anom_win_size: usize,
    pub analysis_step_freq: u64,
    pub global_model_sync_freq: u64,

    pub parser_beginstep_timeout_secs: u64,
    pub net_recv_timeout_ms: u64,
    pub interval_msec: u64,

    pub override_rank: Option<i32>,
    pub prov_min_anom_time_usec: u64,
    pub prov_record_start_step: Option<u64>,
    pub prov_record_stop_step: Option<u64>,

    pub func_threshold_overrides: HashMap<String, f64>,
    pub func_ignore_list: Vec<String>,
    pub monitoring_watchlist: Vec<(String, String)>,

    /// Skip the first observed execution of a function per device before it
    /// contributes to the model, to avoid CUDA JIT / first-call compile
    /// overhead polluting the statistics (original `CHIMBUKO_DISABLE_CUDA_JIT_WORKAROUND`).
    pub cuda_jit_workaround: bool,

    /// Steps a pending correlation-id entry may wait for its partner before
    /// ageing into the unmatched diagnostic set.
    pub corr_id_age_limit_steps: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ad_algorithm: Algorithm::Hbos,
            outlier_sigma: 6.0,
            hbos_threshold: 0.99,
            hbos_use_global_threshold: true,
            hbos_max_bins: 200,
            outlier_statistic: OutlierStatistic::ExclusiveRuntime,

            anom_win_size: 5,
            analysis_step_freq: 1,
            global_model_sync_freq: 1,

            parser_beginstep_timeout_secs: 30,
            net_recv_timeout_ms: 5000,
            interval_msec: 0,

            override_rank: None,
            prov_min_anom_time_usec: 0,
            prov_record_start_step: None,
            prov_record_stop_step: None,

            func_threshold_overrides: HashMap::new(),
            func_ignore_list: Vec::new(),
            monitoring_watchlist: Vec::new(),

            cuda_jit_workaround: true,
            corr_id_age_limit_steps: 50,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| AnalysisError::Config(format!("cannot read config file {path:?}: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| AnalysisError::Config(format!("cannot parse config file {path:?}: {e}")))
    }

    pub fn parser_beginstep_timeout(&self) -> Duration {
        Duration::from_secs(self.parser_beginstep_timeout_secs)
    }

    pub fn net_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.net_recv_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_msec)
    }

    pub fn should_emit_on_step(&self, step: u64) -> bool {
        match (self.prov_record_start_step, self.prov_record_stop_step) {
            (Some(start), Some(stop)) => step >= start && step <= stop,
            (Some(start), None) => step >= start,
            (None, Some(stop)) => step <= stop,
            (None, None) => true,
        }
    }

    pub fn threshold_override_for(&self, function_name: &str) -> Option<f64> {
        self.func_threshold_overrides.get(function_name).copied()
    }

    pub fn is_ignored(&self, function_name: &str) -> bool {
        self.func_ignore_list.iter().any(|f| f == function_name)
    }

    /// Load `<function name> <threshold>` pairs, one per line, into
    /// `func_threshold_overrides`. Blank lines and lines starting with `#`
    /// are skipped.
    pub fn load_threshold_overrides_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| AnalysisError::Config(format!("cannot read threshold overrides file {path:?}: {e}")))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (name, value) = line
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| AnalysisError::Config(format!("malformed threshold override line: {line:?}")))?;
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| AnalysisError::Config(format!("malformed threshold value in line: {line:?}")))?;
            self.func_threshold_overrides.insert(name.trim().to_string(), value);
        }
        Ok(())
    }

    /// Load one function name per line into `func_ignore_list`. Blank lines
    /// and `#`-prefixed comments are skipped.
    pub fn load_ignore_list_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| AnalysisError::Config(format!("cannot read ignore list file {path:?}: {e}")))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.func_ignore_list.push(line.to_string());
        }
        Ok(())
    }

    /// Load `<counter name> <field name>` pairs, one per line, into
    /// `monitoring_watchlist`.
    pub fn load_monitoring_watchlist_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|e| AnalysisError::Config(format!("cannot read monitoring watchlist file {path:?}: {e}")))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (counter, field) = line
                .rsplit_once(char::is_whitespace)
                .ok_or_else(|| AnalysisError::Config(format!("malformed monitoring watchlist line: {line:?}")))?;
            self.monitoring_watchlist.push((counter.trim().to_string(), field.trim().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_algorithm_is_hbos_with_glob_thres_on() {
        let cfg = Config::default();
        assert_eq!(cfg.ad_algorithm, Algorithm::Hbos);
        assert!(cfg.hbos_use_global_threshold);
        assert_eq!(cfg.hbos_max_bins, 200);
    }

    #[test]
    fn emit_window_bounds_are_inclusive() {
        let mut cfg = Config::default();
        cfg.prov_record_start_step = Some(5);
        cfg.prov_record_stop_step = Some(10);
        assert!(!cfg.should_emit_on_step(4));
        assert!(cfg.should_emit_on_step(5));
        assert!(cfg.should_emit_on_step(10));
        assert!(!cfg.should_emit_on_step(11));
    }

    #[test]
    fn loads_threshold_overrides_and_ignore_list_from_files() {
        let dir = std::env::temp_dir().join(format!("trace-analyzer-config-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);

        let thresholds_path = dir.join("thresholds.txt");
        fs::write(&thresholds_path, "# comment\nmain::compute 4.5\nmain::io 2.0\n").unwrap();
        let ignore_path = dir.join("ignore.txt");
        fs::write(&ignore_path, "main::log\n\nmain::heartbeat\n").unwrap();

        let mut cfg = Config::default();
        cfg.load_threshold_overrides_file(&thresholds_path).unwrap();
        cfg.load_ignore_list_file(&ignore_path).unwrap();

        assert_eq!(cfg.threshold_override_for("main::compute"), Some(4.5));
        assert_eq!(cfg.threshold_override_for("main::io"), Some(2.0));
        assert!(cfg.is_ignored("main::log"));
        assert!(cfg.is_ignored("main::heartbeat"));
        assert!(!cfg.is_ignored("main::compute"));

        let _ = fs::remove_dir_all(&dir);
    }
}
