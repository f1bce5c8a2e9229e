use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use offload_rs::backend::accelerator::AcceleratorOptions;
use offload_rs::verify::Tolerance;
use serde::{Deserialize, Serialize};

/// Settings for a scenario run, loadable from JSON. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub backend: String,
    pub lanes: Vec<u32>,
    pub tolerance: Tolerance,
    /// Directory with the hardware Makefile. `None` runs the in-process device model.
    pub hardware_app_dir: Option<PathBuf>,
    pub library_name: String,
    pub profiler_enable: bool,
    pub profiler_cycle_counter_id: u32,
    pub seed: u64,
    /// Inputs are drawn from `0..input_high`.
    pub input_high: i32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: offload_rs_backend_vsim::BACKEND_NAME.to_string(),
            lanes: vec![1, 2, 32],
            tolerance: Tolerance::default(),
            hardware_app_dir: None,
            library_name: "vsim".to_string(),
            profiler_enable: true,
            profiler_cycle_counter_id: 0,
            seed: 0,
            input_high: 5,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse harness config {}", path.display()))
    }

    /// Applies `OFFLOAD_HW_APP_DIR` and `OFFLOAD_PROFILE` on top of the file values.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            offload_rs::env::hw_app_dir(),
            offload_rs::env::profile_override(),
        )
    }

    fn with_overrides(mut self, app_dir: Option<PathBuf>, profile: Option<bool>) -> Self {
        if let Some(dir) = app_dir {
            self.hardware_app_dir = Some(dir);
        }
        if let Some(enable) = profile {
            self.profiler_enable = enable;
        }
        self
    }

    pub fn accelerator_options(&self, lanes: u32, lib_path: Option<PathBuf>) -> AcceleratorOptions {
        let mut options = AcceleratorOptions::default().with_lanes(lanes);
        if let Some(path) = lib_path {
            options = options.with_lib_path(path);
        }
        if self.profiler_enable {
            options = options.with_profiler(self.profiler_cycle_counter_id);
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"lanes": [4], "tolerance": {"rtol": 0.0, "atol": 1.0}}"#)
                .expect("parse");
        assert_eq!(config.lanes, vec![4]);
        assert_eq!(config.tolerance, Tolerance::new(0.0, 1.0));
        assert_eq!(config.backend, "vsim");
        assert!(config.profiler_enable);
    }

    #[test]
    fn options_carry_profiler_and_library() {
        let config = HarnessConfig::default();
        let options = config.accelerator_options(8, Some(PathBuf::from("/tmp/libvsim_8.so")));
        assert_eq!(options.lanes, 8);
        assert!(options.profiler_enable);
        assert_eq!(options.lib_path, Some(PathBuf::from("/tmp/libvsim_8.so")));

        let quiet = HarnessConfig {
            profiler_enable: false,
            ..HarnessConfig::default()
        };
        assert!(!quiet.accelerator_options(1, None).profiler_enable);
    }

    #[test]
    fn profile_override_switches_profiling_both_ways() {
        let off = HarnessConfig::default().with_overrides(None, Some(false));
        assert!(!off.profiler_enable);

        let quiet = HarnessConfig {
            profiler_enable: false,
            ..HarnessConfig::default()
        };
        assert!(quiet.clone().with_overrides(None, Some(true)).profiler_enable);
        assert!(!quiet.with_overrides(None, None).profiler_enable);

        let moved = HarnessConfig::default().with_overrides(Some(PathBuf::from("/hw")), None);
        assert_eq!(moved.hardware_app_dir, Some(PathBuf::from("/hw")));
        assert!(moved.profiler_enable);
    }

    #[test]
    fn load_reports_the_path_on_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.json");
        fs::write(&path, "{ not json").expect("write");
        let err = HarnessConfig::load(&path).expect_err("bad json");
        assert!(format!("{err:#}").contains("harness.json"));
    }
}
