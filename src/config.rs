//! Run configuration
//!
//! Directory layout, input file names and engine switches for one run,
//! read from `config/dose_rate.json` when present.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::algorithm::MissingChannelPolicy;
use crate::decay::DecayProgram;
use crate::error::{DoseError, DoseResult};
use crate::history::EnginePreset;

pub mod constants {
    pub const CONFIG_PATHS: [&str; 2] = ["config/dose_rate.json", "../config/dose_rate.json"];

    /// Default decay horizon [h]
    pub const DECAY_HOURS: f64 = 320.0;

    pub const ENVELOPE_DOSE_FILE: &str = "doses_envelope.txt";
    pub const SUMMARY_FILE: &str = "summary.json";
    pub const ENVELOPE_HISTORY_FILE: &str = "env_history.txt";
    pub const MAX_HISTORY_FILE: &str = "maxW_history.txt";
    pub const MAX2_HISTORY_FILE: &str = "maxW2_history.txt";
}

use constants::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Root all other directories are relative to
    pub data_dir: PathBuf,
    pub configs_dir: String,
    pub fin_dir: String,
    pub green_dir: String,
    pub origen_dir: String,
    pub results_dir: String,

    pub algorithm_list: String,
    pub assembly_zones: String,
    pub detector_zones: String,
    pub detector_effectiveness: String,
    pub history_file: String,

    pub decay_executable: PathBuf,
    pub decay_template: String,
    pub launch_decay_program: bool,
    pub decay_hours: f64, // [h]

    pub preset: EnginePreset,
    pub write_history_files: bool,
    pub envelope_zones: Vec<i64>,
    pub cell_zones: Vec<i64>,
    pub missing_channel_policy: MissingChannelPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            configs_dir: "Configs".into(),
            fin_dir: "MCU_FIN".into(),
            green_dir: "TVS_Green".into(),
            origen_dir: "Origens".into(),
            results_dir: "Core_FAs".into(),
            algorithm_list: "MCUFINs.txt".into(),
            assembly_zones: "MCU_FAs.txt".into(),
            detector_zones: "MCU_detectors.txt".into(),
            detector_effectiveness: "detectors_eff.txt".into(),
            history_file: "Core_history.txt".into(),
            decay_executable: PathBuf::from("scalerte"),
            decay_template: "Origen_template.inp".into(),
            launch_decay_program: true,
            decay_hours: DECAY_HOURS,
            preset: EnginePreset::Realtime,
            write_history_files: false,
            envelope_zones: (130..=139).collect(),
            cell_zones: (130..=149).collect(),
            missing_channel_policy: MissingChannelPolicy::Skip,
        }
    }
}

impl RunConfig {
    /// Read the configuration from `explicit`, or the first readable default
    /// location, or fall back to built-in values
    pub fn load(explicit: Option<&Path>) -> DoseResult<Self> {
        if let Some(path) = explicit {
            let content = fs::read_to_string(path).map_err(|e| DoseError::io(path, e))?;
            let config: RunConfig = serde_json::from_str(&content)?;
            info!("Configuration read from {}", path.display());
            return config.validated();
        }

        for path in &CONFIG_PATHS {
            if let Ok(content) = fs::read_to_string(path) {
                if let Ok(config) = serde_json::from_str::<RunConfig>(&content) {
                    info!("Configuration read from {}", path);
                    return config.validated();
                }
            }
        }

        warn!("Could not load run configuration, using defaults");
        Ok(Self::default())
    }

    fn validated(self) -> DoseResult<Self> {
        if !self.decay_hours.is_finite() || self.decay_hours <= 0.0 {
            return Err(DoseError::Config(format!(
                "decay_hours must be positive, got {}",
                self.decay_hours
            )));
        }
        if self.envelope_zones.is_empty() || self.cell_zones.is_empty() {
            return Err(DoseError::Config("registration zone lists must not be empty".into()));
        }
        Ok(self)
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    pub fn configs_path(&self, file: &str) -> PathBuf {
        self.dir(&self.configs_dir).join(file)
    }

    pub fn fin_path(&self) -> PathBuf {
        self.dir(&self.fin_dir)
    }

    pub fn green_path(&self) -> PathBuf {
        self.dir(&self.green_dir)
    }

    pub fn origen_path(&self) -> PathBuf {
        self.dir(&self.origen_dir)
    }

    pub fn results_path(&self) -> PathBuf {
        self.dir(&self.results_dir)
    }

    pub fn history_path(&self) -> PathBuf {
        self.configs_path(&self.history_file)
    }

    pub fn decay_program(&self) -> DecayProgram {
        let origen = self.origen_path();
        DecayProgram {
            executable: self.decay_executable.clone(),
            template: origen.join(&self.decay_template),
            work_dir: origen,
            launch: self.launch_decay_program,
        }
    }
}
