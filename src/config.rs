use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, time::Duration};
use watlow_f4_lib::tuner::{ControllerType, TuningSettings, TuningTarget};

/// A tuning run loaded from a YAML file. Missing settings use the defaults
/// of [`TuningSettings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningPlan {
    pub step_offset: f64,
    #[serde(with = "humantime_serde")]
    pub step_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub settle_time: Duration,
    #[serde(with = "humantime_serde")]
    pub verification_duration: Duration,
    pub controller: ControllerType,
    pub targets: Vec<TuningTarget>,
}

impl TuningPlan {
    pub const DEFAULT_CONFIG_FILE: &'static str = "tuning.yml";

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Cannot open tuning plan {}", path.display()))?;
        let plan: TuningPlan = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse tuning plan {}", path.display()))?;
        Ok(plan)
    }

    pub fn settings(&self) -> TuningSettings {
        TuningSettings {
            step_offset: self.step_offset,
            step_duration: self.step_duration,
            sample_interval: self.sample_interval,
            settle_time: self.settle_time,
            verification_duration: self.verification_duration,
            controller: self.controller,
            initial_guess: None,
        }
    }
}

impl Default for TuningPlan {
    fn default() -> Self {
        let settings = TuningSettings::default();
        Self {
            step_offset: settings.step_offset,
            step_duration: settings.step_duration,
            sample_interval: settings.sample_interval,
            settle_time: settings.settle_time,
            verification_duration: settings.verification_duration,
            controller: settings.controller,
            targets: Vec::new(),
        }
    }
}
