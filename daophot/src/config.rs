//! Pipeline configuration, stored as JSON.
//!
//! Every field has a default, so a file only needs the settings it changes:
//!
//! ```json
//! { "daophot": { "threshold": 4.0 }, "phot": { "apertures": [3.0, 4.5, 6.0] } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::LeadingMatch;
use crate::tools::{
    AllstarOptions, ConfigError, DaophotOptions, FindOptions, PhotOptions, PickOptions, Timeouts,
};
use crate::validity::ValiditySettings;

/// Read noise answered at start-up when neither header nor config has one.
pub const FALLBACK_READ_NOISE: f64 = 6.5;
/// Gain answered at start-up when neither header nor config has one.
pub const FALLBACK_GAIN: f64 = 1.5;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("cannot access config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Time limits in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSeconds {
    pub read: f64,
    pub prompt: f64,
    pub step: f64,
    pub long_running: f64,
    pub psf_budget: f64,
    pub shutdown_grace: f64,
}

impl Default for TimeoutSeconds {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            read: timeouts.read.as_secs_f64(),
            prompt: timeouts.prompt.as_secs_f64(),
            step: timeouts.step.as_secs_f64(),
            long_running: timeouts.long_running.as_secs_f64(),
            psf_budget: timeouts.psf_budget.as_secs_f64(),
            shutdown_grace: timeouts.shutdown_grace.as_secs_f64(),
        }
    }
}

fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::OutOfRange {
        field,
        requirement: "a non-negative number of seconds",
        value,
    })
}

impl TimeoutSeconds {
    pub fn to_timeouts(&self) -> Result<Timeouts, ConfigError> {
        Ok(Timeouts {
            read: seconds("timeouts.read", self.read)?,
            prompt: seconds("timeouts.prompt", self.prompt)?,
            step: seconds("timeouts.step", self.step)?,
            long_running: seconds("timeouts.long_running", self.long_running)?,
            psf_budget: seconds("timeouts.psf_budget", self.psf_budget)?,
            shutdown_grace: seconds("timeouts.shutdown_grace", self.shutdown_grace)?,
        })
    }
}

/// Everything one photometry run needs besides the image list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory holding the `daophot` and `allstar` executables; empty means `PATH`.
    pub dao_dir: PathBuf,
    pub daophot: DaophotOptions,
    pub find: FindOptions,
    pub phot: PhotOptions,
    pub pick: PickOptions,
    pub allstar: AllstarOptions,
    /// Electrons per ADU when the image header has no `GAIN`.
    pub gain: Option<f64>,
    /// Read noise in ADU when the image header has no `RDNOISE`.
    pub read_noise: Option<f64>,
    /// Multiplier applied to every pixel of the working image.
    pub prescale: f64,
    /// Constant added to every pixel after `prescale`.
    pub add_sky: f64,
    pub validity: ValiditySettings,
    /// Refit without rejected stars.
    pub clean_pass: bool,
    /// Also match prompts at the very start of the tool's output.
    pub accept_leading_prompts: bool,
    /// Echo the tool transcripts at `info` level.
    pub verbose: bool,
    /// Pause after every line written to a tool, in seconds.
    pub send_delay: f64,
    pub timeouts: TimeoutSeconds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dao_dir: PathBuf::new(),
            daophot: DaophotOptions::default(),
            find: FindOptions::default(),
            phot: PhotOptions::default(),
            pick: PickOptions::default(),
            allstar: AllstarOptions::default(),
            gain: Some(1.3),
            read_noise: Some(5.0),
            prescale: 1.0,
            add_sky: 0.0,
            validity: ValiditySettings::default(),
            clean_pass: true,
            accept_leading_prompts: false,
            verbose: false,
            send_delay: 0.0,
            timeouts: TimeoutSeconds::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a JSON config file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigLoadError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.daophot.validate()?;
        self.find.validate()?;
        self.phot.validate()?;
        self.pick.validate()?;
        self.allstar.validate()?;
        if let Some(gain) = self.gain {
            positive("gain", gain)?;
        }
        if let Some(read_noise) = self.read_noise {
            if !(read_noise.is_finite() && read_noise >= 0.0) {
                return Err(ConfigError::OutOfRange {
                    field: "read_noise",
                    requirement: "non-negative",
                    value: read_noise,
                });
            }
        }
        positive("prescale", self.prescale)?;
        if !self.add_sky.is_finite() {
            return Err(ConfigError::OutOfRange {
                field: "add_sky",
                requirement: "finite",
                value: self.add_sky,
            });
        }
        if self.validity.snr_cutoff.is_nan() || self.validity.snr_cutoff > 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "validity.snr_cutoff",
                requirement: "zero or negative",
                value: self.validity.snr_cutoff,
            });
        }
        seconds("send_delay", self.send_delay)?;
        self.timeouts.to_timeouts()?;
        Ok(())
    }

    pub fn leading_match(&self) -> LeadingMatch {
        if self.accept_leading_prompts {
            LeadingMatch::Accept
        } else {
            LeadingMatch::Ignore
        }
    }

    pub fn send_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.send_delay).unwrap_or(Duration::ZERO)
    }

    /// Gain for an image: header value, else config, else [`FALLBACK_GAIN`].
    pub fn gain_for(&self, header: Option<f64>) -> f64 {
        header.or(self.gain).unwrap_or(FALLBACK_GAIN)
    }

    /// Read noise for an image: header value, else config, else [`FALLBACK_READ_NOISE`].
    pub fn read_noise_for(&self, header: Option<f64>) -> f64 {
        header.or(self.read_noise).unwrap_or(FALLBACK_READ_NOISE)
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement: "positive",
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeouts.to_timeouts().unwrap(), Timeouts::default());
        assert_eq!(config.leading_match(), LeadingMatch::Ignore);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{ "daophot": { "threshold": 4.0 }, "phot": { "apertures": [3.0, 6.0] }, "timeouts": { "step": 2.5 } }"#,
        )
        .unwrap();

        let config = PipelineConfig::load_from_file(&path).unwrap();
        assert_eq!(config.daophot.threshold, Some(4.0));
        assert_eq!(config.daophot.fitting_radius, Some(5.0));
        assert_eq!(config.phot.apertures, vec![3.0, 6.0]);
        assert_relative_eq!(config.phot.outer_sky, 20.0);
        assert_eq!(
            config.timeouts.to_timeouts().unwrap().step,
            Duration::from_millis(2500)
        );
        assert_eq!(config.pick, PickOptions::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.json");
        let config = PipelineConfig {
            prescale: 2.0,
            clean_pass: false,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(PipelineConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "phot": { "inner_sky": 30.0 } }"#).unwrap();
        assert!(matches!(
            PipelineConfig::load_from_file(&path),
            Err(ConfigLoadError::Invalid(ConfigError::SkyAnnulus { .. }))
        ));

        std::fs::write(&path, r#"{ "timeouts": { "step": -1.0 } }"#).unwrap();
        assert!(matches!(
            PipelineConfig::load_from_file(&path),
            Err(ConfigLoadError::Invalid(ConfigError::OutOfRange { .. }))
        ));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            PipelineConfig::load_from_file(&path),
            Err(ConfigLoadError::Parse { .. })
        ));
    }

    #[test]
    fn test_positive_snr_cutoff_rejected() {
        let mut config = PipelineConfig::default();
        config.validity.snr_cutoff = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gain_and_read_noise_precedence() {
        let config = PipelineConfig::default();
        assert_relative_eq!(config.gain_for(Some(2.2)), 2.2);
        assert_relative_eq!(config.gain_for(None), 1.3);
        assert_relative_eq!(config.read_noise_for(None), 5.0);

        let bare = PipelineConfig {
            gain: None,
            read_noise: None,
            ..Default::default()
        };
        assert_relative_eq!(bare.gain_for(None), FALLBACK_GAIN);
        assert_relative_eq!(bare.read_noise_for(None), FALLBACK_READ_NOISE);
    }
}
