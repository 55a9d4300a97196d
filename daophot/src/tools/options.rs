//! Typed option sets for the DAOPHOT and ALLSTAR dialogues.
//!
//! Each tool accepts `KEY = value` lines at its option prompt, where only the
//! first two letters of the key matter. The structs here name every option
//! the pipeline uses, document what it does to the fit, and are validated
//! before anything is sent to the child.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of photometry apertures DAOPHOT supports.
pub const MAX_APERTURES: usize = 12;

/// Option keys for apertures 1 through 12 at the `PHO>` prompt.
pub const APERTURE_KEYS: [&str; MAX_APERTURES] = [
    "A1", "A2", "A3", "A4", "A5", "A6", "A7", "A8", "A9", "AA", "AB", "AC",
];

/// Invalid option values, reported before a dialogue starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {requirement}, got {value}")]
    OutOfRange {
        field: &'static str,
        requirement: &'static str,
        value: f64,
    },

    #[error("at least one aperture radius is required")]
    NoApertures,

    #[error("at most 12 apertures are supported, got {0}")]
    TooManyApertures(usize),

    #[error("inner sky radius {inner} must be smaller than outer sky radius {outer}")]
    SkyAnnulus { inner: f64, outer: f64 },
}

fn check(
    field: &'static str,
    requirement: &'static str,
    value: f64,
    ok: impl Fn(f64) -> bool,
) -> Result<(), ConfigError> {
    if value.is_finite() && ok(value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            requirement,
            value,
        })
    }
}

fn check_opt(
    field: &'static str,
    requirement: &'static str,
    value: Option<f64>,
    ok: impl Fn(f64) -> bool,
) -> Result<(), ConfigError> {
    match value {
        Some(value) => check(field, requirement, value, ok),
        None => Ok(()),
    }
}

fn check_annulus(inner: f64, outer: f64) -> Result<(), ConfigError> {
    check("inner_sky", "non-negative", inner, |v| v >= 0.0)?;
    check("outer_sky", "positive", outer, |v| v > 0.0)?;
    if inner >= outer {
        return Err(ConfigError::SkyAnnulus { inner, outer });
    }
    Ok(())
}

/// Format one `KEY = value` answer line.
pub(crate) fn option_line(key: &str, value: f64) -> String {
    format!("{key} = {value:.2}\n")
}

/// Settings entered at DAOPHOT's `OPT>` prompt.
///
/// Unset fields keep whatever the tool already uses (its `daophot.opt` or
/// built-in defaults).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaophotOptions {
    /// `RE`: read noise of one exposure in ADU; sets the noise floor of every error.
    pub read_noise: Option<f64>,
    /// `GA`: photons per ADU; converts counts to Poisson noise.
    pub gain: Option<f64>,
    /// `LO`: low good datum, in standard deviations below sky; darker pixels are ignored.
    pub low_good_datum: Option<f64>,
    /// `HI`: high good datum in ADU; brighter pixels are treated as saturated.
    pub high_good_datum: Option<f64>,
    /// `FW`: FWHM of the detection kernel in pixels.
    pub fwhm: Option<f64>,
    /// `TH`: detection threshold in standard deviations of the sky.
    pub threshold: Option<f64>,
    /// `WA`: progress display level; 0 keeps the transcript quiet.
    pub watch_progress: Option<f64>,
    /// `FI`: radius in pixels inside which the PSF is fitted to each star.
    pub fitting_radius: Option<f64>,
    /// `PS`: radius in pixels out to which the PSF model is defined.
    pub psf_radius: Option<f64>,
    /// `VA`: spatial variation order of the PSF (-1 analytic only, 0 constant, 1 linear, 2 quadratic).
    pub variable_psf: Option<f64>,
    /// `AN`: analytic profile family (1 Gaussian ... 6 Penny); negative picks the best.
    pub analytic_model: Option<f64>,
    /// `EX`: number of passes removing neighbours from PSF stars.
    pub extra_psf_cleaning: Option<f64>,
    /// `PE`: flat-field percent error added to each pixel's noise.
    pub percent_error: Option<f64>,
    /// `PR`: PSF profile percent error added to each pixel's noise.
    pub profile_error: Option<f64>,
}

impl Default for DaophotOptions {
    fn default() -> Self {
        Self {
            read_noise: None,
            gain: None,
            low_good_datum: None,
            high_good_datum: None,
            fwhm: None,
            threshold: Some(3.0),
            watch_progress: Some(0.0),
            fitting_radius: Some(5.0),
            psf_radius: Some(5.0),
            variable_psf: None,
            analytic_model: None,
            extra_psf_cleaning: Some(5.0),
            percent_error: None,
            profile_error: None,
        }
    }
}

impl DaophotOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_opt("read_noise", "non-negative", self.read_noise, |v| v >= 0.0)?;
        check_opt("gain", "positive", self.gain, |v| v > 0.0)?;
        check_opt("low_good_datum", "non-negative", self.low_good_datum, |v| v >= 0.0)?;
        check_opt("high_good_datum", "finite", self.high_good_datum, |_| true)?;
        check_opt("fwhm", "positive", self.fwhm, |v| v > 0.0)?;
        check_opt("threshold", "positive", self.threshold, |v| v > 0.0)?;
        check_opt("watch_progress", "between -2 and 2", self.watch_progress, |v| {
            (-2.0..=2.0).contains(&v)
        })?;
        check_opt("fitting_radius", "positive", self.fitting_radius, |v| v > 0.0)?;
        check_opt("psf_radius", "positive", self.psf_radius, |v| v > 0.0)?;
        check_opt("variable_psf", "between -1 and 2", self.variable_psf, |v| {
            (-1.0..=2.0).contains(&v)
        })?;
        check_opt("analytic_model", "between -6 and 6, not 0", self.analytic_model, |v| {
            v != 0.0 && (-6.0..=6.0).contains(&v)
        })?;
        check_opt("extra_psf_cleaning", "between 0 and 9", self.extra_psf_cleaning, |v| {
            (0.0..=9.0).contains(&v)
        })?;
        check_opt("percent_error", "non-negative", self.percent_error, |v| v >= 0.0)?;
        check_opt("profile_error", "non-negative", self.profile_error, |v| v >= 0.0)?;

        if let (Some(psf), Some(fit)) = (self.psf_radius, self.fitting_radius) {
            check("psf_radius", "at least the fitting radius", psf, |v| v >= fit)?;
        }
        Ok(())
    }

    /// `(key, value)` pairs for every option that is set, in dialogue order.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        [
            ("RE", self.read_noise),
            ("GA", self.gain),
            ("LO", self.low_good_datum),
            ("HI", self.high_good_datum),
            ("FW", self.fwhm),
            ("TH", self.threshold),
            ("WA", self.watch_progress),
            ("FI", self.fitting_radius),
            ("PS", self.psf_radius),
            ("VA", self.variable_psf),
            ("AN", self.analytic_model),
            ("EX", self.extra_psf_cleaning),
            ("PE", self.percent_error),
            ("PR", self.profile_error),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| (key, v)))
        .collect()
    }
}

/// Answers to FIND's "Number of frames averaged, summed" question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    pub frames_averaged: u32,
    pub frames_summed: u32,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            frames_averaged: 1,
            frames_summed: 1,
        }
    }
}

impl FindOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("frames_averaged", "at least 1", self.frames_averaged as f64, |v| v >= 1.0)?;
        check("frames_summed", "at least 1", self.frames_summed as f64, |v| v >= 1.0)
    }
}

/// Aperture photometry settings entered at the `PHO>` prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotOptions {
    /// Aperture radii in pixels, `A1` first.
    pub apertures: Vec<f64>,
    /// `IS`: inner radius of the sky annulus.
    pub inner_sky: f64,
    /// `OS`: outer radius of the sky annulus.
    pub outer_sky: f64,
}

impl Default for PhotOptions {
    fn default() -> Self {
        Self {
            apertures: vec![4.5, 5.0],
            inner_sky: 10.0,
            outer_sky: 20.0,
        }
    }
}

impl PhotOptions {
    pub fn new(apertures: Vec<f64>, inner_sky: f64, outer_sky: f64) -> Result<Self, ConfigError> {
        let options = Self {
            apertures,
            inner_sky,
            outer_sky,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apertures.is_empty() {
            return Err(ConfigError::NoApertures);
        }
        if self.apertures.len() > MAX_APERTURES {
            return Err(ConfigError::TooManyApertures(self.apertures.len()));
        }
        for &radius in &self.apertures {
            check("aperture", "positive", radius, |v| v > 0.0)?;
        }
        check_annulus(self.inner_sky, self.outer_sky)
    }

    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        APERTURE_KEYS
            .iter()
            .zip(&self.apertures)
            .map(|(&key, &radius)| (key, radius))
            .chain([("IS", self.inner_sky), ("OS", self.outer_sky)])
            .collect()
    }
}

/// Answers to PICK: how many PSF candidates and how faint they may be.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickOptions {
    pub stars: u32,
    pub faintest_magnitude: f64,
}

impl Default for PickOptions {
    fn default() -> Self {
        Self {
            stars: 20,
            faintest_magnitude: 18.0,
        }
    }
}

impl PickOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("stars", "at least 1", self.stars as f64, |v| v >= 1.0)?;
        check("faintest_magnitude", "finite", self.faintest_magnitude, |_| true)
    }
}

/// Settings entered at ALLSTAR's `OPT>` prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllstarOptions {
    /// `FI`: fitting radius in pixels.
    pub fitting_radius: f64,
    /// `IS`: inner sky radius used to re-estimate the local sky.
    pub inner_sky: f64,
    /// `OS`: outer sky radius used to re-estimate the local sky.
    pub outer_sky: f64,
    /// `RE`: let ALLSTAR move star centroids during the fit.
    pub redetermine_centroids: Option<bool>,
    /// `MA`: maximum number of fit iterations.
    pub max_iterations: Option<u32>,
    /// `WA`: progress display level.
    pub watch_progress: Option<f64>,
}

impl Default for AllstarOptions {
    fn default() -> Self {
        Self {
            fitting_radius: 5.0,
            inner_sky: 4.0,
            outer_sky: 40.0,
            redetermine_centroids: None,
            max_iterations: None,
            watch_progress: None,
        }
    }
}

impl AllstarOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("fitting_radius", "positive", self.fitting_radius, |v| v > 0.0)?;
        check_annulus(self.inner_sky, self.outer_sky)?;
        if let Some(iterations) = self.max_iterations {
            check("max_iterations", "at least 1", iterations as f64, |v| v >= 1.0)?;
        }
        check_opt("watch_progress", "between -2 and 2", self.watch_progress, |v| {
            (-2.0..=2.0).contains(&v)
        })
    }

    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        let mut entries = vec![
            ("FI", self.fitting_radius),
            ("IS", self.inner_sky),
            ("OS", self.outer_sky),
        ];
        if let Some(recenter) = self.redetermine_centroids {
            entries.push(("RE", if recenter { 1.0 } else { 0.0 }));
        }
        if let Some(iterations) = self.max_iterations {
            entries.push(("MA", iterations as f64));
        }
        if let Some(watch) = self.watch_progress {
            entries.push(("WA", watch));
        }
        entries
    }
}
