//! Post-fit validity check on the star-subtracted image.
//!
//! A good PSF subtraction leaves residuals consistent with noise. A star whose
//! neighbourhood in the residual image holds several strongly negative pixels
//! was over-subtracted (a blend, a cosmic ray, a bad centroid) and is dropped
//! before the second ALLSTAR pass.

use std::collections::BTreeSet;

use ndarray::{s, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::table::FitResult;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidityError {
    #[error("signal image is {signal:?} but residual image is {residual:?}")]
    ShapeMismatch {
        signal: (usize, usize),
        residual: (usize, usize),
    },
}

/// Per-pixel CCD noise in ADU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseModel {
    /// Electrons per ADU.
    pub gain: f64,
    pub read_noise: f64,
}

impl NoiseModel {
    pub fn new(gain: f64, read_noise: f64) -> Self {
        Self { gain, read_noise }
    }

    /// Noise of a pixel holding `signal` ADU: `sqrt(|signal|·gain + rn²) / gain`.
    pub fn sigma(&self, signal: f64) -> f64 {
        (signal.abs() * self.gain + self.read_noise * self.read_noise).sqrt() / self.gain
    }
}

/// Tunables of the validity check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValiditySettings {
    /// Half-width of the square neighbourhood, in pixels.
    pub radius: usize,
    /// Residual/noise ratio below which a pixel counts as negative. Should be ≤ 0.
    pub snr_cutoff: f64,
    /// Most negative pixels a valid star may have.
    pub max_negative_pixels: usize,
}

impl Default for ValiditySettings {
    fn default() -> Self {
        Self {
            radius: 3,
            snr_cutoff: -5.0,
            max_negative_pixels: 2,
        }
    }
}

/// Why a star was kept or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// The neighbourhood is off the image or entirely masked.
    NoFinitePixels,
    /// Too many pixels fell below the cutoff.
    OverSubtracted { negative_pixels: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StarVerdict {
    pub id: u32,
    pub verdict: Verdict,
}

impl StarVerdict {
    pub fn is_valid(&self) -> bool {
        self.verdict == Verdict::Valid
    }
}

/// Judges fitted stars against the residual image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StarValidator {
    pub noise: NoiseModel,
    pub settings: ValiditySettings,
}

impl StarValidator {
    pub fn new(noise: NoiseModel, settings: ValiditySettings) -> Self {
        Self { noise, settings }
    }

    /// Judge every star. `signal` is the image that was fitted and `residual`
    /// the star-subtracted one; both are indexed `[row, column]`.
    pub fn check(
        &self,
        signal: ArrayView2<f64>,
        residual: ArrayView2<f64>,
        stars: &[FitResult],
    ) -> Result<Vec<StarVerdict>, ValidityError> {
        if signal.dim() != residual.dim() {
            return Err(ValidityError::ShapeMismatch {
                signal: signal.dim(),
                residual: residual.dim(),
            });
        }

        let verdicts = stars
            .iter()
            .map(|star| StarVerdict {
                id: star.id,
                verdict: self.judge(signal, residual, star.x, star.y),
            })
            .collect();
        Ok(verdicts)
    }

    fn judge(
        &self,
        signal: ArrayView2<f64>,
        residual: ArrayView2<f64>,
        x: f64,
        y: f64,
    ) -> Verdict {
        let Some((rows, cols)) = self.window(signal.dim(), x, y) else {
            return Verdict::NoFinitePixels;
        };
        let signal = signal.slice(s![rows.0..rows.1, cols.0..cols.1]);
        let residual = residual.slice(s![rows.0..rows.1, cols.0..cols.1]);

        let mut usable = 0usize;
        let mut negative = 0usize;
        Zip::from(&signal).and(&residual).for_each(|&value, &left| {
            if !value.is_finite() || !left.is_finite() {
                return;
            }
            usable += 1;
            if left / self.noise.sigma(value) < self.settings.snr_cutoff {
                negative += 1;
            }
        });

        if usable == 0 {
            Verdict::NoFinitePixels
        } else if negative > self.settings.max_negative_pixels {
            Verdict::OverSubtracted {
                negative_pixels: negative,
            }
        } else {
            Verdict::Valid
        }
    }

    /// Row and column ranges of the neighbourhood of the 1-based position
    /// `(x, y)`, clipped to the image; `None` if nothing is left.
    fn window(
        &self,
        (height, width): (usize, usize),
        x: f64,
        y: f64,
    ) -> Option<((usize, usize), (usize, usize))> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let radius = self.settings.radius as f64;
        let clip = |center: f64, len: usize| -> Option<(usize, usize)> {
            let center = (center - 1.0).round();
            let low = (center - radius).max(0.0);
            let high = (center + radius + 1.0).min(len as f64);
            (low < high).then_some((low as usize, high as usize))
        };
        Some((clip(y, height)?, clip(x, width)?))
    }
}

/// IDs of the stars that failed the check.
pub fn rejected_ids(verdicts: &[StarVerdict]) -> BTreeSet<u32> {
    let rejected: BTreeSet<u32> = verdicts
        .iter()
        .filter(|verdict| !verdict.is_valid())
        .map(|verdict| verdict.id)
        .collect();
    debug!("{} of {} stars rejected", rejected.len(), verdicts.len());
    rejected
}
