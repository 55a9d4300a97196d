//! Image access for the pipeline.
//!
//! The tools read and write FITS files themselves; the pipeline only needs to
//! prepare the working image and read the residual back. [`ImageIo`] is that
//! boundary: [`MemoryImageIo`] serves tests, `fits::FitsImageIo` (feature
//! `fits`) serves real runs.

#[cfg(feature = "fits")]
pub mod fits;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::{Array2, ArrayView2, Zip};
use thiserror::Error;

/// Header key holding electrons per ADU.
pub const GAIN_KEY: &str = "GAIN";
/// Header key holding read noise in ADU.
pub const READ_NOISE_KEY: &str = "RDNOISE";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("{}: {message}", path.display())]
    Fits { path: PathBuf, message: String },

    #[error("weight map is {found:?} but image is {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

/// Result type for image access.
pub type ImageResult<T> = Result<T, ImageError>;

/// Pixels indexed `[row, column]` plus the numeric header cards.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub data: Array2<f64>,
    pub header: BTreeMap<String, f64>,
}

impl Image {
    pub fn new(data: Array2<f64>) -> Self {
        Self {
            data,
            header: BTreeMap::new(),
        }
    }

    pub fn with_card(mut self, key: &str, value: f64) -> Self {
        self.header.insert(key.to_string(), value);
        self
    }

    pub fn card(&self, key: &str) -> Option<f64> {
        self.header.get(key).copied()
    }

    pub fn gain(&self) -> Option<f64> {
        self.card(GAIN_KEY)
    }

    pub fn read_noise(&self) -> Option<f64> {
        self.card(READ_NOISE_KEY)
    }

    /// Mask every pixel whose weight is zero or negative as NaN.
    pub fn apply_weights(&mut self, weights: ArrayView2<f64>) -> ImageResult<()> {
        if weights.dim() != self.data.dim() {
            return Err(ImageError::ShapeMismatch {
                expected: self.data.dim(),
                found: weights.dim(),
            });
        }
        Zip::from(&mut self.data)
            .and(&weights)
            .for_each(|pixel, &weight| {
                if weight <= 0.0 {
                    *pixel = f64::NAN;
                }
            });
        Ok(())
    }

    /// `data * prescale + add_sky`, pixel by pixel.
    pub fn rescale(&mut self, prescale: f64, add_sky: f64) {
        self.data.mapv_inplace(|pixel| pixel * prescale + add_sky);
    }
}

/// `<base>.weight.fits` next to `<base>.fits`.
pub fn weight_map_path(image: &Path) -> PathBuf {
    let text = image.to_string_lossy();
    let base = text.strip_suffix(".fits").unwrap_or(&text);
    PathBuf::from(format!("{base}.weight.fits"))
}

/// Reading and writing images.
pub trait ImageIo {
    fn open_image(&self, path: &Path) -> ImageResult<Image>;

    fn write_image(&self, path: &Path, image: &Image) -> ImageResult<()>;

    /// The weight map belonging to `image`, if there is one.
    fn read_weight_mask(&self, image: &Path) -> ImageResult<Option<Array2<f64>>> {
        let weights = weight_map_path(image);
        match self.open_image(&weights) {
            Ok(mask) => Ok(Some(mask.data)),
            Err(ImageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Images held in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryImageIo {
    images: Mutex<HashMap<PathBuf, Image>>,
}

impl MemoryImageIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, image: Image) {
        self.lock().insert(path.into(), image);
    }

    pub fn get(&self, path: &Path) -> Option<Image> {
        self.lock().get(path).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Image>> {
        self.images
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ImageIo for MemoryImageIo {
    fn open_image(&self, path: &Path) -> ImageResult<Image> {
        self.get(path)
            .ok_or_else(|| ImageError::NotFound(path.to_path_buf()))
    }

    fn write_image(&self, path: &Path, image: &Image) -> ImageResult<()> {
        self.insert(path, image.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_weight_map_path() {
        assert_eq!(
            weight_map_path(Path::new("/data/m31.fits")),
            PathBuf::from("/data/m31.weight.fits")
        );
        assert_eq!(
            weight_map_path(Path::new("frame.fit")),
            PathBuf::from("frame.fit.weight.fits")
        );
    }

    #[test]
    fn test_apply_weights_masks_non_positive() {
        let mut image = Image::new(array![[1.0, 2.0], [3.0, 4.0]]);
        image
            .apply_weights(array![[1.0, 0.0], [-2.0, 0.5]].view())
            .unwrap();
        assert_relative_eq!(image.data[[0, 0]], 1.0);
        assert!(image.data[[0, 1]].is_nan());
        assert!(image.data[[1, 0]].is_nan());
        assert_relative_eq!(image.data[[1, 1]], 4.0);
    }

    #[test]
    fn test_apply_weights_rejects_other_shape() {
        let mut image = Image::new(Array2::zeros((2, 2)));
        assert!(matches!(
            image.apply_weights(Array2::ones((3, 2)).view()),
            Err(ImageError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rescale() {
        let mut image = Image::new(array![[1.0, f64::NAN]]);
        image.rescale(2.0, 10.0);
        assert_relative_eq!(image.data[[0, 0]], 12.0);
        assert!(image.data[[0, 1]].is_nan());
    }

    #[test]
    fn test_memory_io_weight_mask() {
        let io = MemoryImageIo::new();
        let image = Path::new("/w/a.fits");
        assert!(io.read_weight_mask(image).unwrap().is_none());

        io.insert("/w/a.weight.fits", Image::new(Array2::ones((2, 2))));
        let mask = io.read_weight_mask(image).unwrap().unwrap();
        assert_eq!(mask.dim(), (2, 2));
    }

    #[test]
    fn test_header_cards() {
        let image = Image::new(Array2::zeros((1, 1))).with_card(GAIN_KEY, 1.5);
        assert_eq!(image.gain(), Some(1.5));
        assert_eq!(image.read_noise(), None);
    }
}
