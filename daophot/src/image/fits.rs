//! FITS files through `fitsio`.
//!
//! Reading and header cards go through the crate's `compat` layer. A primary
//! HDU of a given shape cannot be created there, so the header and pixel data
//! are built with the core image module first and the cards added after.

use std::path::Path;

use fitsio::compat::fitsfile::FitsFile;
use fitsio::compat::hdu::HduInfo;
use fitsio::compat::images::ReadImage;
use fitsio::image::{build_image_hdu, ImageData};
use ndarray::Array2;
use tracing::debug;

use super::{Image, ImageError, ImageIo, ImageResult, GAIN_KEY, READ_NOISE_KEY};

/// Header cards carried from an input image to the prepared one.
const CARRIED_KEYS: [&str; 2] = [GAIN_KEY, READ_NOISE_KEY];

/// BITPIX of 64-bit floating point pixels.
const DOUBLE_BITPIX: i64 = -64;

fn fits_error(path: &Path, error: impl std::fmt::Display) -> ImageError {
    ImageError::Fits {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

/// Primary-HDU images on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsImageIo;

impl ImageIo for FitsImageIo {
    fn open_image(&self, path: &Path) -> ImageResult<Image> {
        if !path.exists() {
            return Err(ImageError::NotFound(path.to_path_buf()));
        }
        let file = FitsFile::open(path).map_err(|e| fits_error(path, e))?;
        let hdu = file.primary_hdu().map_err(|e| fits_error(path, e))?;

        // NAXIS1 (columns) comes first and varies fastest.
        let shape = match hdu.info(&file).map_err(|e| fits_error(path, e))? {
            HduInfo::ImageInfo { shape, .. } if shape.len() == 2 => (shape[1], shape[0]),
            _ => return Err(fits_error(path, "primary HDU is not a 2-D image")),
        };
        let pixels = f64::read_image(&file, &hdu).map_err(|e| fits_error(path, e))?;
        let data = Array2::from_shape_vec(shape, pixels).map_err(|e| fits_error(path, e))?;

        let mut image = Image::new(data);
        for key in CARRIED_KEYS {
            if let Ok(value) = hdu.read_key::<f64>(&file, key) {
                image.header.insert(key.to_string(), value);
            }
        }
        debug!("Opened {} ({}x{})", path.display(), shape.1, shape.0);
        Ok(image)
    }

    fn write_image(&self, path: &Path, image: &Image) -> ImageResult<()> {
        let (rows, cols) = image.data.dim();
        let pixels = ImageData::F64(image.data.iter().copied().collect());
        let bytes = build_image_hdu(DOUBLE_BITPIX, &[cols, rows], &pixels)
            .map_err(|e| fits_error(path, e))?;
        std::fs::write(path, bytes).map_err(|e| fits_error(path, e))?;

        let mut file = FitsFile::edit(path).map_err(|e| fits_error(path, e))?;
        let hdu = file.primary_hdu().map_err(|e| fits_error(path, e))?;
        for (key, value) in &image.header {
            hdu.write_key(&mut file, key, value)
                .map_err(|e| fits_error(path, e))?;
        }
        file.flush().map_err(|e| fits_error(path, e))?;
        debug!("Wrote {} ({}x{})", path.display(), cols, rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_write_then_open_keeps_pixels_and_cards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        let data = array![[1.0, 2.0, 3.0], [4.5, -5.25, 6.0]];
        let image = Image::new(data.clone())
            .with_card(GAIN_KEY, 1.3)
            .with_card(READ_NOISE_KEY, 5.0);

        FitsImageIo.write_image(&path, &image).unwrap();
        let reread = FitsImageIo.open_image(&path).unwrap();

        assert_eq!(reread.data, data);
        assert_relative_eq!(reread.gain().unwrap(), 1.3);
        assert_relative_eq!(reread.read_noise().unwrap(), 5.0);
    }

    #[test]
    fn test_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.fits");
        FitsImageIo
            .write_image(&path, &Image::new(Array2::zeros((4, 4))))
            .unwrap();
        FitsImageIo
            .write_image(&path, &Image::new(Array2::from_elem((2, 5), 7.0)))
            .unwrap();

        let reread = FitsImageIo.open_image(&path).unwrap();
        assert_eq!(reread.data.dim(), (2, 5));
        assert!(reread.header.is_empty());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = FitsImageIo.open_image(&dir.path().join("absent.fits")).unwrap_err();
        assert!(matches!(err, ImageError::NotFound(_)));
    }
}
