//! ALLSTAR fit results (`.als` files), read-only.

use std::path::Path;

use tracing::debug;

use super::{malformed, parse_field, read_text, split_header, TableHeader, TableResult};

const ROW_LAYOUT: &str =
    "one whitespace-separated row per star: id x y mag err sky [iterations chi sharpness]";

/// One star fitted by ALLSTAR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitResult {
    pub id: u32,
    /// Fitted centroid in 1-based pixel coordinates.
    pub x: f64,
    pub y: f64,
    pub magnitude: f64,
    pub magnitude_error: f64,
    pub sky: f64,
    /// NaN when the row does not carry fit diagnostics.
    pub iterations: f64,
    pub chi: f64,
    pub sharpness: f64,
}

/// A parsed `.als` file.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResultTable {
    pub header: TableHeader,
    pub stars: Vec<FitResult>,
}

impl FitResultTable {
    pub fn read(path: impl AsRef<Path>) -> TableResult<Self> {
        let path = path.as_ref();
        let table = Self::parse(&read_text(path)?, path)?;
        debug!("Read {} fitted stars from {}", table.stars.len(), path.display());
        Ok(table)
    }

    /// Parse the text of an `.als` file; `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> TableResult<Self> {
        let (header, body) = split_header(text, path)?;

        let mut stars = Vec::new();
        for (offset, line) in body.iter().enumerate() {
            let number = offset + 3;
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 6 {
                return Err(malformed(
                    path,
                    number,
                    format!("row has {} fields, at least 6 are required", fields.len()),
                    ROW_LAYOUT,
                ));
            }

            let float = |i: usize| -> TableResult<f64> {
                match fields.get(i) {
                    Some(text) => parse_field(text, path, number, ROW_LAYOUT),
                    None => Ok(f64::NAN),
                }
            };
            stars.push(FitResult {
                id: parse_field(fields[0], path, number, ROW_LAYOUT)?,
                x: float(1)?,
                y: float(2)?,
                magnitude: float(3)?,
                magnitude_error: float(4)?,
                sky: float(5)?,
                iterations: float(6)?,
                chi: float(7)?,
                sharpness: float(8)?,
            });
        }

        Ok(Self { header, stars })
    }
}
