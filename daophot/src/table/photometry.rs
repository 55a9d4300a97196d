//! Aperture photometry tables (`.ap` files).
//!
//! After the two header lines every star takes a three-line block: a blank
//! separator, then
//!
//! ```text
//! (1X,I6,2F9.3,nF9.3)      id, x, y, magnitude per aperture
//! (4X,F9.3,2F6.2,nF9.4)    sky, sky sigma, sky skew, error per aperture
//! ```
//!
//! so magnitudes and their errors share columns from 26 onward.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use tracing::debug;

use super::{
    check_widths, malformed, parse_field, read_text, split_header, write_fields, write_text,
    Field, TableHeader, TableResult, HEADER_LABELS,
};
use crate::tools::MAX_APERTURES;

const BLOCK_LAYOUT: &str = "after the header, repeated blocks of a blank line, \
     (1X,I6,2F9.3,nF9.3) id x y magnitudes, (4X,F9.3,2F6.2,nF9.4) sky sigma skew errors";

/// Column where the first magnitude (line 1) and error (line 2) start.
const APERTURE_START: usize = 25;
const APERTURE_WIDTH: usize = 9;

/// One star's aperture photometry.
#[derive(Debug, Clone, PartialEq)]
pub struct StarPhotometry {
    pub id: u32,
    /// Centroid in DAOPHOT's 1-based pixel coordinates.
    pub x: f64,
    pub y: f64,
    pub sky: f64,
    pub sky_sigma: f64,
    pub sky_skew: f64,
    /// One entry per aperture, NaN past the table's aperture count.
    pub magnitudes: [f64; MAX_APERTURES],
    pub errors: [f64; MAX_APERTURES],
}

impl StarPhotometry {
    /// A star at `(x, y)` with no sky or aperture values yet.
    pub fn new(id: u32, x: f64, y: f64) -> Self {
        Self {
            id,
            x,
            y,
            sky: f64::NAN,
            sky_sigma: f64::NAN,
            sky_skew: f64::NAN,
            magnitudes: [f64::NAN; MAX_APERTURES],
            errors: [f64::NAN; MAX_APERTURES],
        }
    }

    /// Line 1 as written, `(1X,I6,2F9.3,nF9.3)`.
    fn position_fields(&self, apertures: usize) -> Vec<Field> {
        let mut fields = vec![
            Field::new("id", f64::from(self.id), 6, 0),
            Field::new("x", self.x, 9, 3),
            Field::new("y", self.y, 9, 3),
        ];
        fields.extend(
            self.magnitudes[..apertures]
                .iter()
                .map(|&magnitude| Field::new("magnitude", magnitude, APERTURE_WIDTH, 3)),
        );
        fields
    }

    /// Line 2 as written, `(4X,F9.3,2F6.2,nF9.4)`.
    fn sky_fields(&self, apertures: usize) -> Vec<Field> {
        let mut fields = vec![
            Field::new("sky", self.sky, 9, 3),
            Field::new("sky sigma", self.sky_sigma, 6, 2),
            Field::new("sky skew", self.sky_skew, 6, 2),
        ];
        fields.extend(
            self.errors[..apertures]
                .iter()
                .map(|&error| Field::new("magnitude error", error, APERTURE_WIDTH, 4)),
        );
        fields
    }
}

/// A parsed `.ap` file.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometryTable {
    pub header: TableHeader,
    pub stars: Vec<StarPhotometry>,
    apertures: usize,
}

impl PhotometryTable {
    /// An empty table with `apertures` magnitude columns (at most 12).
    pub fn new(header: TableHeader, apertures: usize) -> Self {
        Self {
            header,
            stars: Vec::new(),
            apertures: apertures.min(MAX_APERTURES),
        }
    }

    /// Number of magnitude/error columns every row is written with.
    pub fn aperture_count(&self) -> usize {
        self.apertures
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.stars.iter().map(|star| star.id)
    }

    pub fn get(&self, id: u32) -> Option<&StarPhotometry> {
        self.stars.iter().find(|star| star.id == id)
    }

    pub fn read(path: impl AsRef<Path>) -> TableResult<Self> {
        let path = path.as_ref();
        let table = Self::parse(&read_text(path)?, path)?;
        debug!(
            "Read {} stars with {} apertures from {}",
            table.len(),
            table.apertures,
            path.display()
        );
        Ok(table)
    }

    /// Write the table, refusing values too wide for their columns since the
    /// fixed-width reader could not recover them.
    pub fn write(&self, path: impl AsRef<Path>) -> TableResult<()> {
        let path = path.as_ref();
        check_widths(path, "header ", &self.header.fields())?;
        for star in &self.stars {
            let context = format!("star {} ", star.id);
            check_widths(path, &context, &star.position_fields(self.apertures))?;
            check_widths(path, &context, &star.sky_fields(self.apertures))?;
        }
        write_text(path, &self.to_string())?;
        debug!("Wrote {} stars to {}", self.len(), path.display());
        Ok(())
    }

    /// Parse the text of an `.ap` file; `path` only labels errors.
    pub fn parse(text: &str, path: &Path) -> TableResult<Self> {
        let (header, mut body) = split_header(text, path)?;
        while body.last().is_some_and(|line| line.trim().is_empty()) {
            body.pop();
        }

        // 1-based number of body[0].
        let mut first_line = 3;
        if body.len() % 3 == 1 && body.first().is_some_and(|line| line.trim().is_empty()) {
            body.remove(0);
            first_line += 1;
        }
        if body.len() % 3 != 0 {
            return Err(malformed(
                path,
                0,
                format!("{} lines after the header do not split into 3-line blocks", body.len()),
                BLOCK_LAYOUT,
            ));
        }

        let apertures = body
            .chunks(3)
            .map(|block| aperture_columns(block[1]))
            .max()
            .unwrap_or(0);
        if apertures > MAX_APERTURES {
            return Err(malformed(
                path,
                0,
                format!("{apertures} aperture columns, at most {MAX_APERTURES} are supported"),
                BLOCK_LAYOUT,
            ));
        }

        let mut stars = Vec::with_capacity(body.len() / 3);
        for (index, block) in body.chunks(3).enumerate() {
            let line = first_line + 3 * index;
            if !block[0].trim().is_empty() {
                return Err(malformed(path, line, "expected a blank separator line", BLOCK_LAYOUT));
            }
            stars.push(parse_star(block[1], block[2], apertures, path, line + 1)?);
        }

        Ok(Self {
            header,
            stars,
            apertures,
        })
    }

    /// Copy without the stars whose IDs are in `ids`, ordered by ID.
    pub fn remove_stars(&self, ids: &BTreeSet<u32>) -> Self {
        let mut stars: Vec<StarPhotometry> = self
            .stars
            .iter()
            .filter(|star| !ids.contains(&star.id))
            .cloned()
            .collect();
        stars.sort_by_key(|star| star.id);
        Self {
            header: self.header,
            stars,
            apertures: self.apertures,
        }
    }
}

impl fmt::Display for PhotometryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{HEADER_LABELS}")?;
        writeln!(f, "{}", self.header)?;
        for star in &self.stars {
            writeln!(f)?;
            write_fields(f, " ", &star.position_fields(self.apertures))?;
            writeln!(f)?;
            write_fields(f, "    ", &star.sky_fields(self.apertures))?;
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Magnitude columns present on a line 1.
fn aperture_columns(line: &str) -> usize {
    line.trim_end()
        .len()
        .saturating_sub(APERTURE_START)
        .div_ceil(APERTURE_WIDTH)
}

/// The trimmed text of a fixed-width column, if the line reaches it.
fn column(line: &str, start: usize, width: usize) -> Option<&str> {
    let end = (start + width).min(line.len());
    line.get(start..end)
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn required<T: std::str::FromStr>(
    line: &str,
    start: usize,
    width: usize,
    name: &str,
    path: &Path,
    number: usize,
) -> TableResult<T> {
    let text = column(line, start, width)
        .ok_or_else(|| malformed(path, number, format!("missing {name}"), BLOCK_LAYOUT))?;
    parse_field(text, path, number, BLOCK_LAYOUT)
}

fn apertures_of(
    line: &str,
    count: usize,
    path: &Path,
    number: usize,
) -> TableResult<[f64; MAX_APERTURES]> {
    let mut values = [f64::NAN; MAX_APERTURES];
    for (i, value) in values.iter_mut().take(count).enumerate() {
        if let Some(text) = column(line, APERTURE_START + i * APERTURE_WIDTH, APERTURE_WIDTH) {
            *value = parse_field(text, path, number, BLOCK_LAYOUT)?;
        }
    }
    Ok(values)
}

fn parse_star(
    first: &str,
    second: &str,
    apertures: usize,
    path: &Path,
    number: usize,
) -> TableResult<StarPhotometry> {
    Ok(StarPhotometry {
        id: required(first, 1, 6, "star id", path, number)?,
        x: required(first, 7, 9, "x", path, number)?,
        y: required(first, 16, 9, "y", path, number)?,
        magnitudes: apertures_of(first, apertures, path, number)?,
        sky: required(second, 4, 9, "sky", path, number + 1)?,
        sky_sigma: required(second, 13, 6, "sky sigma", path, number + 1)?,
        sky_skew: required(second, 19, 6, "sky skew", path, number + 1)?,
        errors: apertures_of(second, apertures, path, number + 1)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableError;
    use approx::assert_relative_eq;

    const SAMPLE: &str = "\
\x20NL    NX    NY  LOWBAD HIGHBAD  THRESH     AP1  PH/ADU  RNOISE    FRAD
  2   100   100   100.0 32766.0   30.00    4.50    1.30    5.00    5.00

      1   50.123   60.456   15.123   15.001
      101.230  3.45  0.12   0.0123   0.0119

      7   10.000   20.000   17.500   17.400
       99.870  3.40 -0.05   0.0812   0.0790
";

    fn sample() -> PhotometryTable {
        PhotometryTable::parse(SAMPLE, Path::new("sample.ap")).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let table = sample();
        assert_eq!(table.len(), 2);
        assert_eq!(table.aperture_count(), 2);
        assert_eq!(table.header.nl, 2);

        let star = table.get(7).unwrap();
        assert_relative_eq!(star.x, 10.0);
        assert_relative_eq!(star.sky, 99.87);
        assert_relative_eq!(star.sky_skew, -0.05);
        assert_relative_eq!(star.magnitudes[1], 17.4);
        assert_relative_eq!(star.errors[0], 0.0812);
        assert!(star.magnitudes[2].is_nan());
        assert!(star.errors[11].is_nan());
    }

    #[test]
    fn test_write_reproduces_layout() {
        assert_eq!(sample().to_string(), SAMPLE);
    }

    #[test]
    fn test_wide_sky_is_refused_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.ap");
        let mut table = sample();
        table.stars[1].sky = 50000.0;
        table.stars[1].sky_sigma = 1234.5;

        let text = table.to_string();
        let sky_line = text.lines().last().unwrap();
        assert_eq!(&sky_line[..19], "    50000.000******");
        assert_eq!(sky_line.len(), SAMPLE.lines().last().unwrap().len());

        let err = table.write(&path).unwrap_err();
        assert!(
            matches!(&err, TableError::Overflow { field, width: 6, .. } if field == "star 7 sky sigma"),
            "{err}"
        );
        assert!(!path.exists());
    }

    #[test]
    fn test_values_at_column_limit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge.ap");
        let mut table = sample();
        table.stars[0].sky = 99999.999;
        table.stars[0].sky_sigma = 999.99;
        table.stars[0].sky_skew = -99.99;
        table.write(&path).unwrap();

        let reread = PhotometryTable::read(&path).unwrap();
        let star = reread.get(1).unwrap();
        assert_relative_eq!(star.sky, 99999.999);
        assert_relative_eq!(star.sky_sigma, 999.99);
        assert_relative_eq!(star.sky_skew, -99.99);
    }

    #[test]
    fn test_extra_blank_after_header_tolerated() {
        let text = SAMPLE.replacen("5.00\n\n", "5.00\n\n\n", 1);
        let table = PhotometryTable::parse(&text, Path::new("sample.ap")).unwrap();
        assert_eq!(table.ids().collect::<Vec<_>>(), vec![1, 7]);
    }

    #[test]
    fn test_short_rows_padded_with_nan() {
        let text = "\
 NL    NX    NY  LOWBAD HIGHBAD  THRESH     AP1  PH/ADU  RNOISE    FRAD
  2   100   100   100.0 32766.0   30.00    4.50    1.30    5.00    5.00

      1   50.123   60.456   15.123   15.001   14.950
      101.230  3.45  0.12   0.0123   0.0119   0.0110

      2   10.000   20.000   17.500
       99.870  3.40 -0.05   0.0812
";
        let table = PhotometryTable::parse(text, Path::new("ragged.ap")).unwrap();
        assert_eq!(table.aperture_count(), 3);
        let short = table.get(2).unwrap();
        assert_relative_eq!(short.magnitudes[0], 17.5);
        assert!(short.magnitudes[1].is_nan());
        assert!(short.errors[2].is_nan());
    }

    #[test]
    fn test_truncated_block_is_malformed() {
        let text = SAMPLE.trim_end().rsplit_once('\n').unwrap().0;
        let err = PhotometryTable::parse(text, Path::new("cut.ap")).unwrap_err();
        assert!(matches!(err, TableError::Malformed { line: 0, .. }));
        let message = err.to_string();
        assert!(message.contains("cut.ap"), "{message}");
        assert!(message.contains("3-line blocks"), "{message}");
    }

    #[test]
    fn test_garbage_value_reports_line() {
        let text = SAMPLE.replace("50.123", "  oops");
        assert!(matches!(
            PhotometryTable::parse(&text, Path::new("bad.ap")),
            Err(TableError::Malformed { line: 4, .. })
        ));
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let text = SAMPLE.replacen("\n\n      7", "\n   x\n      7", 1);
        assert!(matches!(
            PhotometryTable::parse(&text, Path::new("bad.ap")),
            Err(TableError::Malformed { line: 6, .. })
        ));
    }

    #[test]
    fn test_remove_stars() {
        let table = sample();

        let unchanged = table.remove_stars(&BTreeSet::from([99]));
        assert_eq!(unchanged.len(), 2);

        let removed = table.remove_stars(&BTreeSet::from([1]));
        assert_eq!(removed.len(), 1);
        assert!(removed.get(1).is_none());
        assert_eq!(removed.aperture_count(), 2);

        assert!(table.remove_stars(&BTreeSet::from([1, 7])).is_empty());
    }

    #[test]
    fn test_remove_stars_orders_by_id() {
        let mut table = PhotometryTable::new(sample().header, 1);
        for id in [5, 2, 9] {
            let mut star = StarPhotometry::new(id, 1.0, 1.0);
            star.sky = 10.0;
            star.sky_sigma = 1.0;
            star.sky_skew = 0.0;
            table.stars.push(star);
        }
        let kept = table.remove_stars(&BTreeSet::new());
        assert_eq!(kept.ids().collect::<Vec<_>>(), vec![2, 5, 9]);
    }

    #[test]
    fn test_empty_table_round_trips() {
        let table = PhotometryTable::new(sample().header, 0);
        let text = table.to_string();
        assert_eq!(text.lines().count(), 2);
        assert_eq!(PhotometryTable::parse(&text, Path::new("e.ap")).unwrap(), table);
    }
}
