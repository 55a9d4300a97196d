//! Readers and writers for the text tables DAOPHOT and ALLSTAR produce.
//!
//! Both file kinds open with the same two-line header: a row of column labels
//! and a row of ten numbers describing the frame and the reduction settings.

mod fit_result;
mod photometry;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

pub use fit_result::{FitResult, FitResultTable};
pub use photometry::{PhotometryTable, StarPhotometry};

/// Column labels of the first header line.
pub const HEADER_LABELS: &str =
    " NL    NX    NY  LOWBAD HIGHBAD  THRESH     AP1  PH/ADU  RNOISE    FRAD";

/// Layout of the header's numeric line.
pub(crate) const STATS_LAYOUT: &str =
    "NL NX NY (integers) then LOWBAD HIGHBAD THRESH AP1 PH/ADU RNOISE FRAD";

/// Errors reading or writing a table file.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file does not have the structure its kind requires.
    #[error("{}:{line}: {reason}; expected {layout}", path.display())]
    Malformed {
        path: PathBuf,
        /// 1-based line number, 0 when the problem concerns the whole file.
        line: usize,
        reason: String,
        layout: &'static str,
    },

    /// A value needs more columns than its fixed-width field has.
    #[error("cannot write {}: {field} = {value} does not fit in {width} columns", path.display())]
    Overflow {
        path: PathBuf,
        field: String,
        value: f64,
        width: usize,
    },
}

/// Result type for table operations.
pub type TableResult<T> = Result<T, TableError>;

pub(crate) fn malformed(
    path: &Path,
    line: usize,
    reason: impl Into<String>,
    layout: &'static str,
) -> TableError {
    TableError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: reason.into(),
        layout,
    }
}

pub(crate) fn read_text(path: &Path) -> TableResult<String> {
    std::fs::read_to_string(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn write_text(path: &Path, text: &str) -> TableResult<()> {
    std::fs::write(path, text).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// One Fortran `Fw.d` output field. A value wider than `width` prints as
/// `width` asterisks, never spilling into the next column.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    pub name: &'static str,
    pub value: f64,
    pub width: usize,
    pub precision: usize,
}

impl Field {
    pub(crate) const fn new(
        name: &'static str,
        value: f64,
        width: usize,
        precision: usize,
    ) -> Self {
        Self {
            name,
            value,
            width,
            precision,
        }
    }

    pub(crate) fn fits(&self) -> bool {
        self.formatted().len() <= self.width
    }

    fn formatted(&self) -> String {
        format!("{:w$.p$}", self.value, w = self.width, p = self.precision)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.formatted();
        if text.len() > self.width {
            f.write_str(&"*".repeat(self.width))
        } else {
            f.write_str(&text)
        }
    }
}

/// Write `fields` back to back after `indent`.
pub(crate) fn write_fields(
    f: &mut fmt::Formatter<'_>,
    indent: &str,
    fields: &[Field],
) -> fmt::Result {
    f.write_str(indent)?;
    fields.iter().try_for_each(|field| write!(f, "{field}"))
}

/// The first field too wide for its column, as an `Overflow` error.
pub(crate) fn check_widths(path: &Path, context: &str, fields: &[Field]) -> TableResult<()> {
    match fields.iter().find(|field| !field.fits()) {
        Some(field) => Err(TableError::Overflow {
            path: path.to_path_buf(),
            field: format!("{context}{}", field.name),
            value: field.value,
            width: field.width,
        }),
        None => Ok(()),
    }
}

/// The numeric header line shared by both table kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableHeader {
    /// File kind code: 1 for FIND, 2 for PHOT, 1 for ALLSTAR results.
    pub nl: i32,
    pub nx: i32,
    pub ny: i32,
    /// Lowest good data value.
    pub low_bad: f64,
    /// Highest good data value.
    pub high_bad: f64,
    pub threshold: f64,
    /// Radius of the first aperture.
    pub ap1: f64,
    /// Photons per ADU.
    pub gain: f64,
    /// Read noise in ADU.
    pub read_noise: f64,
    pub fitting_radius: f64,
}

impl TableHeader {
    /// Parse the numeric header line. `line` is the 1-based line number used
    /// in errors.
    pub fn parse(text: &str, path: &Path, line: usize) -> TableResult<Self> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        if fields.len() != 10 {
            return Err(malformed(
                path,
                line,
                format!("header has {} fields instead of 10", fields.len()),
                STATS_LAYOUT,
            ));
        }

        let int = |i: usize| parse_field::<i32>(fields[i], path, line, STATS_LAYOUT);
        let float = |i: usize| parse_field::<f64>(fields[i], path, line, STATS_LAYOUT);
        Ok(Self {
            nl: int(0)?,
            nx: int(1)?,
            ny: int(2)?,
            low_bad: float(3)?,
            high_bad: float(4)?,
            threshold: float(5)?,
            ap1: float(6)?,
            gain: float(7)?,
            read_noise: float(8)?,
            fitting_radius: float(9)?,
        })
    }

    /// The numeric line as written, Fortran `(1X,I2,2I6,2F8.1,5F8.2)`.
    pub(crate) fn fields(&self) -> [Field; 10] {
        [
            Field::new("NL", f64::from(self.nl), 2, 0),
            Field::new("NX", f64::from(self.nx), 6, 0),
            Field::new("NY", f64::from(self.ny), 6, 0),
            Field::new("LOWBAD", self.low_bad, 8, 1),
            Field::new("HIGHBAD", self.high_bad, 8, 1),
            Field::new("THRESH", self.threshold, 8, 2),
            Field::new("AP1", self.ap1, 8, 2),
            Field::new("PH/ADU", self.gain, 8, 2),
            Field::new("RNOISE", self.read_noise, 8, 2),
            Field::new("FRAD", self.fitting_radius, 8, 2),
        ]
    }
}

impl fmt::Display for TableHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_fields(f, " ", &self.fields())
    }
}

/// Split off the two header lines, parsing the numeric one.
///
/// Returns the header and the remaining lines, which start at line 3.
pub(crate) fn split_header<'a>(
    text: &'a str,
    path: &Path,
) -> TableResult<(TableHeader, Vec<&'a str>)> {
    let mut lines = text.lines();
    if lines.next().is_none() {
        return Err(malformed(path, 0, "file is empty", STATS_LAYOUT));
    }
    let stats = lines
        .next()
        .ok_or_else(|| malformed(path, 2, "missing header values", STATS_LAYOUT))?;
    let header = TableHeader::parse(stats, path, 2)?;
    Ok((header, lines.collect()))
}

pub(crate) fn parse_field<T: FromStr>(
    text: &str,
    path: &Path,
    line: usize,
    layout: &'static str,
) -> TableResult<T> {
    text.trim()
        .parse()
        .map_err(|_| malformed(path, line, format!("{:?} is not a number", text.trim()), layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const STATS: &str = "  2   100   120   100.0 32766.0   30.00    4.50    1.30    5.00    5.00";

    #[test]
    fn test_header_parse() {
        let header = TableHeader::parse(STATS, Path::new("x.ap"), 2).unwrap();
        assert_eq!((header.nl, header.nx, header.ny), (2, 100, 120));
        assert_relative_eq!(header.high_bad, 32766.0);
        assert_relative_eq!(header.gain, 1.3);
        assert_relative_eq!(header.fitting_radius, 5.0);
    }

    #[test]
    fn test_header_format_is_fixed_width() {
        let header = TableHeader::parse(STATS, Path::new("x.ap"), 2).unwrap();
        assert_eq!(header.to_string(), STATS);
    }

    #[test]
    fn test_wide_header_value_fills_with_asterisks() {
        let mut header = TableHeader::parse(STATS, Path::new("x.ap"), 2).unwrap();
        header.threshold = 123456.0;
        let text = header.to_string();
        assert_eq!(&text[31..39], "********");
        assert_eq!(text.len(), STATS.len());

        let err = check_widths(Path::new("x.ap"), "header ", &header.fields()).unwrap_err();
        assert!(matches!(err, TableError::Overflow { width: 8, .. }));
        assert!(err.to_string().contains("header THRESH"), "{err}");
    }

    #[test]
    fn test_field_keeps_nan_in_its_column() {
        assert_eq!(Field::new("mag", f64::NAN, 9, 3).to_string(), "      NaN");
        assert_eq!(Field::new("id", 7.0, 6, 0).to_string(), "     7");
        assert_eq!(Field::new("id", 1_234_567.0, 6, 0).to_string(), "******");
    }

    #[test]
    fn test_header_rejects_wrong_field_count() {
        let err = TableHeader::parse("1 2 3", Path::new("x.ap"), 2).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("x.ap:2"), "{message}");
        assert!(message.contains("NL NX NY"), "{message}");
    }

    #[test]
    fn test_header_rejects_fractional_size() {
        let stats = "  2   100.5   120   100.0 32766.0   30.00    4.50    1.30    5.00    5.00";
        assert!(matches!(
            TableHeader::parse(stats, Path::new("x.ap"), 2),
            Err(TableError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = read_text(Path::new("/nonexistent/run.als")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/run.als"));
    }
}
