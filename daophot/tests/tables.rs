//! Photometry and fit-result files written and read back from disk.

use std::collections::BTreeSet;

use approx::assert_relative_eq;
use daophot::table::{FitResultTable, PhotometryTable, StarPhotometry, TableError, TableHeader};

fn header(apertures: i32) -> TableHeader {
    TableHeader {
        nl: apertures,
        nx: 2048,
        ny: 4096,
        low_bad: 250.3,
        high_bad: 32766.0,
        threshold: 42.17,
        ap1: 3.0,
        gain: 1.3,
        read_noise: 5.0,
        fitting_radius: 4.5,
    }
}

fn table_with(ids: &[u32]) -> PhotometryTable {
    let mut table = PhotometryTable::new(header(2), 2);
    for &id in ids {
        let mut star = StarPhotometry::new(id, 100.0 + f64::from(id), 2000.5 - f64::from(id));
        star.sky = 1012.25;
        star.sky_sigma = 4.5;
        star.sky_skew = -0.25;
        star.magnitudes[0] = 15.125;
        star.magnitudes[1] = 14.875;
        star.errors[0] = 0.0125;
        star.errors[1] = 0.0094;
        table.stars.push(star);
    }
    table
}

#[test]
fn test_photometry_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.ap");
    let table = table_with(&[3, 17, 250]);
    table.write(&path).unwrap();

    let reread = PhotometryTable::read(&path).unwrap();
    assert_eq!(reread.header.nx, 2048);
    assert_eq!(reread.header.ny, 4096);
    assert_relative_eq!(reread.header.threshold, 42.17);
    assert_eq!(reread.aperture_count(), 2);
    assert_eq!(reread.ids().collect::<Vec<_>>(), vec![3, 17, 250]);

    let star = reread.get(17).unwrap();
    assert_relative_eq!(star.x, 117.0);
    assert_relative_eq!(star.y, 1983.5);
    assert_relative_eq!(star.sky, 1012.25);
    assert_relative_eq!(star.sky_sigma, 4.5);
    assert_relative_eq!(star.sky_skew, -0.25);
    assert_relative_eq!(star.magnitudes[1], 14.875);
    assert_relative_eq!(star.errors[0], 0.0125);
    assert!(star.magnitudes[2].is_nan());
}

#[test]
fn test_removing_a_star_keeps_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("field.ap");
    let cleaned = dir.path().join("field.cleanap");
    table_with(&[1, 2, 3, 4]).write(&source).unwrap();

    let table = PhotometryTable::read(&source).unwrap();
    table
        .remove_stars(&BTreeSet::from([3]))
        .write(&cleaned)
        .unwrap();

    let reread = PhotometryTable::read(&cleaned).unwrap();
    assert_eq!(reread.len(), 3);
    assert_eq!(reread.aperture_count(), 2);
    assert_eq!(reread.ids().collect::<Vec<_>>(), vec![1, 2, 4]);
    assert_eq!(reread.header, table.header);
}

#[test]
fn test_removing_every_star_leaves_header_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.ap");
    table_with(&[5, 6])
        .remove_stars(&BTreeSet::from([5, 6]))
        .write(&path)
        .unwrap();

    let reread = PhotometryTable::read(&path).unwrap();
    assert!(reread.is_empty());
    assert_relative_eq!(reread.header.low_bad, 250.3);
}

#[test]
fn test_fit_results_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field.als");
    std::fs::write(
        &path,
        " NL    NX    NY  LOWBAD HIGHBAD  THRESH     AP1  PH/ADU  RNOISE    FRAD\n  \
         1  2048  4096   250.3 32766.0   42.17    3.00    1.30    5.00    4.50\n\n      \
         7  117.012 1983.498   15.102   0.0121  1012.250       4.    0.981   -0.012\n     \
         12  250.700  300.100   17.880   0.0543  1011.900       9.    1.212    0.104\n",
    )
    .unwrap();

    let table = FitResultTable::read(&path).unwrap();
    assert_eq!(table.header.nl, 1);
    assert_eq!(table.stars.len(), 2);
    assert_eq!(table.stars[1].id, 12);
    assert_relative_eq!(table.stars[0].x, 117.012);
    assert_relative_eq!(table.stars[1].magnitude, 17.88);
    assert_relative_eq!(table.stars[1].sharpness, 0.104);
}

#[test]
fn test_missing_file_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.ap");
    let err = PhotometryTable::read(&path).unwrap_err();
    assert!(matches!(err, TableError::Io { .. }));
    assert!(err.to_string().contains("absent.ap"), "{err}");
}
