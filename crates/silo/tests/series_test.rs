//! Integration tests for fixed-length series: append, rollover, range
//! scans, reference discipline and corruption handling.

use silo::{SeriesOptions, SiloError, TimeSeries};
use tempfile::TempDir;

fn collect(series: &TimeSeries, start: u64, stop: u64) -> Vec<(u64, Vec<u8>)> {
    let mut iterator = series.iterate_range(start, stop).unwrap();
    let mut items = Vec::new();
    while let Some(item) = iterator.next_item().unwrap() {
        items.push(item);
    }
    iterator.close();
    items
}

#[test]
fn test_create_append_read() {
    let dir = TempDir::new().unwrap();
    let series = TimeSeries::create(
        dir.path().join("probe"),
        "probe",
        4,
        10,
        SeriesOptions::default(),
    )
    .unwrap();

    assert!(matches!(
        series.get_current_value(),
        Err(SiloError::InvalidArgument(_))
    ));

    series.append(100, &[0x01, 0x02, 0x03, 0x04]).unwrap();
    series.append(200, &[0x05, 0x06, 0x07, 0x08]).unwrap();
    series.append(300, &[0x09, 0x0A, 0x0B, 0x0C]).unwrap();

    assert_eq!(
        collect(&series, 0, 1000),
        vec![
            (100, vec![0x01, 0x02, 0x03, 0x04]),
            (200, vec![0x05, 0x06, 0x07, 0x08]),
            (300, vec![0x09, 0x0A, 0x0B, 0x0C]),
        ]
    );
    assert_eq!(
        collect(&series, 150, 250),
        vec![(200, vec![0x05, 0x06, 0x07, 0x08])]
    );
    assert_eq!(
        series.get_current_value().unwrap(),
        (300, vec![0x09, 0x0A, 0x0B, 0x0C])
    );
    series.close().unwrap();
}

#[test]
fn test_rollover_boundary() {
    let dir = TempDir::new().unwrap();
    let series = TimeSeries::create(
        dir.path().join("roll"),
        "roll",
        4,
        10,
        SeriesOptions::default(),
    )
    .unwrap();
    for ts in 1..=11u64 {
        series.append(ts, &[0u8; 4]).unwrap();
    }
    assert_eq!(series.last_entry_ts(), 11);
    series.close().unwrap();

    // Two chunks named by their first timestamps.
    assert!(dir.path().join("roll").join("1").is_file());
    assert!(dir.path().join("roll").join("11").is_file());

    // The old chunk stays readable: a full scan crosses the boundary.
    let series = TimeSeries::open(dir.path().join("roll"), "roll", false).unwrap();
    let timestamps: Vec<u64> = collect(&series, 0, 100)
        .into_iter()
        .map(|(ts, _)| ts)
        .collect();
    assert_eq!(timestamps, (1..=11).collect::<Vec<u64>>());

    // Range clamp: [5, 20] yields 5..=11.
    let timestamps: Vec<u64> = collect(&series, 5, 20)
        .into_iter()
        .map(|(ts, _)| ts)
        .collect();
    assert_eq!(timestamps, vec![5, 6, 7, 8, 9, 10, 11]);
    series.close().unwrap();
}

#[test]
fn test_iterator_reference_discipline() {
    let dir = TempDir::new().unwrap();
    let series = TimeSeries::create(
        dir.path().join("refs"),
        "refs",
        4,
        10,
        SeriesOptions::default(),
    )
    .unwrap();
    for ts in 1..=25u64 {
        series.append(ts, &[0u8; 4]).unwrap();
    }

    let mut iterator = series.iterate_range(0, 1 << 63).unwrap();
    let before = series.open_chunk_count();
    series.close_chunks();
    // Chunks under iteration must not be evicted.
    assert_eq!(series.open_chunk_count(), before);

    // The iterator still sees everything.
    let mut count = 0;
    while iterator.next_item().unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 25);
    iterator.close();

    // With the iterator closed, the sweep drops all but the newest chunk.
    series.close_chunks();
    assert_eq!(series.open_chunk_count(), 1);
    series.close().unwrap();
}

#[test]
fn test_footer_corruption_detection() {
    let dir = TempDir::new().unwrap();
    {
        let series = TimeSeries::create(
            dir.path().join("corrupt"),
            "corrupt",
            4,
            10,
            SeriesOptions::default(),
        )
        .unwrap();
        series.append(1, &[1, 2, 3, 4]).unwrap();
        series.close().unwrap();
    }

    let chunk_path = dir.path().join("corrupt").join("1");
    let original = std::fs::read(&chunk_path).unwrap();

    // Truncating the footer must surface as corruption.
    std::fs::write(&chunk_path, &original[..original.len() - 4]).unwrap();
    let err = TimeSeries::open(dir.path().join("corrupt"), "corrupt", false).unwrap_err();
    assert!(matches!(err, SiloError::Corruption(_)));

    // Restoring the original bytes makes the series open again.
    std::fs::write(&chunk_path, &original).unwrap();
    let series = TimeSeries::open(dir.path().join("corrupt"), "corrupt", false).unwrap();
    assert_eq!(series.get_current_value().unwrap(), (1, vec![1, 2, 3, 4]));
    series.close().unwrap();
}

#[test]
fn test_gzip_series_end_to_end() {
    let dir = TempDir::new().unwrap();
    let series = TimeSeries::create(
        dir.path().join("cold"),
        "cold",
        1,
        10,
        SeriesOptions {
            gzip_level: 6,
            ..Default::default()
        },
    )
    .unwrap();

    let mut value = 127u8;
    let mut ts = 100u64;
    for _ in 0..20 {
        series.append(ts, &[value]).unwrap();
        value -= 1;
        ts += 100;
    }

    for (start, stop) in [(0, 2000), (500, 2000), (1000, 2000), (0, 500), (0, 1200)] {
        let items = collect(&series, start, stop);
        assert!(!items.is_empty());
        assert!(items.first().unwrap().0 >= start);
        assert!(items.last().unwrap().0 <= stop);
    }
    series.close().unwrap();
}

#[test]
fn test_large_series_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let series = TimeSeries::create(
            dir.path().join("large"),
            "large",
            10,
            4096,
            SeriesOptions::default(),
        )
        .unwrap();
        for ts in 1..=8000u64 {
            series.append(ts, &[0u8; 10]).unwrap();
        }
        series.close().unwrap();
    }

    let series = TimeSeries::open(dir.path().join("large"), "large", false).unwrap();
    for ts in 8001..=16_000u64 {
        series.append(ts, &[0u8; 10]).unwrap();
    }

    let mut expected = 1u64;
    let mut iterator = series.iterate_range(0, 17_000).unwrap();
    while let Some((ts, _)) = iterator.next_item().unwrap() {
        assert_eq!(ts, expected, "scan out of order at {ts}");
        expected += 1;
    }
    assert_eq!(expected, 16_001);
    iterator.close();
    series.close().unwrap();
}

#[test]
fn test_trim_keeps_newest_data() {
    let dir = TempDir::new().unwrap();
    let series = TimeSeries::create(
        dir.path().join("trim"),
        "trim",
        10,
        4096,
        SeriesOptions::default(),
    )
    .unwrap();
    for ts in 0..8000u64 {
        series.append(ts, &[0u8; 10]).unwrap();
    }

    series.trim(4100).unwrap();

    let entries = std::fs::read_dir(dir.path().join("trim")).unwrap().count();
    assert_eq!(entries, 2, "metadata document plus one surviving chunk");
    assert_eq!(collect(&series, 0, 10_000).len(), 8000 - 4096);
    series.close().unwrap();
}
