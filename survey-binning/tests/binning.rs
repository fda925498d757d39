mod common;

use survey_binning::{
    AnalysisStore, BinningEngine, BinningMode, GridTransform, MapBuilder, MapKind, NoProgress,
    Point3, PointEdits, PointList, Range, Reflector, RunControl, RunOutcome, RunRequest,
    StoreError, StoreState, TraceFlags, UniqueFold,
};

fn run_full(engine: &BinningEngine, dir: &std::path::Path) -> survey_binning::BinningResult {
    match engine
        .run(&RunRequest::full(dir), &RunControl::new(), &NoProgress)
        .unwrap()
    {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled(_) => panic!("run was not cancelled"),
    }
}

#[test]
fn test_fold_sum_matches_accepted_traces() {
    let engine = common::engine();
    let result = engine.run_basic().unwrap();
    let plan = engine.plan();

    assert_eq!(result.aggregates.total_fold(), result.stats.traces_accepted);
    assert_eq!(
        result.stats.traces_accepted
            + result.stats.pairs_outside_limits
            + result.stats.pairs_outside_grid
            + result.stats.pairs_no_reflection,
        result.stats.pairs_considered
    );
    assert!(result.stats.pairs_considered <= plan.max_traces);
    assert!(result.stats.points_clipped > 0);
}

#[test]
fn test_unique_fold_bounded_by_fold() {
    let result = common::engine().run_basic().unwrap();
    let mut repeated = 0;
    for cell in result.aggregates.cells() {
        assert!(cell.unique_fold <= cell.fold);
        repeated += cell.fold - cell.unique_fold;
    }
    // The infill template repeats pairs of the first patch instance.
    assert!(repeated > 0);
}

#[test]
fn test_full_mode_store_matches_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::engine();
    let result = run_full(&engine, dir.path());
    assert_eq!(result.mode, BinningMode::Full);
    assert_eq!(result.store_records, Some(result.stats.traces_accepted));
    assert_eq!(AnalysisStore::state(dir.path()).unwrap(), StoreState::Complete);

    let store = AnalysisStore::open_matching(dir.path(), engine.fingerprint()).unwrap();
    assert_eq!(store.record_count(), result.aggregates.total_fold());

    let from_aggregates = MapBuilder::from_aggregates(&result.aggregates, &GridTransform::default());
    let from_store = MapBuilder::from_store(&store, &GridTransform::default()).unwrap();
    for kind in [MapKind::Fold, MapKind::UniqueFold, MapKind::MinOffset, MapKind::MaxOffset] {
        assert_eq!(from_store.build(kind).values, from_aggregates.build(kind).values, "{kind}");
    }

    for (i, cell) in result.aggregates.cells().iter().enumerate() {
        let bin = result.aggregates.grid().from_linear(i as u64);
        let records = store.records_in_bin(bin).unwrap();
        assert_eq!(records.len(), cell.fold as usize);
        let unique = records
            .iter()
            .filter(|r| r.flags.contains(TraceFlags::UNIQUE))
            .count();
        assert_eq!(unique, cell.unique_fold as usize);
    }
}

#[test]
fn test_reruns_are_identical() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let first = run_full(&common::engine(), first_dir.path());
    let second = run_full(&common::engine(), second_dir.path());

    assert_eq!(first.aggregates.to_bytes(), second.aggregates.to_bytes());
    assert_eq!(
        common::store_records(first_dir.path()),
        common::store_records(second_dir.path())
    );
}

#[test]
fn test_rerun_replaces_previous_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::engine();
    run_full(&engine, dir.path());
    let again = run_full(&engine, dir.path());
    assert_eq!(
        common::store_records(dir.path()).len() as u64,
        again.stats.traces_accepted
    );
}

#[test]
fn test_empty_bins_are_nodata() {
    let result = common::engine().run_basic().unwrap();
    let rasters = MapBuilder::from_aggregates(&result.aggregates, &GridTransform::default()).build_all();
    assert_eq!(rasters.len(), MapKind::ALL.len());

    for raster in &rasters {
        for (value, cell) in raster.values.iter().zip(result.aggregates.cells()) {
            assert_eq!(value.is_none(), cell.fold == 0, "{}", raster.kind);
        }
        assert!(raster.stats().nodata_cells > 0);
    }
    let summary = result.summary;
    assert!(summary.min_fold > 0);
    assert!(summary.min_rms_increment >= 0.0);
}

#[test]
fn test_point_edits_make_store_stale() {
    let dir = tempfile::tempdir().unwrap();
    let engine = common::engine();
    run_full(&engine, dir.path());

    let mut list = PointList::from_geometry(
        engine.geometry(),
        engine.config(),
        &GridTransform::default(),
    );
    list.sources[0].x += 5.0;
    let edited = BinningEngine::new(
        common::orthogonal(),
        common::config(),
        PointEdits::from_list(&list),
    )
    .unwrap();
    assert_ne!(edited.fingerprint(), engine.fingerprint());

    assert!(matches!(
        AnalysisStore::open_matching(dir.path(), edited.fingerprint()),
        Err(StoreError::Stale { .. })
    ));

    let moved = edited.run_basic().unwrap();
    assert!(moved.stats.source_extent.max_x >= engine.run_basic().unwrap().stats.source_extent.max_x);
}

#[test]
fn test_full_mode_without_store_dir() {
    let mut request = RunRequest::basic();
    request.mode = BinningMode::Full;
    assert!(matches!(
        common::engine().run(&request, &RunControl::new(), &NoProgress),
        Err(survey_binning::BinningError::FullModeRequiresStore)
    ));
}

#[test]
fn test_sphere_reflector_records_reflection_points() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::config();
    config.reflector = Some(Reflector::Sphere {
        center: Point3::new(700.0, 600.0, -3000.0),
        radius: 1500.0,
        velocity: 2500.0,
        angles: Range::new(0.0, 45.0),
    });
    let engine = BinningEngine::new(common::orthogonal(), config, PointEdits::new()).unwrap();
    let result = run_full(&engine, dir.path());

    let records = common::store_records(dir.path());
    assert_eq!(records.len() as u64, result.stats.traces_accepted);
    assert!(!records.is_empty());
    let grid = result.aggregates.grid();
    for record in &records {
        // Both legs reach at least the top of the sphere, 1500 m down.
        assert!(record.twt_ms >= 1199.9, "twt {}", record.twt_ms);
        assert_eq!(grid.address(record.cmp.x, record.cmp.y), Some(record.bin));
    }
    let moved = records
        .iter()
        .filter(|r| r.cmp.distance(&r.src.midpoint(&r.rec)) > 1.0)
        .count();
    assert!(moved > 0);
}

#[test]
fn test_bucket_unique_fold_counts_classes() {
    let mut config = common::config();
    config.unique_fold = UniqueFold::Buckets {
        delta_offset: 100.0,
        delta_azimuth: 90.0,
    };
    let engine = BinningEngine::new(common::orthogonal(), config, PointEdits::new()).unwrap();
    let result = engine.run_basic().unwrap();
    let parallel = engine.run_basic_parallel().unwrap();

    for cell in result.aggregates.cells() {
        assert!(cell.unique_fold <= cell.fold);
        // 360 / 90 azimuth classes plus one for zero offset, per offset class
        let offset_classes = (cell.max_offset / 100.0).floor() as u32 + 1;
        assert!(cell.unique_fold <= offset_classes * 5);
    }
    assert_eq!(result.aggregates.to_bytes(), parallel.aggregates.to_bytes());
}
