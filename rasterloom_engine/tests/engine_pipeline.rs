//! End-to-end engine tests: a cached recipe queried through the full actor
//! pipeline, cache adoption, corruption recovery, cancellation, ordering and
//! back-pressure.

use ndarray::Array3;
use rasterloom_core::{BoundaryEffect, ChannelsSchema, Footprint, Interpolation, PixelDtype};
use rasterloom_engine::{
	CacheConfig, DebugManager, Engine, HandlePool, PoolBinding, PoolKind, RasterSpec, TileGrid, cache,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

const NODATA: f64 = -99.0;

fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn raster_fp() -> Footprint {
	Footprint::new((0.0, 100.0), (1.0, -1.0), (100, 100)).unwrap()
}

/// value = spatial x + spatial y at the pixel center.
fn expected_value(fp: &Footprint, j: usize, i: usize) -> f64 {
	let (x, y) = fp.raster_to_spatial((i as f64 + 0.5, j as f64 + 0.5));
	x + y
}

fn ramp_compute(counter: Arc<AtomicUsize>, delay: Option<Duration>) -> Arc<rasterloom_engine::ComputeFn> {
	Arc::new(move |fp: &Footprint, _inputs: &rasterloom_engine::PrimitiveInputs| {
		counter.fetch_add(1, Ordering::SeqCst);
		if let Some(delay) = delay {
			std::thread::sleep(delay);
		}
		let (rows, cols) = fp.shape();
		Ok(Array3::from_shape_fn((rows, cols, 1), |(j, i, _)| {
			expected_value(fp, j, i)
		}))
	})
}

fn inline_pools() -> [PoolBinding; 4] {
	[0u64, 1, 2, 3].map(|key| PoolBinding {
		key,
		name: format!("inline{key}"),
		kind: PoolKind::Inline,
	})
}

fn rayon_pools(threads: usize) -> [PoolBinding; 4] {
	let pool = Arc::new(
		rayon::ThreadPoolBuilder::new()
			.num_threads(threads)
			.build()
			.unwrap(),
	);
	[10u64, 11, 12, 13].map(|key| PoolBinding {
		key,
		name: format!("rayon{key}"),
		kind: PoolKind::Rayon(pool.clone()),
	})
}

fn cached_spec(
	dir: &Path,
	compute: Arc<rasterloom_engine::ComputeFn>,
	pools: [PoolBinding; 4],
) -> Arc<RasterSpec> {
	let fp = raster_fp();
	let tiles = TileGrid::new(fp.tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap()).unwrap();
	let [computation_pool, merge_pool, resample_pool, io_pool] = pools;
	Arc::new(RasterSpec {
		uid: Uuid::new_v4(),
		fp,
		dtype: PixelDtype::F64,
		channel_count: 1,
		schema: ChannelsSchema::with_nodata(1, NODATA),
		wkt: None,
		compute,
		merge: None,
		primitives: vec![],
		computation_tiles: tiles.clone(),
		cache: Some(CacheConfig {
			dir: dir.to_path_buf(),
			tiles,
			io_pool,
		}),
		computation_pool,
		merge_pool,
		resample_pool,
		max_resampling_size: None,
		automatic_remapping: true,
		allow_interpolation: true,
		debug: DebugManager::default(),
	})
}

fn cache_files(dir: &Path) -> Vec<std::path::PathBuf> {
	let mut files: Vec<_> = std::fs::read_dir(dir)
		.unwrap()
		.map(|e| e.unwrap().path())
		.filter(|p| {
			p.file_name()
				.and_then(|n| n.to_str())
				.is_some_and(|n| cache::parse_tile_file_name(n).is_some())
		})
		.collect();
	files.sort();
	files
}

#[test]
fn cache_miss_populates_then_hit_skips_compute() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let counter = Arc::new(AtomicUsize::new(0));
	let spec = cached_spec(dir.path(), ramp_compute(counter.clone(), None), inline_pools());
	let uid = spec.uid;
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec).unwrap();

	let fp = raster_fp();
	let mut rx = engine
		.queue_data(uid, vec![fp.clone()], vec![0], None, Interpolation::Area, 5)
		.unwrap();
	let first = rx.recv().unwrap();
	assert_eq!(first.dim(), (100, 100, 1));
	for (j, i) in [(0, 0), (13, 57), (99, 99)] {
		assert_eq!(first[(j, i, 0)], expected_value(&fp, j, i));
	}
	// 5x5 tile grid: 25 computes, 25 files, checksums embedded in the names
	assert_eq!(counter.load(Ordering::SeqCst), 25);
	let files = cache_files(dir.path());
	assert_eq!(files.len(), 25);
	for file in &files {
		let name = file.file_name().unwrap().to_str().unwrap();
		let (_, hex) = cache::parse_tile_file_name(name).unwrap();
		assert_eq!(cache::checksum_file(file).unwrap(), hex);
	}

	// second identical query: pure cache hits, bit-identical output
	let mut rx = engine
		.queue_data(uid, vec![fp], vec![0], None, Interpolation::Area, 5)
		.unwrap();
	let second = rx.recv().unwrap();
	assert_eq!(second, first);
	assert_eq!(counter.load(Ordering::SeqCst), 25, "no recompute on a warm cache");

	engine.stop().unwrap();
}

#[test]
fn adopted_cache_survives_reopen_without_recompute() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let counter = Arc::new(AtomicUsize::new(0));
	let fp = raster_fp();

	// first session populates
	{
		let spec = cached_spec(dir.path(), ramp_compute(counter.clone(), None), inline_pools());
		let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
		engine.new_raster(spec.clone()).unwrap();
		let mut rx = engine
			.queue_data(spec.uid, vec![fp.clone()], vec![0], None, Interpolation::Area, 5)
			.unwrap();
		rx.recv().unwrap();
		engine.stop().unwrap();
	}
	assert_eq!(counter.load(Ordering::SeqCst), 25);

	// second session adopts the files (fresh uid, same dir)
	let spec = cached_spec(dir.path(), ramp_compute(counter.clone(), None), inline_pools());
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();
	let mut rx = engine
		.queue_data(spec.uid, vec![fp.clone()], vec![0], None, Interpolation::Area, 5)
		.unwrap();
	let arr = rx.recv().unwrap();
	assert_eq!(arr[(50, 50, 0)], expected_value(&fp, 50, 50));
	assert_eq!(counter.load(Ordering::SeqCst), 25, "adoption validates, does not recompute");
	engine.stop().unwrap();
}

#[test]
fn corrupted_cache_file_is_recomputed_transparently() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let counter = Arc::new(AtomicUsize::new(0));
	let fp = raster_fp();
	{
		let spec = cached_spec(dir.path(), ramp_compute(counter.clone(), None), inline_pools());
		let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
		engine.new_raster(spec.clone()).unwrap();
		let mut rx = engine
			.queue_data(spec.uid, vec![fp.clone()], vec![0], None, Interpolation::Area, 5)
			.unwrap();
		rx.recv().unwrap();
		engine.stop().unwrap();
	}

	// flip one file: append a byte
	let files = cache_files(dir.path());
	let victim = &files[7];
	let victim_name = victim.file_name().unwrap().to_str().unwrap().to_string();
	let mut bytes = std::fs::read(victim).unwrap();
	bytes.push(0x42);
	std::fs::write(victim, bytes).unwrap();

	// reopen: the bad tile is detected, deleted and recomputed
	let spec = cached_spec(dir.path(), ramp_compute(counter.clone(), None), inline_pools());
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();
	let mut rx = engine
		.queue_data(spec.uid, vec![fp.clone()], vec![0], None, Interpolation::Area, 5)
		.unwrap();
	let arr = rx.recv().unwrap();
	for (j, i) in [(0, 0), (47, 33), (99, 99)] {
		assert_eq!(arr[(j, i, 0)], expected_value(&fp, j, i));
	}
	assert_eq!(counter.load(Ordering::SeqCst), 26, "exactly the bad tile recomputed");

	// still 25 files; the replacement's name matches its new content
	let files = cache_files(dir.path());
	assert_eq!(files.len(), 25);
	let replacement = files
		.iter()
		.find(|f| {
			let name = f.file_name().unwrap().to_str().unwrap();
			let key_of = |n: &str| cache::parse_tile_file_name(n).unwrap().0;
			key_of(name) == key_of(&victim_name)
		})
		.expect("the tile has a file again");
	let (_, hex) = cache::parse_tile_file_name(replacement.file_name().unwrap().to_str().unwrap()).unwrap();
	assert_eq!(cache::checksum_file(replacement).unwrap(), hex);
	engine.stop().unwrap();
}

#[test]
fn results_arrive_in_input_order_with_nodata_padding() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let spec = cached_spec(
		dir.path(),
		ramp_compute(Arc::new(AtomicUsize::new(0)), None),
		inline_pools(),
	);
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();

	let outside = Footprint::new((5000.0, 5000.0), (1.0, -1.0), (8, 8)).unwrap();
	let inside = Footprint::new((30.0, 70.0), (1.0, -1.0), (10, 10)).unwrap();
	let straddling = Footprint::new((95.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
	let mut rx = engine
		.queue_data(
			spec.uid,
			vec![outside.clone(), inside.clone(), straddling.clone()],
			vec![0],
			None,
			Interpolation::Area,
			5,
		)
		.unwrap();

	let a = rx.recv().unwrap();
	assert!(a.iter().all(|&v| v == NODATA), "fully outside: all nodata");

	let b = rx.recv().unwrap();
	assert_eq!(b[(0, 0, 0)], expected_value(&inside, 0, 0));
	assert_eq!(b[(9, 9, 0)], expected_value(&inside, 9, 9));

	let c = rx.recv().unwrap();
	// x in [95, 105): half in, half out
	assert_eq!(c[(0, 0, 0)], expected_value(&straddling, 0, 0));
	assert_eq!(c[(0, 7, 0)], NODATA);
	engine.stop().unwrap();
}

#[test]
fn resampled_query_interpolates_between_pixels() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let spec = cached_spec(
		dir.path(),
		ramp_compute(Arc::new(AtomicUsize::new(0)), None),
		inline_pools(),
	);
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();

	// half-pixel shift: bilinear over the x+y ramp stays the exact ramp
	let query = Footprint::new((40.5, 60.5), (1.0, -1.0), (10, 10)).unwrap();
	let mut rx = engine
		.queue_data(spec.uid, vec![query.clone()], vec![0], None, Interpolation::Linear, 5)
		.unwrap();
	let arr = rx.recv().unwrap();
	for j in 0..10 {
		for i in 0..10 {
			let expected = expected_value(&query, j, i);
			assert!(
				(arr[(j, i, 0)] - expected).abs() < 1e-9,
				"({j}, {i}): {} vs {expected}",
				arr[(j, i, 0)]
			);
		}
	}
	engine.stop().unwrap();
}

#[test]
fn output_queue_never_exceeds_its_bound() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let spec = cached_spec(
		dir.path(),
		ramp_compute(Arc::new(AtomicUsize::new(0)), Some(Duration::from_millis(5))),
		rayon_pools(2),
	);
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();

	let tile_queries: Vec<Footprint> = (0..5)
		.map(|k| Footprint::new((20.0 * k as f64, 100.0), (1.0, -1.0), (20, 20)).unwrap())
		.collect();
	let mut rx = engine
		.queue_data(spec.uid, tile_queries, vec![0], None, Interpolation::Area, 1)
		.unwrap();
	for _ in 0..5 {
		assert!(rx.ready() <= 1, "bounded queue overflowed");
		let arr = rx.recv().unwrap();
		assert_eq!(arr.dim(), (20, 20, 1));
		// consume slowly so production would overrun a broken bound
		std::thread::sleep(Duration::from_millis(20));
		assert!(rx.ready() <= 1, "bounded queue overflowed");
	}
	engine.stop().unwrap();
}

#[test]
fn dropping_the_receiver_cancels_remaining_computes() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let counter = Arc::new(AtomicUsize::new(0));
	let spec = cached_spec(
		dir.path(),
		ramp_compute(counter.clone(), Some(Duration::from_millis(30))),
		rayon_pools(1),
	);
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();

	let fp = raster_fp();
	let rx = engine
		.queue_data(spec.uid, vec![fp], vec![0], None, Interpolation::Area, 1)
		.unwrap();
	// let a couple of computes start, then walk away
	std::thread::sleep(Duration::from_millis(80));
	drop(rx);
	std::thread::sleep(Duration::from_millis(200));
	let after_cancel = counter.load(Ordering::SeqCst);
	assert!(after_cancel < 25, "cancellation stopped the compute wave");
	// no further computes start once the cancellation settled
	std::thread::sleep(Duration::from_millis(150));
	assert_eq!(counter.load(Ordering::SeqCst), after_cancel);
	engine.stop().unwrap();
}

#[test]
fn compute_failure_poisons_the_query() {
	init_logging();
	let dir = tempfile::tempdir().unwrap();
	let compute: Arc<rasterloom_engine::ComputeFn> =
		Arc::new(|_, _| anyhow::bail!("sensor fell off"));
	let spec = cached_spec(dir.path(), compute, inline_pools());
	let engine = Engine::start(HandlePool::new(4).unwrap(), DebugManager::default());
	engine.new_raster(spec.clone()).unwrap();

	let fp = raster_fp();
	let mut rx = engine
		.queue_data(spec.uid, vec![fp], vec![0], None, Interpolation::Area, 5)
		.unwrap();
	let err = rx.recv().unwrap_err();
	let kind = rasterloom_core::errors::Error::of(&err).unwrap();
	assert!(
		matches!(kind, rasterloom_core::errors::Error::ComputeFailed(_)),
		"{kind:?}"
	);
	// the engine is dead now; new queries fail fast
	assert!(!engine.is_alive());
	assert!(
		engine
			.queue_data(spec.uid, vec![raster_fp()], vec![0], None, Interpolation::Area, 5)
			.is_err()
	);
	engine.stop().unwrap();
}
