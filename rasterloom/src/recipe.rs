//! Recipe construction: on-demand computed rasters, optionally backed by a
//! tile file cache, fed by *primitive* rasters.

use crate::dataset::{Dataset, PoolRef};
use crate::raster::{Raster, RasterInner, RasterKind, RasterMode};
use anyhow::{Result, ensure};
use rasterloom_core::errors::Error;
use rasterloom_core::{BoundaryEffect, ChannelsSchema, Footprint, Interpolation, PixelDtype};
use rasterloom_engine::{
	CacheConfig, ComputeFn, ConvertFpFn, DebugManager, DebugObserver, MergeFn, PrimitiveBinding, PrimitiveSource,
	QueueReceiver, RasterSpec, TileGrid,
};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Default edge length of derived computation/cache tiles, in pixels.
const DEFAULT_TILE_SIZE: usize = 512;

/// One named upstream dependency of a recipe, with its curried query
/// parameters.
#[derive(Clone)]
pub struct PrimitiveSpec {
	pub name: String,
	pub raster: Raster,
	pub channels: Option<Vec<usize>>,
	pub dst_nodata: Option<f64>,
	pub interpolation: Interpolation,
	/// Maps a computation tile of the recipe to the footprint queried on the
	/// primitive; identity when unset.
	pub convert_footprint: Option<Arc<ConvertFpFn>>,
}

impl PrimitiveSpec {
	pub fn new(name: &str, raster: Raster) -> PrimitiveSpec {
		PrimitiveSpec {
			name: name.to_string(),
			raster,
			channels: None,
			dst_nodata: None,
			interpolation: Interpolation::Area,
			convert_footprint: None,
		}
	}
}

/// Parameters of [`Dataset::create_raster_recipe`].
pub struct RecipeParams {
	pub fp: Footprint,
	pub dtype: PixelDtype,
	pub channel_count: usize,
	pub schema: Option<ChannelsSchema>,
	pub sr: Option<String>,
	pub compute_array: Arc<ComputeFn>,
	pub merge_arrays: Option<Arc<MergeFn>>,
	pub primitives: Vec<PrimitiveSpec>,
	pub computation_pool: PoolRef,
	pub merge_pool: PoolRef,
	pub resample_pool: PoolRef,
	/// Explicit computation tiling; derived from `max_computation_size`
	/// when unset.
	pub computation_tiles: Option<Vec<Vec<Footprint>>>,
	pub max_computation_size: Option<usize>,
	pub max_resampling_size: Option<usize>,
	/// When false, queries must lie on the recipe's grid and reach the
	/// compute function unchanged.
	pub automatic_remapping: bool,
	pub debug_observers: Vec<Arc<dyn DebugObserver>>,
}

impl RecipeParams {
	pub fn new(fp: Footprint, dtype: PixelDtype, channel_count: usize, compute_array: Arc<ComputeFn>) -> RecipeParams {
		RecipeParams {
			fp,
			dtype,
			channel_count,
			schema: None,
			sr: None,
			compute_array,
			merge_arrays: None,
			primitives: Vec::new(),
			computation_pool: PoolRef::default(),
			merge_pool: PoolRef::default(),
			resample_pool: PoolRef::default(),
			computation_tiles: None,
			max_computation_size: None,
			max_resampling_size: None,
			automatic_remapping: true,
			debug_observers: Vec::new(),
		}
	}
}

/// Cache-side parameters of [`Dataset::create_cached_raster_recipe`].
pub struct CacheParams {
	pub cache_dir: PathBuf,
	/// Clear existing tiles instead of adopting them.
	pub ow: bool,
	/// Explicit cache tiling (must partition the footprint); a default grid
	/// when unset.
	pub cache_tiles: Option<Vec<Vec<Footprint>>>,
	pub io_pool: PoolRef,
}

impl CacheParams {
	pub fn new(cache_dir: impl Into<PathBuf>) -> CacheParams {
		CacheParams {
			cache_dir: cache_dir.into(),
			ow: false,
			cache_tiles: None,
			io_pool: PoolRef::alias("io"),
		}
	}
}

pub struct CachedRecipeParams {
	pub base: RecipeParams,
	pub cache: CacheParams,
}

/// [`PrimitiveSource`] backed by a scheduled raster's `queue_data`.
struct CurriedQueue {
	raster: Raster,
	channels: Option<Vec<usize>>,
	dst_nodata: Option<f64>,
	interpolation: Interpolation,
}

impl PrimitiveSource for CurriedQueue {
	fn uid(&self) -> Uuid {
		self.raster.uid()
	}

	fn queue(&self, fps: Vec<Footprint>, max_queue_size: usize) -> Result<QueueReceiver> {
		self.raster.queue_data(
			fps,
			crate::raster::QueryOptions {
				channels: self.channels.clone(),
				dst_nodata: self.dst_nodata,
				interpolation: self.interpolation,
				max_queue_size,
			},
		)
	}
}

fn tile_grid_for(fp: &Footprint, size: usize) -> Result<TileGrid> {
	let size = size.max(1).min(fp.rsizex().max(fp.rsizey()));
	TileGrid::new(fp.tile((size, size), (0, 0), BoundaryEffect::Shrink)?)
}

/// Assemble and register an engine-side raster spec; shared by plain and
/// cached recipes.
pub(crate) fn build_recipe(ds: &Dataset, params: RecipeParams, cache: Option<CacheParams>) -> Result<Raster> {
	let inner_ds = ds.inner();
	let schema = params
		.schema
		.unwrap_or_else(|| ChannelsSchema::default_for(params.channel_count));
	schema.validate(params.channel_count)?;

	let computation_tiles = match params.computation_tiles {
		Some(rows) => TileGrid::new(rows)?,
		None => tile_grid_for(&params.fp, params.max_computation_size.unwrap_or(DEFAULT_TILE_SIZE))?,
	};

	let cache_config = match cache {
		None => None,
		Some(cache) => {
			let tiles = match cache.cache_tiles {
				Some(rows) => TileGrid::new(rows)?,
				None => tile_grid_for(&params.fp, DEFAULT_TILE_SIZE)?,
			};
			if cache.ow {
				rasterloom_engine::cache::clear_cache_dir(&cache.cache_dir)?;
			} else {
				std::fs::create_dir_all(&cache.cache_dir)?;
			}
			Some(CacheConfig {
				dir: cache.cache_dir,
				tiles,
				io_pool: inner_ds.pools.resolve(&cache.io_pool)?,
			})
		}
	};

	let mut primitives = Vec::with_capacity(params.primitives.len());
	for spec in params.primitives {
		ensure!(
			spec.raster.is_scheduled(),
			Error::InvalidParameter(format!(
				"primitive '{}' is not scheduler-managed; open it with `scheduled` or use a recipe",
				spec.name
			))
		);
		// the construction order makes dependency graphs acyclic; a recipe
		// can only reference rasters that already exist
		let convert_fp: Arc<ConvertFpFn> = spec
			.convert_footprint
			.clone()
			.unwrap_or_else(|| Arc::new(|fp: &Footprint| Ok(fp.clone())));
		primitives.push(PrimitiveBinding {
			name: spec.name.clone(),
			source: Arc::new(CurriedQueue {
				raster: spec.raster,
				channels: spec.channels,
				dst_nodata: spec.dst_nodata,
				interpolation: spec.interpolation,
			}),
			convert_fp,
		});
	}

	let spec = Arc::new(RasterSpec {
		uid: Uuid::new_v4(),
		fp: params.fp.clone(),
		dtype: params.dtype,
		channel_count: params.channel_count,
		schema: schema.clone(),
		wkt: params.sr.clone(),
		compute: params.compute_array,
		merge: params.merge_arrays,
		primitives,
		computation_tiles,
		cache: cache_config,
		computation_pool: inner_ds.pools.resolve(&params.computation_pool)?,
		merge_pool: inner_ds.pools.resolve(&params.merge_pool)?,
		resample_pool: inner_ds.pools.resolve(&params.resample_pool)?,
		max_resampling_size: params.max_resampling_size,
		automatic_remapping: params.automatic_remapping,
		allow_interpolation: inner_ds.allow_interpolation,
		debug: inner_ds.debug.merged_with(&DebugManager::new(params.debug_observers)),
	});
	spec.validate()?;
	inner_ds.engine.new_raster(spec.clone())?;
	inner_ds.debug.object_allocated("raster");

	Ok(Raster {
		inner: Arc::new(RasterInner {
			uid: spec.uid,
			kind: RasterKind::Scheduled,
			fp: params.fp.clone(),
			fp_stored: params.fp,
			dtype: params.dtype,
			channel_count: params.channel_count,
			schema,
			wkt_stored: params.sr,
			mode: RasterMode::Read,
			allow_interpolation: inner_ds.allow_interpolation,
			handle_pool: inner_ds.handle_pool.clone(),
			engine: inner_ds.engine.clone(),
		}),
	})
}

/// Wrap an opened stored raster into a scheduler-managed one: an uncached
/// recipe whose compute reads the file through the driver-handle pool on the
/// io pool.
pub(crate) fn schedule_stored_raster(ds: &Dataset, stored: &Raster) -> Result<Raster> {
	let RasterKind::Stored { path, driver } = &stored.inner.kind else {
		return Err(Error::InvalidParameter("only stored rasters can be re-scheduled".to_string()).into());
	};
	let path = path.clone();
	let driver = driver.clone();
	let handle_pool = stored.inner.handle_pool.clone();
	let pool_uid = stored.inner.uid;
	let work_fp = stored.inner.fp.clone();
	let channel_count = stored.inner.channel_count;
	let all_channels: Vec<usize> = (0..channel_count).collect();

	let compute: Arc<ComputeFn> = Arc::new(move |fp, _inputs| {
		let window = fp.slice_in(&work_fp, false)?;
		let path = path.clone();
		let driver = driver.clone();
		let mut lease = handle_pool.acquire(pool_uid, &move || driver.open(&path, false))?;
		lease.get().read_window(&window, &all_channels)
	});

	let mut params = RecipeParams::new(stored.inner.fp.clone(), stored.inner.dtype, channel_count, compute);
	params.schema = Some(stored.inner.schema.clone());
	params.sr = stored.inner.wkt_stored.clone();
	// file reads are io-bound work
	params.computation_pool = PoolRef::alias("io");
	build_recipe(ds, params, None)
}
