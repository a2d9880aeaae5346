//! The [`Dataset`]: owner of rasters, the scheduler thread and the worker
//! pools.

mod pools;

pub use pools::PoolRef;

use crate::raster::{OpenOptions, Raster, RasterMode};
use crate::recipe::{CachedRecipeParams, RecipeParams};
use crate::sr::{IdentityProvider, SpatialReferenceProvider, SrConfig};
use anyhow::{Context, Result};
use ndarray::Array3;
use parking_lot::Mutex;
use rasterloom_core::errors::Error;
use rasterloom_core::{ChannelsSchema, Footprint, PixelDtype};
use rasterloom_engine::driver::RasterMeta;
use rasterloom_engine::{DebugManager, DebugObserver, Driver, Engine, GridDriver, HandlePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Construction options of a [`Dataset`]. All optional.
#[derive(Clone)]
pub struct DatasetConfig {
	/// Spatial reference of the working coordinates (modes 2-4).
	pub sr_work: Option<String>,
	/// Used for sources that lack a stored SR (mode 3).
	pub sr_fallback: Option<String>,
	/// Overrides every source's stored SR (mode 4).
	pub sr_forced: Option<String>,
	/// Validate that SR conversions keep footprints orthogonal.
	pub analyse_transformation: bool,
	/// Accept sources without a stored SR when a work SR is set.
	pub allow_none_geometry: bool,
	/// Permit resampling between unaligned grids.
	pub allow_interpolation: bool,
	/// Budget of simultaneously open driver handles, shared Dataset-wide.
	pub max_active: usize,
	pub debug_observers: Vec<Arc<dyn DebugObserver>>,
	/// Coordinate conversion backend; identity-only when unset.
	pub sr_provider: Option<Arc<dyn SpatialReferenceProvider>>,
}

impl Default for DatasetConfig {
	fn default() -> Self {
		DatasetConfig {
			sr_work: None,
			sr_fallback: None,
			sr_forced: None,
			analyse_transformation: true,
			allow_none_geometry: true,
			allow_interpolation: true,
			max_active: 64,
			debug_observers: Vec::new(),
			sr_provider: None,
		}
	}
}

pub(crate) struct DatasetInner {
	pub engine: Engine,
	pub handle_pool: Arc<HandlePool>,
	pub pools: pools::PoolsContainer,
	pub sr: SrConfig,
	pub allow_interpolation: bool,
	pub debug: DebugManager,
	registry: Mutex<HashMap<String, Raster>>,
	closed: AtomicBool,
}

/// Owner of rasters, scheduler thread and pools; the lifecycle boundary.
///
/// Cheap to clone (shared handle). [`Dataset::close`] stops the scheduler
/// after draining pending cache writes; it is called on the drop of the last
/// handle as well.
#[derive(Clone)]
pub struct Dataset {
	inner: Arc<DatasetInner>,
}

impl Dataset {
	pub fn new(config: DatasetConfig) -> Result<Dataset> {
		let sr = SrConfig {
			work: config.sr_work,
			fallback: config.sr_fallback,
			forced: config.sr_forced,
			analyse_transformation: config.analyse_transformation,
			allow_none_geometry: config.allow_none_geometry,
			provider: config.sr_provider.unwrap_or_else(|| Arc::new(IdentityProvider)),
		};
		sr.validate()?;
		let handle_pool = HandlePool::new(config.max_active)?;
		let debug = DebugManager::new(config.debug_observers);
		let engine = Engine::start(handle_pool.clone(), debug.clone());
		debug.object_allocated("dataset");
		Ok(Dataset {
			inner: Arc::new(DatasetInner {
				engine,
				handle_pool,
				pools: pools::PoolsContainer::new(),
				sr,
				allow_interpolation: config.allow_interpolation,
				debug,
				registry: Mutex::new(HashMap::new()),
				closed: AtomicBool::new(false),
			}),
		})
	}

	pub(crate) fn inner(&self) -> &Arc<DatasetInner> {
		&self.inner
	}

	fn ensure_open(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::Acquire) {
			return Err(Error::SchedulerDead("the dataset is closed".to_string()).into());
		}
		Ok(())
	}

	fn register(&self, key: Option<&str>, raster: Raster) -> Result<Raster> {
		if let Some(key) = key {
			let mut registry = self.inner.registry.lock();
			if registry.contains_key(key) {
				return Err(Error::InvalidParameter(format!("a raster is already registered under '{key}'")).into());
			}
			registry.insert(key.to_string(), raster.clone());
		}
		Ok(raster)
	}

	/// The raster registered under `key`, if any.
	pub fn get(&self, key: &str) -> Option<Raster> {
		self.inner.registry.lock().get(key).cloned()
	}

	/// Open a file-backed raster.
	pub fn open_raster(&self, key: Option<&str>, path: impl AsRef<Path>, options: OpenOptions) -> Result<Raster> {
		self.ensure_open()?;
		let raster = Raster::open(self, path.as_ref(), options)?;
		self.register(key, raster)
	}

	/// Create a file-backed raster and open it in write mode.
	#[allow(clippy::too_many_arguments)]
	pub fn create_raster(
		&self,
		key: Option<&str>,
		path: impl AsRef<Path>,
		fp: Footprint,
		dtype: PixelDtype,
		channel_count: usize,
		schema: Option<ChannelsSchema>,
		options: OpenOptions,
		ow: bool,
	) -> Result<Raster> {
		self.ensure_open()?;
		let path = path.as_ref();
		let driver: Arc<dyn Driver> = options.driver.clone().unwrap_or_else(|| Arc::new(GridDriver));
		let schema = schema.unwrap_or_else(|| ChannelsSchema::default_for(channel_count));
		schema.validate(channel_count)?;
		if path.exists() {
			if !ow {
				return Err(Error::Config(format!("'{}' already exists (pass ow to overwrite)", path.display())).into());
			}
			std::fs::remove_file(path).with_context(|| format!("overwriting '{}'", path.display()))?;
		}
		let meta = RasterMeta {
			fp,
			dtype,
			channel_count,
			schema,
			wkt: options.sr.clone(),
		};
		driver.create(path, &meta)?;
		let raster = Raster::open(
			self,
			path,
			OpenOptions {
				mode: RasterMode::Write,
				..options
			},
		)?;
		self.register(key, raster)
	}

	/// Wrap a caller-provided array as a raster.
	pub fn wrap_array(
		&self,
		key: Option<&str>,
		fp: Footprint,
		array: Array3<f64>,
		schema: Option<ChannelsSchema>,
		sr: Option<String>,
		mode: RasterMode,
	) -> Result<Raster> {
		self.ensure_open()?;
		let raster = Raster::wrap_array(self, fp, array, schema, sr, mode)?;
		self.register(key, raster)
	}

	/// Register an on-demand computed raster.
	pub fn create_raster_recipe(&self, key: Option<&str>, params: RecipeParams) -> Result<Raster> {
		self.ensure_open()?;
		let raster = crate::recipe::build_recipe(self, params, None)?;
		self.register(key, raster)
	}

	/// Register an on-demand computed raster backed by a tile file cache.
	pub fn create_cached_raster_recipe(&self, key: Option<&str>, params: CachedRecipeParams) -> Result<Raster> {
		self.ensure_open()?;
		let raster = crate::recipe::build_recipe(self, params.base, Some(params.cache))?;
		self.register(key, raster)
	}

	/// Stop the scheduler (two-phase: refuse queries, drain cache writes,
	/// kill rasters) and release the pools. Idempotent.
	pub fn close(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return Ok(());
		}
		log::debug!("closing dataset");
		self.inner.registry.lock().clear();
		self.inner.engine.stop()
	}
}

impl Drop for DatasetInner {
	fn drop(&mut self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			self.engine.stop().ok();
		}
	}
}

impl std::fmt::Debug for Dataset {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Dataset")
			.field("rasters", &self.inner.registry.lock().len())
			.field("max_active", &self.inner.handle_pool.max_active())
			.field("alive", &self.inner.engine.is_alive())
			.finish()
	}
}
