//! The scheduled-raster record: everything the actors need to know about one
//! raster, immutable once registered.
//!
//! One record carries the data and the optional [`CacheConfig`] makes
//! the difference between a plain recipe and a cached one.

use crate::observers::DebugManager;
use crate::query::QueueReceiver;
use anyhow::{Result, ensure};
use ndarray::Array3;
use rasterloom_core::errors::Error;
use rasterloom_core::{ChannelsSchema, Footprint, PixelDtype};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Position of one tile in a [`TileGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord2 {
	pub y: u32,
	pub x: u32,
}

impl fmt::Display for TileCoord2 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "({}, {})", self.x, self.y)
	}
}

/// A rectangular matrix of footprints (cache tiles or computation tiles).
#[derive(Debug, Clone)]
pub struct TileGrid {
	rows: Vec<Vec<Footprint>>,
}

impl TileGrid {
	pub fn new(rows: Vec<Vec<Footprint>>) -> Result<TileGrid> {
		ensure!(
			!rows.is_empty() && !rows[0].is_empty(),
			Error::InvalidParameter("tile grid is empty".to_string())
		);
		let width = rows[0].len();
		ensure!(
			rows.iter().all(|r| r.len() == width),
			Error::InvalidParameter("tile grid rows have uneven lengths".to_string())
		);
		Ok(TileGrid { rows })
	}

	pub fn get(&self, coord: TileCoord2) -> &Footprint {
		&self.rows[coord.y as usize][coord.x as usize]
	}

	pub fn tile_count(&self) -> usize {
		self.rows.len() * self.rows[0].len()
	}

	pub fn coords(&self) -> impl Iterator<Item = TileCoord2> + '_ {
		let width = self.rows[0].len();
		(0..self.rows.len()).flat_map(move |y| {
			(0..width).map(move |x| TileCoord2 {
				y: y as u32,
				x: x as u32,
			})
		})
	}

	/// Coordinates of the tiles sharing area with `fp`, in row-major order.
	pub fn coords_overlapping(&self, fp: &Footprint) -> Result<Vec<TileCoord2>> {
		let mut overlapping = Vec::new();
		for coord in self.coords() {
			if self.get(coord).share_area(fp)? {
				overlapping.push(coord);
			}
		}
		Ok(overlapping)
	}

	/// Check that the grid exactly partitions `fp` (cache tiles must).
	pub fn validate_partition_of(&self, fp: &Footprint) -> Result<()> {
		let total: usize = self.rows.iter().flatten().map(|t| t.rarea()).sum();
		ensure!(
			total == fp.rarea(),
			Error::InvalidParameter(format!(
				"tile grid covers {total} pixels, footprint has {}",
				fp.rarea()
			))
		);
		for row in &self.rows {
			for tile in row {
				ensure!(
					tile.same_grid(fp)?,
					Error::InvalidParameter(format!("tile {tile} does not lie on the raster grid"))
				);
				tile.slice_in(fp, false)?;
			}
		}
		Ok(())
	}

	/// Check that the grid covers `fp` (computation tiles must; overlap is
	/// allowed).
	pub fn validate_cover_of(&self, fp: &Footprint) -> Result<()> {
		for row in &self.rows {
			for tile in row {
				ensure!(
					tile.same_grid(fp)?,
					Error::InvalidParameter(format!("tile {tile} does not lie on the raster grid"))
				);
			}
		}
		let covered: usize = self
			.rows
			.iter()
			.flatten()
			.filter_map(|t| t.intersection(fp).ok().map(|i| i.rarea()))
			.sum();
		ensure!(
			covered >= fp.rarea(),
			Error::InvalidParameter("computation tiles do not cover the raster".to_string())
		);
		Ok(())
	}
}

/// A worker pool as the engine sees it.
#[derive(Clone)]
pub enum PoolKind {
	/// Run the task directly on the scheduler thread. For trivial work only.
	Inline,
	Rayon(Arc<rayon::ThreadPool>),
}

impl PoolKind {
	pub fn slots(&self) -> usize {
		match self {
			PoolKind::Inline => 1,
			PoolKind::Rayon(pool) => pool.current_num_threads().max(1),
		}
	}
}

impl fmt::Debug for PoolKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			PoolKind::Inline => write!(f, "Inline"),
			PoolKind::Rayon(pool) => write!(f, "Rayon({} threads)", pool.current_num_threads()),
		}
	}
}

/// A pool reference shared by rasters: a stable key plus the pool itself.
#[derive(Debug, Clone)]
pub struct PoolBinding {
	pub key: u64,
	pub name: String,
	pub kind: PoolKind,
}

/// The primitive arrays handed to a recipe's compute function, keyed by the
/// primitive names of the recipe.
#[derive(Debug, Default, Clone)]
pub struct PrimitiveInputs {
	pub fps: HashMap<String, Footprint>,
	pub arrays: HashMap<String, Array3<f64>>,
}

/// User compute callback: produce the pixels of one computation tile.
pub type ComputeFn = dyn Fn(&Footprint, &PrimitiveInputs) -> Result<Array3<f64>> + Send + Sync;

/// User merge callback: combine computed pieces into one cache tile.
pub type MergeFn = dyn Fn(&Footprint, &[(Footprint, Array3<f64>)]) -> Result<Array3<f64>> + Send + Sync;

/// Footprint conversion applied before querying a primitive.
pub type ConvertFpFn = dyn Fn(&Footprint) -> Result<Footprint> + Send + Sync;

/// An upstream raster a recipe can pull arrays from.
///
/// Implemented by the facade's raster handles; the curried query parameters
/// (channels, nodata, interpolation) live behind this trait.
pub trait PrimitiveSource: Send + Sync {
	/// UID of the upstream raster (cycle detection).
	fn uid(&self) -> Uuid;

	/// Queue footprints on the upstream raster, with a bounded output queue.
	fn queue(&self, fps: Vec<Footprint>, max_queue_size: usize) -> Result<QueueReceiver>;
}

/// One named primitive of a recipe.
#[derive(Clone)]
pub struct PrimitiveBinding {
	pub name: String,
	pub source: Arc<dyn PrimitiveSource>,
	pub convert_fp: Arc<ConvertFpFn>,
}

impl fmt::Debug for PrimitiveBinding {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PrimitiveBinding").field("name", &self.name).finish()
	}
}

/// Cache-side configuration of a cached recipe.
#[derive(Debug, Clone)]
pub struct CacheConfig {
	pub dir: PathBuf,
	pub tiles: TileGrid,
	pub io_pool: PoolBinding,
}

/// Immutable description of one scheduled raster.
pub struct RasterSpec {
	pub uid: Uuid,
	pub fp: Footprint,
	pub dtype: PixelDtype,
	pub channel_count: usize,
	pub schema: ChannelsSchema,
	pub wkt: Option<String>,
	pub compute: Arc<ComputeFn>,
	pub merge: Option<Arc<MergeFn>>,
	pub primitives: Vec<PrimitiveBinding>,
	pub computation_tiles: TileGrid,
	pub cache: Option<CacheConfig>,
	pub computation_pool: PoolBinding,
	pub merge_pool: PoolBinding,
	pub resample_pool: PoolBinding,
	pub max_resampling_size: Option<usize>,
	/// When false, queries must lie on the raster's grid and each production
	/// is computed directly at its sampling footprint.
	pub automatic_remapping: bool,
	/// Dataset-wide interpolation permission.
	pub allow_interpolation: bool,
	pub debug: DebugManager,
}

impl RasterSpec {
	/// The raster-level nodata sentinel.
	pub fn nodata(&self) -> Option<f64> {
		self.schema.shared_nodata()
	}

	pub fn validate(&self) -> Result<()> {
		ensure!(
			self.channel_count > 0,
			Error::Config("channel count should be > 0".to_string())
		);
		self.schema.validate(self.channel_count)?;
		self.computation_tiles.validate_cover_of(&self.fp)?;
		if let Some(cache) = &self.cache {
			cache.tiles.validate_partition_of(&self.fp)?;
		}
		for binding in &self.primitives {
			ensure!(
				binding.source.uid() != self.uid,
				Error::Config(format!("recipe depends on itself through primitive '{}'", binding.name))
			);
		}
		Ok(())
	}
}

impl fmt::Debug for RasterSpec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RasterSpec")
			.field("uid", &self.uid)
			.field("fp", &self.fp)
			.field("dtype", &self.dtype)
			.field("channel_count", &self.channel_count)
			.field("cached", &self.cache.is_some())
			.field("primitives", &self.primitives.len())
			.finish()
	}
}

/// Default merge: paste each computed piece into the destination.
pub fn default_merge(fp: &Footprint, pieces: &[(Footprint, Array3<f64>)], fill: f64) -> Result<Array3<f64>> {
	let channels = pieces.first().map_or(0, |(_, a)| a.dim().2);
	let (rows, cols) = fp.shape();
	let mut out = Array3::from_elem((rows, cols, channels), fill);
	for (piece_fp, piece) in pieces {
		let into = piece_fp.slice_in(fp, true)?;
		let from = fp.slice_in(piece_fp, true)?;
		if !into.is_empty() {
			out
				.slice_mut(ndarray::s![into.y, into.x, ..])
				.assign(&piece.slice(ndarray::s![from.y, from.x, ..]));
		}
	}
	Ok(out)
}
