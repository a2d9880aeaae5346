//! The raster handle: one record, four flavors.
//!
//! A [`Raster`] is one record whose [`RasterKind`] tag distinguishes
//! file-backed sources, wrapped arrays and scheduler-managed recipes. The
//! read contract is shared: [`Raster::get_data`] everywhere, plus
//! [`Raster::queue_data`]/[`Raster::iter_data`] on scheduled rasters.

use crate::dataset::Dataset;
use anyhow::{Context, Result, ensure};
use ndarray::{Array3, s};
use parking_lot::RwLock;
use rasterloom_core::errors::Error;
use rasterloom_core::{ChannelsSchema, Footprint, Interpolation, PixelDtype};
use rasterloom_engine::{Driver, Engine, GridDriver, HandlePool, QueueReceiver};
use rasterloom_remap::{RemapParams, build_sampling_footprint, remap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Ownership mode of a stored raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RasterMode {
	#[default]
	Read,
	Write,
}

/// Options of [`Dataset::open_raster`] / [`Dataset::create_raster`].
#[derive(Clone, Default)]
pub struct OpenOptions {
	/// File format; the built-in grid driver when unset.
	pub driver: Option<Arc<dyn Driver>>,
	pub mode: RasterMode,
	/// Manage the raster through the scheduler, enabling `queue_data` and
	/// use as a recipe primitive.
	pub scheduled: bool,
	/// Stored spatial reference (creation time).
	pub sr: Option<String>,
}

/// Per-query options shared by `get_data`, `queue_data` and `iter_data`.
#[derive(Debug, Clone)]
pub struct QueryOptions {
	/// Channels to read; all of them when unset.
	pub channels: Option<Vec<usize>>,
	/// Fill value for pixels without data; the raster's nodata (or 0) when
	/// unset.
	pub dst_nodata: Option<f64>,
	pub interpolation: Interpolation,
	/// Bound of the output queue (`queue_data`/`iter_data`).
	pub max_queue_size: usize,
}

impl Default for QueryOptions {
	fn default() -> Self {
		QueryOptions {
			channels: None,
			dst_nodata: None,
			interpolation: Interpolation::Area,
			max_queue_size: 5,
		}
	}
}

pub(crate) enum RasterKind {
	/// A file on disk, read through pooled driver handles.
	Stored { path: PathBuf, driver: Arc<dyn Driver> },
	/// A caller-provided in-memory array.
	InMem { array: Arc<RwLock<Array3<f64>>> },
	/// A recipe (cached or not) living behind the scheduler.
	Scheduled,
}

pub(crate) struct RasterInner {
	pub uid: Uuid,
	pub kind: RasterKind,
	/// Working footprint (after SR conversion).
	pub fp: Footprint,
	pub fp_stored: Footprint,
	pub dtype: PixelDtype,
	pub channel_count: usize,
	pub schema: ChannelsSchema,
	pub wkt_stored: Option<String>,
	pub mode: RasterMode,
	pub allow_interpolation: bool,
	pub handle_pool: Arc<HandlePool>,
	pub engine: Engine,
}

/// A raster registered on a [`Dataset`]. Cheap to clone.
#[derive(Clone)]
pub struct Raster {
	pub(crate) inner: Arc<RasterInner>,
}

impl Raster {
	pub(crate) fn open(ds: &Dataset, path: &Path, options: OpenOptions) -> Result<Raster> {
		let driver: Arc<dyn Driver> = options.driver.clone().unwrap_or_else(|| Arc::new(GridDriver));
		let uid = Uuid::new_v4();
		let inner_ds = ds.inner();
		let writable = options.mode == RasterMode::Write;

		// fetch the metadata through the pool so the handle is kept warm
		let meta = {
			let path = path.to_path_buf();
			let path_for_err = path.clone();
			let driver = driver.clone();
			let mut lease = inner_ds
				.handle_pool
				.acquire(uid, &move || driver.open(&path, writable))
				.with_context(|| format!("opening raster '{}'", path_for_err.display()))?;
			lease.get().meta().clone()
		};
		let fp = inner_ds.sr.to_work(&meta.fp, meta.wkt.as_deref())?;
		log::debug!(
			"opened '{}': {} channels of {} over {fp}",
			path.display(),
			meta.channel_count,
			meta.dtype,
		);

		let raster = Raster {
			inner: Arc::new(RasterInner {
				uid,
				kind: RasterKind::Stored {
					path: path.to_path_buf(),
					driver,
				},
				fp,
				fp_stored: meta.fp,
				dtype: meta.dtype,
				channel_count: meta.channel_count,
				schema: meta.schema,
				wkt_stored: meta.wkt,
				mode: options.mode,
				allow_interpolation: inner_ds.allow_interpolation,
				handle_pool: inner_ds.handle_pool.clone(),
				engine: inner_ds.engine.clone(),
			}),
		};
		inner_ds.debug.object_allocated("raster");
		if options.scheduled {
			ensure!(
				options.mode == RasterMode::Read,
				Error::InvalidParameter("scheduler-managed rasters are read-only".to_string())
			);
			return crate::recipe::schedule_stored_raster(ds, &raster);
		}
		Ok(raster)
	}

	pub(crate) fn wrap_array(
		ds: &Dataset,
		fp: Footprint,
		array: Array3<f64>,
		schema: Option<ChannelsSchema>,
		sr: Option<String>,
		mode: RasterMode,
	) -> Result<Raster> {
		let (rows, cols) = fp.shape();
		ensure!(
			array.dim().0 == rows && array.dim().1 == cols && array.dim().2 > 0,
			Error::InvalidParameter(format!(
				"array shape {:?} does not match footprint shape ({rows}, {cols})",
				array.dim()
			))
		);
		let channel_count = array.dim().2;
		let schema = schema.unwrap_or_else(|| ChannelsSchema::default_for(channel_count));
		schema.validate(channel_count)?;
		let inner_ds = ds.inner();
		let work_fp = inner_ds.sr.to_work(&fp, sr.as_deref())?;
		inner_ds.debug.object_allocated("raster");
		Ok(Raster {
			inner: Arc::new(RasterInner {
				uid: Uuid::new_v4(),
				kind: RasterKind::InMem {
					array: Arc::new(RwLock::new(array)),
				},
				fp: work_fp,
				fp_stored: fp,
				dtype: PixelDtype::F64,
				channel_count,
				schema,
				wkt_stored: sr,
				mode,
				allow_interpolation: inner_ds.allow_interpolation,
				handle_pool: inner_ds.handle_pool.clone(),
				engine: inner_ds.engine.clone(),
			}),
		})
	}

	// -- attributes -------------------------------------------------------

	pub fn uid(&self) -> Uuid {
		self.inner.uid
	}

	/// Working footprint.
	pub fn fp(&self) -> &Footprint {
		&self.inner.fp
	}

	pub fn fp_stored(&self) -> &Footprint {
		&self.inner.fp_stored
	}

	pub fn dtype(&self) -> PixelDtype {
		self.inner.dtype
	}

	pub fn channel_count(&self) -> usize {
		self.inner.channel_count
	}

	pub fn schema(&self) -> &ChannelsSchema {
		&self.inner.schema
	}

	/// The raster-level nodata sentinel.
	pub fn nodata(&self) -> Option<f64> {
		self.inner.schema.shared_nodata()
	}

	pub fn wkt_stored(&self) -> Option<&str> {
		self.inner.wkt_stored.as_deref()
	}

	pub fn mode(&self) -> RasterMode {
		self.inner.mode
	}

	/// Is this raster managed by the Dataset's scheduler?
	pub fn is_scheduled(&self) -> bool {
		matches!(self.inner.kind, RasterKind::Scheduled)
	}

	fn resolve_channels(&self, channels: Option<&[usize]>) -> Result<Vec<usize>> {
		match channels {
			None => Ok((0..self.inner.channel_count).collect()),
			Some(channels) => {
				ensure!(
					!channels.is_empty(),
					Error::InvalidParameter("empty channel selection".to_string())
				);
				for &c in channels {
					ensure!(
						c < self.inner.channel_count,
						Error::InvalidParameter(format!(
							"channel {c} out of range (raster has {})",
							self.inner.channel_count
						))
					);
				}
				Ok(channels.to_vec())
			}
		}
	}

	// -- reading ----------------------------------------------------------

	/// Read one rectangle of data, remapped onto `fp`.
	///
	/// Returns a `(rows, cols, channels)` array; pixels outside the raster
	/// are `dst_nodata`.
	pub fn get_data(&self, fp: &Footprint, options: QueryOptions) -> Result<Array3<f64>> {
		match &self.inner.kind {
			RasterKind::Scheduled => {
				let mut rx = self.queue_data(vec![fp.clone()], QueryOptions {
					max_queue_size: 1,
					..options
				})?;
				rx.recv()
			}
			_ => self.get_data_sync(fp, &options),
		}
	}

	fn get_data_sync(&self, fp: &Footprint, options: &QueryOptions) -> Result<Array3<f64>> {
		let channels = self.resolve_channels(options.channels.as_deref())?;
		let dst_nodata = options.dst_nodata.or(self.nodata()).unwrap_or(0.0);
		let (rows, cols) = fp.shape();

		let sample_fp = build_sampling_footprint(
			&self.inner.fp,
			fp,
			options.interpolation,
			self.inner.allow_interpolation,
		)?;
		let Some(sample_fp) = sample_fp else {
			return Ok(Array3::from_elem((rows, cols, channels.len()), dst_nodata));
		};
		let sample = self.read_sample(&sample_fp, &channels)?;
		let params = RemapParams {
			src_nodata: self.nodata(),
			dst_nodata,
			mask_mode: rasterloom_core::MaskMode::Erode,
			interpolation: Some(options.interpolation),
		};
		let (out, _) = remap(&sample_fp, fp, Some(&sample), None, &params)?;
		Ok(out.expect("array in, array out"))
	}

	/// Pixels of `sample_fp` (a sub-footprint of the working grid), selected
	/// channels. The pixel rectangle is the same in the stored grid.
	fn read_sample(&self, sample_fp: &Footprint, channels: &[usize]) -> Result<Array3<f64>> {
		let window = sample_fp.slice_in(&self.inner.fp, false)?;
		match &self.inner.kind {
			RasterKind::Stored { path, driver } => {
				let path = path.clone();
				let driver = driver.clone();
				let writable = self.inner.mode == RasterMode::Write;
				let mut lease = self
					.inner
					.handle_pool
					.acquire(self.inner.uid, &move || driver.open(&path, writable))?;
				lease.get().read_window(&window, channels)
			}
			RasterKind::InMem { array } => {
				let array = array.read();
				let block = array.slice(s![window.y.clone(), window.x.clone(), ..]);
				let mut out = Array3::zeros((window.y.len(), window.x.len(), channels.len()));
				for (k, &c) in channels.iter().enumerate() {
					out.slice_mut(s![.., .., k]).assign(&block.slice(s![.., .., c]));
				}
				Ok(out)
			}
			RasterKind::Scheduled => unreachable!("scheduled rasters read through the engine"),
		}
	}

	// -- writing ----------------------------------------------------------

	/// Overwrite pixels of a write-mode stored raster. `fp` must lie on the
	/// raster's grid; the array carries every channel.
	pub fn set_data(&self, fp: &Footprint, array: &Array3<f64>) -> Result<()> {
		ensure!(
			self.inner.mode == RasterMode::Write,
			Error::InvalidParameter("raster is not open in write mode".to_string())
		);
		ensure!(
			fp.same_grid(&self.inner.fp)?,
			Error::GridMismatch(format!("{fp} does not lie on the raster grid"))
		);
		let (rows, cols) = fp.shape();
		ensure!(
			array.dim() == (rows, cols, self.inner.channel_count),
			Error::InvalidParameter(format!(
				"array shape {:?} does not match ({rows}, {cols}, {})",
				array.dim(),
				self.inner.channel_count
			))
		);
		let into = fp.slice_in(&self.inner.fp, true)?;
		let from = self.inner.fp.slice_in(fp, true)?;
		if into.is_empty() {
			return Ok(());
		}
		let block = array.slice(s![from.y, from.x, ..]);
		match &self.inner.kind {
			RasterKind::Stored { path, driver } => {
				let path = path.clone();
				let driver = driver.clone();
				let mut lease = self
					.inner
					.handle_pool
					.acquire(self.inner.uid, &move || driver.open(&path, true))?;
				lease.get().write_window(&into, &block)?;
				lease.get().sync()
			}
			RasterKind::InMem { array: target } => {
				target.write().slice_mut(s![into.y, into.x, ..]).assign(&block);
				Ok(())
			}
			RasterKind::Scheduled => {
				Err(Error::InvalidParameter("scheduled rasters cannot be written to".to_string()).into())
			}
		}
	}

	// -- scheduled queries ------------------------------------------------

	/// Queue several rectangles at once; arrays arrive on the returned
	/// receiver in footprint order, at most `max_queue_size` buffered ahead.
	///
	/// Dropping the receiver gracefully cancels the rest of the query.
	pub fn queue_data(&self, fps: Vec<Footprint>, options: QueryOptions) -> Result<QueueReceiver> {
		ensure!(
			self.is_scheduled(),
			Error::InvalidParameter("queue_data requires a scheduler-managed raster".to_string())
		);
		let channels = self.resolve_channels(options.channels.as_deref())?;
		self.inner.engine.queue_data(
			self.inner.uid,
			fps,
			channels,
			options.dst_nodata,
			options.interpolation,
			options.max_queue_size,
		)
	}

	/// Like [`Raster::queue_data`], as a blocking iterator that probes
	/// scheduler liveness while waiting.
	pub fn iter_data(&self, fps: Vec<Footprint>, options: QueryOptions) -> Result<DataIterator> {
		let remaining = fps.len();
		let receiver = self.queue_data(fps, options)?;
		Ok(DataIterator { receiver, remaining })
	}
}

impl std::fmt::Debug for Raster {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let kind = match self.inner.kind {
			RasterKind::Stored { .. } => "stored",
			RasterKind::InMem { .. } => "in-mem",
			RasterKind::Scheduled => "scheduled",
		};
		f.debug_struct("Raster")
			.field("kind", &kind)
			.field("fp", &self.inner.fp)
			.field("dtype", &self.inner.dtype)
			.field("channels", &self.inner.channel_count)
			.finish()
	}
}

/// Blocking stream over a query's arrays, in footprint order.
pub struct DataIterator {
	receiver: QueueReceiver,
	remaining: usize,
}

impl Iterator for DataIterator {
	type Item = Result<Array3<f64>>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.remaining == 0 {
			return None;
		}
		match self.receiver.recv() {
			Ok(array) => {
				self.remaining -= 1;
				Some(Ok(array))
			}
			Err(err) => {
				self.remaining = 0; // an error is terminal
				Some(Err(err))
			}
		}
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		(self.remaining, Some(self.remaining))
	}
}
