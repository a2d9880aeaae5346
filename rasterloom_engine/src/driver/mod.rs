//! The one-tile raster backend interface.
//!
//! A [`Driver`] knows how to create and open raster files of one format; a
//! [`DriverHandle`] is an opened file. Handles are the expensive resources
//! the [`pool`](crate::driver::pool) bounds: the engine never holds one
//! longer than a single read or write.
//!
//! Real formats (GDAL and friends) are external collaborators plugging in
//! through these traits; the built-in [`GridDriver`] covers the file cache
//! and tests.

pub(crate) mod grid_file;
pub mod pool;

pub use grid_file::GridDriver;

use anyhow::Result;
use ndarray::{Array3, ArrayView3};
use rasterloom_core::{ChannelsSchema, Footprint, PixelDtype, Slice2};
use std::fmt::Debug;
use std::path::Path;

/// Everything a driver knows about a raster file.
#[derive(Debug, Clone)]
pub struct RasterMeta {
	pub fp: Footprint,
	pub dtype: PixelDtype,
	pub channel_count: usize,
	pub schema: ChannelsSchema,
	pub wkt: Option<String>,
}

impl RasterMeta {
	pub fn validate(&self) -> Result<()> {
		use rasterloom_core::errors::Error;
		if self.channel_count == 0 {
			return Err(Error::InvalidParameter("channel count should be > 0".to_string()).into());
		}
		self.schema.validate(self.channel_count)
	}
}

/// A raster file format.
pub trait Driver: Send + Sync + Debug + 'static {
	fn name(&self) -> &'static str;

	/// Create a new file filled with zeros.
	fn create(&self, path: &Path, meta: &RasterMeta) -> Result<()>;

	/// Open an existing file.
	fn open(&self, path: &Path, writable: bool) -> Result<Box<dyn DriverHandle>>;
}

/// An opened raster file.
///
/// Windows are pixel rectangles in the file's own footprint; callers derive
/// them with [`Footprint::slice_in`]. Pixels cross the boundary as `f64`,
/// whatever the storage dtype.
pub trait DriverHandle: Send {
	fn meta(&self) -> &RasterMeta;

	/// Read a `(rows, cols, channels)` block of the given channels.
	fn read_window(&mut self, window: &Slice2, channels: &[usize]) -> Result<Array3<f64>>;

	/// Overwrite a window with `data` (all channels).
	fn write_window(&mut self, window: &Slice2, data: &ArrayView3<'_, f64>) -> Result<()>;

	/// Flush pending writes to durable storage.
	fn sync(&mut self) -> Result<()>;
}
