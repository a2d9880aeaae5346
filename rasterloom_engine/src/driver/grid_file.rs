//! The built-in binary grid format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic   8 bytes  b"RLGRID\x00\x01"
//! dtype   1 byte   PixelDtype code
//! chans   2 bytes  channel count
//! rsizex  8 bytes
//! rsizey  8 bytes
//! gt      48 bytes GDAL geotransform, 6 f64
//! metalen 4 bytes  length of the JSON block
//! meta    n bytes  JSON: channels schema + optional spatial reference
//! pixels  rows * cols * chans values, row-major, channel-interleaved
//! ```
//!
//! Handles keep the full pixel block in memory (tiles are small by
//! construction) and write it back on [`sync`](super::DriverHandle::sync).

use super::{Driver, DriverHandle, RasterMeta};
use anyhow::{Context, Result, bail, ensure};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use ndarray::{Array3, ArrayView3, s};
use rasterloom_core::{ChannelsSchema, Footprint, PixelDtype, Slice2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"RLGRID\x00\x01";

/// The built-in file format driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct GridDriver;

#[derive(Serialize, Deserialize)]
struct MetaJson {
	schema: ChannelsSchema,
	wkt: Option<String>,
}

impl Driver for GridDriver {
	fn name(&self) -> &'static str {
		"grid"
	}

	fn create(&self, path: &Path, meta: &RasterMeta) -> Result<()> {
		meta.validate()?;
		let (rows, cols) = meta.fp.shape();
		let zeros = Array3::zeros((rows, cols, meta.channel_count));
		write_grid_file(path, meta, &zeros.view()).with_context(|| format!("creating grid file '{}'", path.display()))
	}

	fn open(&self, path: &Path, writable: bool) -> Result<Box<dyn DriverHandle>> {
		let (meta, pixels) =
			read_grid_file(path).with_context(|| format!("opening grid file '{}'", path.display()))?;
		Ok(Box::new(GridHandle {
			path: path.to_path_buf(),
			meta,
			pixels,
			writable,
			dirty: false,
		}))
	}
}

/// Serialize a full grid file to `path`.
pub fn write_grid_file(path: &Path, meta: &RasterMeta, pixels: &ArrayView3<'_, f64>) -> Result<()> {
	let (rows, cols) = meta.fp.shape();
	ensure!(
		pixels.dim() == (rows, cols, meta.channel_count),
		"pixel block shape {:?} does not match footprint shape ({rows}, {cols}, {})",
		pixels.dim(),
		meta.channel_count,
	);
	let file = File::create(path)?;
	{
		let mut w = BufWriter::new(&file);
		w.write_all(MAGIC)?;
		w.write_u8(meta.dtype.code())?;
		w.write_u16::<LE>(meta.channel_count as u16)?;
		w.write_u64::<LE>(meta.fp.rsizex() as u64)?;
		w.write_u64::<LE>(meta.fp.rsizey() as u64)?;
		for v in meta.fp.gt() {
			w.write_f64::<LE>(v)?;
		}
		let json = serde_json::to_vec(&MetaJson {
			schema: meta.schema.clone(),
			wkt: meta.wkt.clone(),
		})?;
		w.write_u32::<LE>(json.len() as u32)?;
		w.write_all(&json)?;
		for &v in pixels.iter() {
			write_value(&mut w, meta.dtype, meta.dtype.quantize(v))?;
		}
		w.flush()?;
	}
	file.sync_all()?;
	Ok(())
}

/// Deserialize a full grid file.
pub fn read_grid_file(path: &Path) -> Result<(RasterMeta, Array3<f64>)> {
	let file = File::open(path)?;
	let mut r = BufReader::new(file);
	let mut magic = [0u8; 8];
	r.read_exact(&mut magic)?;
	if &magic != MAGIC {
		bail!("not a grid file (bad magic)");
	}
	let dtype = PixelDtype::from_code(r.read_u8()?)?;
	let channel_count = r.read_u16::<LE>()? as usize;
	let rsizex = r.read_u64::<LE>()? as usize;
	let rsizey = r.read_u64::<LE>()? as usize;
	let mut gt = [0f64; 6];
	for v in &mut gt {
		*v = r.read_f64::<LE>()?;
	}
	let json_len = r.read_u32::<LE>()? as usize;
	let mut json = vec![0u8; json_len];
	r.read_exact(&mut json)?;
	let meta_json: MetaJson = serde_json::from_slice(&json)?;
	let fp = Footprint::from_gt(gt, (rsizex, rsizey))?;
	let meta = RasterMeta {
		fp,
		dtype,
		channel_count,
		schema: meta_json.schema,
		wkt: meta_json.wkt,
	};
	meta.validate()?;
	let mut pixels = Array3::zeros((rsizey, rsizex, channel_count));
	for v in pixels.iter_mut() {
		*v = read_value(&mut r, dtype)?;
	}
	Ok((meta, pixels))
}

fn write_value<W: Write>(w: &mut W, dtype: PixelDtype, v: f64) -> Result<()> {
	match dtype {
		PixelDtype::U8 => w.write_u8(v as u8)?,
		PixelDtype::U16 => w.write_u16::<LE>(v as u16)?,
		PixelDtype::I16 => w.write_i16::<LE>(v as i16)?,
		PixelDtype::U32 => w.write_u32::<LE>(v as u32)?,
		PixelDtype::I32 => w.write_i32::<LE>(v as i32)?,
		PixelDtype::F32 => w.write_f32::<LE>(v as f32)?,
		PixelDtype::F64 => w.write_f64::<LE>(v)?,
	}
	Ok(())
}

fn read_value<R: Read>(r: &mut R, dtype: PixelDtype) -> Result<f64> {
	Ok(match dtype {
		PixelDtype::U8 => f64::from(r.read_u8()?),
		PixelDtype::U16 => f64::from(r.read_u16::<LE>()?),
		PixelDtype::I16 => f64::from(r.read_i16::<LE>()?),
		PixelDtype::U32 => f64::from(r.read_u32::<LE>()?),
		PixelDtype::I32 => f64::from(r.read_i32::<LE>()?),
		PixelDtype::F32 => f64::from(r.read_f32::<LE>()?),
		PixelDtype::F64 => r.read_f64::<LE>()?,
	})
}

struct GridHandle {
	path: PathBuf,
	meta: RasterMeta,
	pixels: Array3<f64>,
	writable: bool,
	dirty: bool,
}

impl DriverHandle for GridHandle {
	fn meta(&self) -> &RasterMeta {
		&self.meta
	}

	fn read_window(&mut self, window: &Slice2, channels: &[usize]) -> Result<Array3<f64>> {
		let (rows, cols) = self.meta.fp.shape();
		ensure!(
			window.y.end <= rows && window.x.end <= cols,
			"window ({:?}, {:?}) exceeds raster shape ({rows}, {cols})",
			window.y,
			window.x,
		);
		for &c in channels {
			ensure!(c < self.meta.channel_count, "channel {c} out of range");
		}
		let block = self.pixels.slice(s![window.y.clone(), window.x.clone(), ..]);
		let mut out = Array3::zeros((window.y.len(), window.x.len(), channels.len()));
		for (k, &c) in channels.iter().enumerate() {
			out.slice_mut(s![.., .., k]).assign(&block.slice(s![.., .., c]));
		}
		Ok(out)
	}

	fn write_window(&mut self, window: &Slice2, data: &ArrayView3<'_, f64>) -> Result<()> {
		ensure!(self.writable, "raster '{}' is open read-only", self.path.display());
		let (rows, cols) = self.meta.fp.shape();
		ensure!(
			window.y.end <= rows && window.x.end <= cols,
			"window ({:?}, {:?}) exceeds raster shape ({rows}, {cols})",
			window.y,
			window.x,
		);
		ensure!(
			data.dim() == (window.y.len(), window.x.len(), self.meta.channel_count),
			"data shape {:?} does not match window",
			data.dim(),
		);
		let dtype = self.meta.dtype;
		self
			.pixels
			.slice_mut(s![window.y.clone(), window.x.clone(), ..])
			.zip_mut_with(data, |dst, &src| *dst = dtype.quantize(src));
		self.dirty = true;
		Ok(())
	}

	fn sync(&mut self) -> Result<()> {
		if self.dirty {
			write_grid_file(&self.path, &self.meta, &self.pixels.view())?;
			self.dirty = false;
		}
		Ok(())
	}
}

impl Drop for GridHandle {
	fn drop(&mut self) {
		if self.dirty {
			if let Err(err) = self.sync() {
				log::warn!("failed to flush grid file '{}' on drop: {err:#}", self.path.display());
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rasterloom_core::ChannelsSchema;

	fn meta(dtype: PixelDtype, channels: usize) -> RasterMeta {
		RasterMeta {
			fp: Footprint::new((0.0, 8.0), (1.0, -1.0), (10, 8)).unwrap(),
			dtype,
			channel_count: channels,
			schema: ChannelsSchema::with_nodata(channels, -99.0),
			wkt: Some("LOCAL_CS[\"arbitrary\"]".to_string()),
		}
	}

	#[test]
	fn create_open_read() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("t.grid");
		let meta = meta(PixelDtype::F32, 2);
		GridDriver.create(&path, &meta).unwrap();
		let mut handle = GridDriver.open(&path, false).unwrap();
		assert_eq!(handle.meta().channel_count, 2);
		assert!(handle.meta().fp.equals(&meta.fp).unwrap());
		assert_eq!(handle.meta().wkt, meta.wkt);
		let block = handle.read_window(&Slice2 { y: 0..8, x: 0..10 }, &[0, 1]).unwrap();
		assert_eq!(block.dim(), (8, 10, 2));
		assert!(block.iter().all(|&v| v == 0.0));
	}

	#[test]
	fn write_persists_through_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("t.grid");
		let meta = meta(PixelDtype::I32, 1);
		GridDriver.create(&path, &meta).unwrap();
		{
			let mut handle = GridDriver.open(&path, true).unwrap();
			let data = Array3::from_shape_fn((2, 3, 1), |(j, i, _)| (10 * j + i) as f64);
			handle.write_window(&Slice2 { y: 1..3, x: 2..5 }, &data.view()).unwrap();
			handle.sync().unwrap();
		}
		let mut handle = GridDriver.open(&path, false).unwrap();
		let block = handle.read_window(&Slice2 { y: 1..3, x: 2..5 }, &[0]).unwrap();
		assert_eq!(block[(0, 0, 0)], 0.0);
		assert_eq!(block[(1, 2, 0)], 12.0);
		// outside the window untouched
		let rest = handle.read_window(&Slice2 { y: 0..1, x: 0..10 }, &[0]).unwrap();
		assert!(rest.iter().all(|&v| v == 0.0));
	}

	#[test]
	fn integer_dtype_quantizes() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("t.grid");
		let meta = meta(PixelDtype::U8, 1);
		GridDriver.create(&path, &meta).unwrap();
		let mut handle = GridDriver.open(&path, true).unwrap();
		let data = Array3::from_elem((1, 1, 1), 300.7);
		handle.write_window(&Slice2 { y: 0..1, x: 0..1 }, &data.view()).unwrap();
		let back = handle.read_window(&Slice2 { y: 0..1, x: 0..1 }, &[0]).unwrap();
		assert_eq!(back[(0, 0, 0)], 255.0);
	}

	#[test]
	fn read_only_rejects_writes_and_bad_windows() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("t.grid");
		let meta = meta(PixelDtype::F64, 1);
		GridDriver.create(&path, &meta).unwrap();
		let mut handle = GridDriver.open(&path, false).unwrap();
		let data = Array3::zeros((1, 1, 1));
		assert!(handle.write_window(&Slice2 { y: 0..1, x: 0..1 }, &data.view()).is_err());
		assert!(handle.read_window(&Slice2 { y: 0..9, x: 0..10 }, &[0]).is_err());
		assert!(handle.read_window(&Slice2 { y: 0..1, x: 0..1 }, &[3]).is_err());
	}

	#[test]
	fn truncated_file_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("t.grid");
		let meta = meta(PixelDtype::F64, 1);
		GridDriver.create(&path, &meta).unwrap();
		let bytes = std::fs::read(&path).unwrap();
		std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();
		assert!(GridDriver.open(&path, false).is_err());
	}
}
