//! Persists merged cache tiles: temp file, fsync, checksum, atomic rename.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::cache;
use crate::driver::RasterMeta;
use crate::raster::{RasterSpec, TileCoord2};
use anyhow::Result;
use ndarray::Array3;
use std::path::PathBuf;
use std::sync::Arc;

pub struct Writer {
	spec: Arc<RasterSpec>,
}

impl Writer {
	pub fn new(spec: Arc<RasterSpec>) -> Writer {
		Writer { spec }
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::WriteTile { tile, array, priority } => Ok(self.receive_write_tile(tile, array, priority)),
			Verb::WriteOutcome { tile, result } => Ok(self.receive_write_outcome(tile, result)),
			other => unexpected_verb!("Writer", other),
		}
	}

	fn receive_write_tile(&mut self, tile: TileCoord2, array: Array3<f64>, priority: JobPriority) -> Vec<Msg> {
		let cache = self.spec.cache.as_ref().expect("writes imply a cache");
		let fp = cache.tiles.get(tile).clone();
		let key_str = cache::tile_key(&fp);
		let meta = RasterMeta {
			fp,
			dtype: self.spec.dtype,
			channel_count: self.spec.channel_count,
			schema: self.spec.schema.clone(),
			wkt: self.spec.wkt.clone(),
		};
		vec![
			Msg::new(
				Address::CacheSupervisor(self.spec.uid),
				Verb::WriteStarted { tile },
			),
			Msg::new(
				Address::Pool(cache.io_pool.key),
				Verb::Enqueue {
					priority,
					query: None,
					task: Box::new(PoolTask::Write {
						reply_to: Address::Writer(self.spec.uid),
						tile,
						dir: cache.dir.clone(),
						key_str,
						meta,
						array,
					}),
				},
			),
		]
	}

	fn receive_write_outcome(&mut self, tile: TileCoord2, result: Result<(PathBuf, String), String>) -> Vec<Msg> {
		let verb = match result {
			Ok((path, _checksum)) => Verb::WriteDone { tile, path },
			Err(error) => Verb::WriteFailed { tile, error },
		};
		vec![Msg::new(Address::CacheSupervisor(self.spec.uid), verb)]
	}
}
