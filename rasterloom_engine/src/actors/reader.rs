//! Checksum validation of adopted cache files.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::raster::{RasterSpec, TileCoord2};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Validates that an on-disk tile still matches the checksum in its name,
/// off the scheduler thread.
pub struct Reader {
	spec: Arc<RasterSpec>,
}

impl Reader {
	pub fn new(spec: Arc<RasterSpec>) -> Reader {
		Reader { spec }
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::CheckTile {
				tile,
				path,
				expected_hex,
				priority,
			} => Ok(self.receive_check_tile(tile, path, expected_hex, priority)),
			Verb::ChecksumOutcome { tile, path, result } => Ok(self.receive_checksum_outcome(tile, path, result)),
			other => unexpected_verb!("Reader", other),
		}
	}

	fn receive_check_tile(
		&mut self,
		tile: TileCoord2,
		path: PathBuf,
		expected_hex: String,
		priority: JobPriority,
	) -> Vec<Msg> {
		let cache = self.spec.cache.as_ref().expect("checksum checks imply a cache");
		vec![Msg::new(
			Address::Pool(cache.io_pool.key),
			Verb::Enqueue {
				priority,
				query: None,
				task: Box::new(PoolTask::Checksum {
					reply_to: Address::Reader(self.spec.uid),
					tile,
					path,
					expected_hex,
				}),
			},
		)]
	}

	fn receive_checksum_outcome(&mut self, tile: TileCoord2, path: PathBuf, result: Result<bool, String>) -> Vec<Msg> {
		let ok = match result {
			Ok(matches) => matches,
			Err(error) => {
				log::warn!("checksum read failed on '{}': {error}", path.display());
				false
			}
		};
		vec![Msg::new(
			Address::CacheSupervisor(self.spec.uid),
			Verb::CheckResult { tile, path, ok },
		)]
	}
}
