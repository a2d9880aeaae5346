//! Combines computed pieces into whole cache tiles.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::raster::{RasterSpec, TileCoord2};
use anyhow::Result;
use ndarray::Array3;
use rasterloom_core::Footprint;
use rasterloom_core::errors::Error;
use std::collections::HashMap;
use std::sync::Arc;

struct PendingTile {
	expected: usize,
	pieces: Vec<(Footprint, Array3<f64>)>,
	priority: JobPriority,
}

pub struct Merger {
	spec: Arc<RasterSpec>,
	pending: HashMap<TileCoord2, PendingTile>,
	/// Priority of merges in flight, to stamp the follow-up write.
	merging: HashMap<TileCoord2, JobPriority>,
}

impl Merger {
	pub fn new(spec: Arc<RasterSpec>) -> Merger {
		Merger {
			spec,
			pending: HashMap::new(),
			merging: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::ExpectCacheTile {
				tile,
				ctile_fps,
				priority,
			} => {
				// duplicate production waves share the first registration
				self.pending.entry(tile).or_insert(PendingTile {
					expected: ctile_fps.len(),
					pieces: Vec::new(),
					priority,
				});
				Ok(Vec::new())
			}
			Verb::PieceReady { tile, fp, array } => self.receive_piece_ready(tile, fp, array),
			Verb::MergeOutcome { tile, result } => self.receive_merge_outcome(tile, result),
			Verb::AbandonCacheTile { tile } => {
				self.pending.remove(&tile);
				Ok(Vec::new())
			}
			other => unexpected_verb!("Merger", other),
		}
	}

	fn receive_piece_ready(&mut self, tile: TileCoord2, fp: Footprint, array: Array3<f64>) -> Result<Vec<Msg>> {
		let Some(pending) = self.pending.get_mut(&tile) else {
			return Ok(Vec::new());
		};
		pending.pieces.push((fp, array));
		if pending.pieces.len() < pending.expected {
			return Ok(Vec::new());
		}
		let PendingTile { pieces, priority, .. } = self.pending.remove(&tile).expect("present");
		let cache = self.spec.cache.as_ref().expect("merges imply a cache");
		let tile_fp = cache.tiles.get(tile).clone();

		// a single piece that is exactly the tile skips the merge pool
		if pieces.len() == 1 && pieces[0].0.equals(&tile_fp)? {
			let (_, array) = pieces.into_iter().next().expect("one piece");
			return Ok(vec![Msg::new(
				Address::Writer(self.spec.uid),
				Verb::WriteTile { tile, array, priority },
			)]);
		}

		// the user merge function only sees true multi-piece merges; a lone
		// oversized piece is cropped by the default paste
		let merge = if pieces.len() > 1 { self.spec.merge.clone() } else { None };
		self.merging.insert(tile, priority);
		Ok(vec![Msg::new(
			Address::Pool(self.spec.merge_pool.key),
			Verb::Enqueue {
				priority,
				query: None,
				task: Box::new(PoolTask::Merge {
					reply_to: Address::Merger(self.spec.uid),
					tile,
					fp: tile_fp,
					pieces,
					merge,
					fill: self.spec.nodata().unwrap_or(0.0),
				}),
			},
		)])
	}

	fn receive_merge_outcome(&mut self, tile: TileCoord2, result: Result<Array3<f64>, String>) -> Result<Vec<Msg>> {
		let priority = self
			.merging
			.remove(&tile)
			.unwrap_or(JobPriority { query_seq: 0, prod_id: 0 });
		match result {
			Ok(array) => Ok(vec![Msg::new(
				Address::Writer(self.spec.uid),
				Verb::WriteTile { tile, array, priority },
			)]),
			Err(error) => Err(Error::ComputeFailed(format!("merging cache tile {tile} failed: {error}")).into()),
		}
	}
}
