//! Schedules window reads against ready cache files and forwards the pixels
//! to the Sampler.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::raster::{RasterSpec, TileCoord2};
use anyhow::Result;
use ndarray::Array3;
use rasterloom_core::Footprint;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub struct CacheExtractor {
	spec: Arc<RasterSpec>,
	plans: HashMap<QueryId, Arc<QueryPlan>>,
}

impl CacheExtractor {
	pub fn new(spec: Arc<RasterSpec>) -> CacheExtractor {
		CacheExtractor {
			spec,
			plans: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::RegisterQuery { query, plan, .. } => {
				self.plans.insert(query, plan);
				Ok(Vec::new())
			}
			Verb::ScheduleRead {
				query,
				prod_id,
				tile,
				path,
				file_uid,
			} => self.receive_schedule_read(query, prod_id, tile, path, file_uid),
			Verb::ReadOutcome {
				query,
				prod_id,
				tile,
				fp,
				result,
			} => Ok(self.receive_read_outcome(query, prod_id, tile, &fp, result)),
			Verb::CancelQuery { query } => {
				self.plans.remove(&query);
				Ok(Vec::new())
			}
			other => unexpected_verb!("CacheExtractor", other),
		}
	}

	fn receive_schedule_read(
		&mut self,
		query: QueryId,
		prod_id: usize,
		tile: TileCoord2,
		path: PathBuf,
		file_uid: Uuid,
	) -> Result<Vec<Msg>> {
		let Some(plan) = self.plans.get(&query) else {
			return Ok(Vec::new()); // cancelled before the tile became ready
		};
		let cache = self.spec.cache.as_ref().expect("cache reads imply a cache");
		let sample_fp = plan.prods[prod_id]
			.sample_fp
			.as_ref()
			.expect("cache reads imply a sample footprint");
		let tile_fp = cache.tiles.get(tile);
		let read_fp = tile_fp.intersection(sample_fp)?;
		let window = read_fp.slice_in(tile_fp, false)?;
		Ok(vec![Msg::new(
			Address::Pool(cache.io_pool.key),
			Verb::Enqueue {
				priority: JobPriority::new(query, prod_id),
				query: Some(query),
				task: Box::new(PoolTask::Read {
					reply_to: Address::CacheExtractor(self.spec.uid),
					query,
					prod_id,
					tile,
					fp: read_fp,
					path,
					file_uid,
					window,
					channels: plan.channels.clone(),
				}),
			},
		)])
	}

	fn receive_read_outcome(
		&mut self,
		query: QueryId,
		prod_id: usize,
		tile: TileCoord2,
		fp: &Footprint,
		result: Result<Array3<f64>, String>,
	) -> Vec<Msg> {
		if !self.plans.contains_key(&query) {
			return Vec::new(); // cancelled; discard the pixels
		}
		match result {
			Ok(array) => vec![Msg::new(
				Address::Sampler(self.spec.uid),
				Verb::PieceRead {
					query,
					prod_id,
					fp: fp.clone(),
					array,
				},
			)],
			Err(error) => {
				// a read that fails mid-session means the file went bad under
				// us; the supervisor purges it, recomputes, and replays this
				// read once the tile is ready again
				log::warn!("cache read failed on tile {tile}: {error}");
				vec![Msg::new(
					Address::CacheSupervisor(self.spec.uid),
					Verb::ReadCorruption { tile, query, prod_id },
				)]
			}
		}
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.plans.remove(&query);
		Vec::new()
	}
}
