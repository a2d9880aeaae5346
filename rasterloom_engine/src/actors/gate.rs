//! The computation gate: at most one compute in flight per computation
//! tile, with a queue of pending requesters behind it.
//!
//! Cache production shares one compute run across every cache tile waiting
//! on a computation tile; query-side requests (uncached rasters) each get
//! their own run, serialized per tile.

use super::unexpected_verb;
use crate::bus::{Address, ComputeKey, JobPriority, Msg, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::raster::{RasterSpec, TileCoord2};
use anyhow::Result;
use ndarray::Array3;
use rasterloom_core::Footprint;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requester {
	/// The cache pipeline; the result fans out to waiting cache tiles.
	Cache,
	/// One production of one query (uncached path).
	Query { query: QueryId, prod_id: usize },
}

#[derive(Default)]
struct TileEntry {
	/// The requester whose compute is currently running.
	current: Option<Requester>,
	queue: VecDeque<(Requester, JobPriority)>,
}

pub struct ComputationGate {
	spec: Arc<RasterSpec>,
	plans: HashMap<QueryId, Arc<QueryPlan>>,
	entries: HashMap<ComputeKey, TileEntry>,
	/// Cache tiles waiting on each computation tile's cache run.
	cache_waiters: HashMap<ComputeKey, Vec<TileCoord2>>,
	/// Computation tiles with a cache run queued or running.
	cache_requested: HashSet<ComputeKey>,
	batch_counter: u64,
}

impl ComputationGate {
	pub fn new(spec: Arc<RasterSpec>) -> ComputationGate {
		ComputationGate {
			spec,
			plans: HashMap::new(),
			entries: HashMap::new(),
			cache_waiters: HashMap::new(),
			cache_requested: HashSet::new(),
			batch_counter: 0,
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::RegisterQuery { query, plan, .. } => {
				self.plans.insert(query, plan);
				Ok(Vec::new())
			}
			Verb::ComputeNeeded { query, prod_id } => Ok(self.receive_compute_needed(query, prod_id)),
			Verb::ProduceCacheTile { tile, priority } => self.receive_produce_cache_tile(tile, priority),
			Verb::ComputeDone { key, fp, array } => Ok(self.receive_compute_done(key, &fp, array)),
			Verb::ComputePurged { key } => Ok(self.receive_compute_purged(key)),
			Verb::AbandonCacheTile { tile } => Ok(self.receive_abandon_cache_tile(tile)),
			Verb::CancelQuery { query } => Ok(self.receive_cancel_query(query)),
			other => unexpected_verb!("ComputationGate", other),
		}
	}

	fn receive_compute_needed(&mut self, query: QueryId, prod_id: usize) -> Vec<Msg> {
		let Some(plan) = self.plans.get(&query) else {
			return Vec::new();
		};
		let requester = Requester::Query { query, prod_id };
		let priority = JobPriority::new(query, prod_id);
		let mut msgs = Vec::new();
		if self.spec.automatic_remapping {
			let tiles = plan.prods[prod_id].compute_tiles.clone();
			for coord in tiles {
				msgs.extend(self.enqueue_request(ComputeKey::Tile(coord), requester, priority));
			}
		} else {
			msgs.extend(self.enqueue_request(ComputeKey::AdHoc(query, prod_id), requester, priority));
		}
		msgs
	}

	fn receive_produce_cache_tile(&mut self, tile: TileCoord2, priority: JobPriority) -> Result<Vec<Msg>> {
		let cache = self.spec.cache.as_ref().expect("cache production implies a cache");
		let tile_fp = cache.tiles.get(tile).clone();
		let coords = self.spec.computation_tiles.coords_overlapping(&tile_fp)?;
		let ctile_fps: Vec<Footprint> = coords
			.iter()
			.map(|&c| self.spec.computation_tiles.get(c).clone())
			.collect();

		let mut msgs = vec![Msg::new(
			Address::Merger(self.spec.uid),
			Verb::ExpectCacheTile {
				tile,
				ctile_fps,
				priority,
			},
		)];
		for coord in coords {
			let key = ComputeKey::Tile(coord);
			self.cache_waiters.entry(key).or_default().push(tile);
			if self.cache_requested.insert(key) {
				msgs.extend(self.enqueue_request(key, Requester::Cache, priority));
			}
		}
		Ok(msgs)
	}

	fn enqueue_request(&mut self, key: ComputeKey, requester: Requester, priority: JobPriority) -> Vec<Msg> {
		self
			.entries
			.entry(key)
			.or_default()
			.queue
			.push_back((requester, priority));
		self.pump(key)
	}

	/// Start the next queued request of `key` if none is running.
	fn pump(&mut self, key: ComputeKey) -> Vec<Msg> {
		let entry = self.entries.entry(key).or_default();
		if entry.current.is_some() {
			return Vec::new();
		}
		let Some((requester, priority)) = entry.queue.pop_front() else {
			return Vec::new();
		};
		entry.current = Some(requester);

		let fp = match key {
			ComputeKey::Tile(coord) => self.spec.computation_tiles.get(coord).clone(),
			ComputeKey::AdHoc(query, prod_id) => {
				let Some(plan) = self.plans.get(&query) else {
					// cancelled between queueing and pumping
					self.entries.entry(key).or_default().current = None;
					return Vec::new();
				};
				plan.prods[prod_id]
					.sample_fp
					.clone()
					.expect("ad-hoc computes imply a sample footprint")
			}
		};
		self.batch_counter += 1;
		let query = match requester {
			Requester::Query { query, .. } => Some(query),
			Requester::Cache => None,
		};
		vec![Msg::new(
			Address::Collector(self.spec.uid),
			Verb::Collect {
				batch_id: self.batch_counter,
				items: vec![(key, fp)],
				priority,
				query,
			},
		)]
	}

	fn receive_compute_done(&mut self, key: ComputeKey, fp: &Footprint, array: Array3<f64>) -> Vec<Msg> {
		let entry = self.entries.entry(key).or_default();
		let current = entry.current.take();
		let mut msgs = match current {
			Some(Requester::Cache) => {
				self.cache_requested.remove(&key);
				let tiles = self.cache_waiters.remove(&key).unwrap_or_default();
				let mut msgs = Vec::with_capacity(tiles.len());
				for tile in tiles {
					msgs.push(Msg::new(
						Address::Merger(self.spec.uid),
						Verb::PieceReady {
							tile,
							fp: fp.clone(),
							array: array.clone(),
						},
					));
				}
				msgs
			}
			Some(Requester::Query { query, prod_id }) => vec![Msg::new(
				Address::Producer(self.spec.uid),
				Verb::DoneOneCompute {
					query,
					prod_id,
					fp: fp.clone(),
					array,
				},
			)],
			None => Vec::new(), // cancelled mid-flight; discard
		};
		msgs.extend(self.pump(key));
		msgs
	}

	/// A waiting compute of ours was purged from its pool; free the slot.
	fn receive_compute_purged(&mut self, key: ComputeKey) -> Vec<Msg> {
		if let Some(entry) = self.entries.get_mut(&key) {
			if let Some(Requester::Cache) = entry.current {
				self.cache_requested.remove(&key);
			}
			entry.current = None;
		}
		self.pump(key)
	}

	/// A cache tile lost its last interested query before reaching the
	/// writer; withdraw its computes where still possible.
	fn receive_abandon_cache_tile(&mut self, tile: TileCoord2) -> Vec<Msg> {
		let mut purge = Vec::new();
		self.cache_waiters.retain(|&key, tiles| {
			tiles.retain(|&t| t != tile);
			if tiles.is_empty() {
				purge.push(key);
				false
			} else {
				true
			}
		});
		let mut msgs = Vec::new();
		for key in purge {
			self.cache_requested.remove(&key);
			// drop the queued (not yet running) cache request, if any
			if let Some(entry) = self.entries.get_mut(&key) {
				entry.queue.retain(|(r, _)| *r != Requester::Cache);
			}
			// and the compute job possibly parked in the pool's waiting room
			msgs.push(Msg::new(
				Address::Pool(self.spec.computation_pool.key),
				Verb::PurgeComputeKeys { keys: vec![key] },
			));
		}
		msgs
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.plans.remove(&query);
		let mut to_pump = Vec::new();
		for (key, entry) in &mut self.entries {
			entry
				.queue
				.retain(|(r, _)| !matches!(r, Requester::Query { query: q, .. } if *q == query));
			if let Some(Requester::Query { query: q, .. }) = entry.current {
				if q == query {
					// keep the slot occupied so at-most-one holds; the result
					// is dropped on arrival because the query is gone
					entry.current = Some(Requester::Query {
						query,
						prod_id: usize::MAX,
					});
				}
			}
			if entry.current.is_none() && !entry.queue.is_empty() {
				to_pump.push(*key);
			}
		}
		let mut msgs = Vec::new();
		for key in to_pump {
			msgs.extend(self.pump(key));
		}
		msgs
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::observers::DebugManager;
	use crate::raster::{PoolBinding, PoolKind, TileGrid};
	use rasterloom_core::{BoundaryEffect, ChannelsSchema, PixelDtype};
	use uuid::Uuid;

	fn spec() -> Arc<RasterSpec> {
		let fp = Footprint::new((0.0, 40.0), (1.0, -1.0), (40, 40)).unwrap();
		let tiles = TileGrid::new(fp.tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap()).unwrap();
		let pool = |key: u64| PoolBinding {
			key,
			name: format!("p{key}"),
			kind: PoolKind::Inline,
		};
		Arc::new(RasterSpec {
			uid: Uuid::new_v4(),
			fp: fp.clone(),
			dtype: PixelDtype::F64,
			channel_count: 1,
			schema: ChannelsSchema::default_for(1),
			wkt: None,
			compute: Arc::new(|_, _| Ok(Array3::zeros((1, 1, 1)))),
			merge: None,
			primitives: vec![],
			computation_tiles: tiles.clone(),
			cache: Some(crate::raster::CacheConfig {
				dir: std::path::PathBuf::from("/tmp/unused"),
				tiles,
				io_pool: pool(3),
			}),
			computation_pool: pool(0),
			merge_pool: pool(1),
			resample_pool: pool(2),
			max_resampling_size: None,
			automatic_remapping: true,
			allow_interpolation: true,
			debug: DebugManager::default(),
		})
	}

	#[test]
	fn cache_runs_deduplicate_per_computation_tile() {
		let spec = spec();
		let mut gate = ComputationGate::new(spec.clone());
		let prio = JobPriority::new(QueryId(1), 0);
		// first production wave of cache tile (0, 0)
		let msgs_a = gate.receive_produce_cache_tile(TileCoord2 { y: 0, x: 0 }, prio).unwrap();
		// tile (0,0): ExpectCacheTile + one Collect
		assert_eq!(msgs_a.len(), 2);
		assert!(matches!(msgs_a[1].verb, Verb::Collect { .. }));

		// same cache tile requested again (second query wave): no new compute
		let msgs_b = gate.receive_produce_cache_tile(TileCoord2 { y: 0, x: 0 }, prio).unwrap();
		assert_eq!(msgs_b.len(), 1); // only the ExpectCacheTile registration
		assert!(matches!(msgs_b[0].verb, Verb::ExpectCacheTile { .. }));

		// compute completes: both waiters of (0,0) get their piece
		let fp = spec.computation_tiles.get(TileCoord2 { y: 0, x: 0 }).clone();
		let done = gate.receive_compute_done(ComputeKey::Tile(TileCoord2 { y: 0, x: 0 }), &fp, Array3::zeros((20, 20, 1)));
		let pieces = done
			.iter()
			.filter(|m| matches!(m.verb, Verb::PieceReady { .. }))
			.count();
		assert_eq!(pieces, 2);
	}

	fn uncached_spec() -> Arc<RasterSpec> {
		let base = spec();
		let fp = base.fp.clone();
		let tiles = TileGrid::new(fp.tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap()).unwrap();
		Arc::new(RasterSpec {
			uid: base.uid,
			fp,
			dtype: base.dtype,
			channel_count: 1,
			schema: base.schema.clone(),
			wkt: None,
			compute: base.compute.clone(),
			merge: None,
			primitives: vec![],
			computation_tiles: tiles,
			cache: None,
			computation_pool: base.computation_pool.clone(),
			merge_pool: base.merge_pool.clone(),
			resample_pool: base.resample_pool.clone(),
			max_resampling_size: None,
			automatic_remapping: true,
			allow_interpolation: true,
			debug: DebugManager::default(),
		})
	}

	#[test]
	fn query_runs_serialize_per_tile() {
		let spec = uncached_spec();
		let mut gate = ComputationGate::new(spec.clone());
		// both queries want the same 10x10 region inside tile (0, 0)
		let probe = Footprint::new((0.0, 40.0), (1.0, -1.0), (10, 10)).unwrap();
		for q in [1, 2] {
			let plan = Arc::new(
				QueryPlan::build(&spec, &[probe.clone()], vec![0], None, rasterloom_core::Interpolation::Area, 1)
					.unwrap(),
			);
			gate.plans.insert(QueryId(q), plan);
		}
		let msgs1 = gate.receive_compute_needed(QueryId(1), 0);
		assert_eq!(msgs1.len(), 1, "first request starts at once");
		let msgs2 = gate.receive_compute_needed(QueryId(2), 0);
		assert!(msgs2.is_empty(), "second request queues behind the first");

		let coord = TileCoord2 { y: 0, x: 0 };
		let fp = spec.computation_tiles.get(coord).clone();
		let done = gate.receive_compute_done(ComputeKey::Tile(coord), &fp, Array3::zeros((20, 20, 1)));
		// the first query gets its piece, the second's run starts
		assert!(matches!(done[0].verb, Verb::DoneOneCompute { query: QueryId(1), .. }));
		assert!(matches!(done[1].verb, Verb::Collect { .. }));
	}

	#[test]
	fn cancelled_queued_requests_disappear() {
		let spec = uncached_spec();
		let mut gate = ComputationGate::new(spec.clone());
		let probe = Footprint::new((0.0, 40.0), (1.0, -1.0), (10, 10)).unwrap();
		for q in [1, 2] {
			let plan = Arc::new(
				QueryPlan::build(&spec, &[probe.clone()], vec![0], None, rasterloom_core::Interpolation::Area, 1)
					.unwrap(),
			);
			gate.plans.insert(QueryId(q), plan);
		}
		gate.receive_compute_needed(QueryId(1), 0);
		gate.receive_compute_needed(QueryId(2), 0);
		gate.receive_cancel_query(QueryId(2));

		let coord = TileCoord2 { y: 0, x: 0 };
		let fp = spec.computation_tiles.get(coord).clone();
		let done = gate.receive_compute_done(ComputeKey::Tile(coord), &fp, Array3::zeros((20, 20, 1)));
		// only query 1's delivery; nothing left to pump
		assert_eq!(done.len(), 1);
		assert!(matches!(done[0].verb, Verb::DoneOneCompute { query: QueryId(1), .. }));
	}
}
