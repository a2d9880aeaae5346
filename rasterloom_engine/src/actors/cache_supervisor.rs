//! The cache-tile state machine.
//!
//! Per tile:
//!
//! ```text
//! Unknown -> Checking -> Ready
//!                     -> Absent/Producing -> Writing -> Ready
//! Ready -> MissingAfterCorruption -> Producing -> ... -> Ready
//! ```
//!
//! Concurrent productions needing the same absent tile share one
//! compute+write (deduplication); every waiting read is replayed when the
//! tile becomes ready.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, Verb};
use crate::cache;
use crate::driver::pool::HandlePool;
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::raster::{CacheConfig, RasterSpec, TileCoord2};
use anyhow::Result;
use rasterloom_core::errors::Error;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// One read waiting for a tile: `(query, production)`.
type Waiter = (QueryId, usize);

enum TileState {
	/// Checksum validation in flight.
	Checking { path: PathBuf, waiting: Vec<Waiter> },
	/// No file; compute+merge pipeline running.
	Producing { waiting: Vec<Waiter> },
	/// Produced bytes travelling through the Writer.
	Writing { waiting: Vec<Waiter> },
	/// One validated file on disk.
	Ready { path: PathBuf, file_uid: Uuid },
	/// A reader hit a bad file mid-session; recomputation running.
	MissingAfterCorruption { waiting: Vec<Waiter> },
}

pub struct CacheSupervisor {
	spec: Arc<RasterSpec>,
	handle_pool: Arc<HandlePool>,
	plans: HashMap<QueryId, Arc<QueryPlan>>,
	states: HashMap<TileCoord2, TileState>,
	/// Queries that still want each not-yet-ready tile; when a tile loses
	/// its last interested query while merely producing, production is
	/// abandoned.
	interest: HashMap<TileCoord2, std::collections::HashSet<QueryId>>,
	/// Lazily scanned directory content: tile key -> (path, expected hex).
	discovered: Option<HashMap<String, (PathBuf, String)>>,
	write_retries: HashMap<TileCoord2, usize>,
}

const MAX_WRITE_RETRIES: usize = 2;

impl CacheSupervisor {
	pub fn new(spec: Arc<RasterSpec>, handle_pool: Arc<HandlePool>) -> CacheSupervisor {
		CacheSupervisor {
			spec,
			handle_pool,
			plans: HashMap::new(),
			states: HashMap::new(),
			interest: HashMap::new(),
			discovered: None,
			write_retries: HashMap::new(),
		}
	}

	fn cache(&self) -> &CacheConfig {
		self.spec.cache.as_ref().expect("supervisor exists only for cached rasters")
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::RegisterQuery { query, plan, .. } => self.receive_register_query(query, plan),
			Verb::ProdNeedsTiles { query, prod_id } => self.receive_prod_needs_tiles(query, prod_id),
			Verb::CheckResult { tile, path, ok } => Ok(self.receive_check_result(tile, &path, ok)),
			Verb::WriteStarted { tile } => {
				if let Some(state) = self.states.get_mut(&tile) {
					if let TileState::Producing { waiting } = state {
						*state = TileState::Writing {
							waiting: std::mem::take(waiting),
						};
					}
				}
				Ok(Vec::new())
			}
			Verb::WriteDone { tile, path } => Ok(self.receive_write_done(tile, path)),
			Verb::WriteFailed { tile, error } => self.receive_write_failed(tile, &error),
			Verb::ReadCorruption { tile, query, prod_id } => Ok(self.receive_read_corruption(tile, query, prod_id)),
			Verb::CancelQuery { query } => Ok(self.receive_cancel_query(query)),
			other => unexpected_verb!("CacheSupervisor", other),
		}
	}

	/// Start producing every cache tile the query will need, earliest-needed
	/// first. Reads are not scheduled here; they follow the producer's
	/// back-pressure window. This is what lets the cache warm up while the
	/// consumer is still slow.
	fn receive_register_query(&mut self, query: QueryId, plan: Arc<QueryPlan>) -> Result<Vec<Msg>> {
		let mut msgs = Vec::new();
		let tiles: Vec<(TileCoord2, JobPriority)> = plan
			.cache_list
			.iter()
			.map(|&tile| {
				(
					tile,
					JobPriority::new(query, plan.priority_of_tile(tile)),
				)
			})
			.collect();
		self.plans.insert(query, plan);
		for (tile, priority) in tiles {
			self.interest.entry(tile).or_default().insert(query);
			msgs.extend(self.ensure_cached(tile, priority)?);
		}
		Ok(msgs)
	}

	/// Drive a tile toward `Ready` without registering a read.
	fn ensure_cached(&mut self, tile: TileCoord2, priority: JobPriority) -> Result<Vec<Msg>> {
		if self.states.contains_key(&tile) {
			return Ok(Vec::new()); // already ready or on its way
		}
		if self.discovered.is_none() {
			self.discovered = Some(cache::scan_cache_dir(&self.cache().dir)?);
		}
		let key = cache::tile_key(self.cache().tiles.get(tile));
		let adopted = self.discovered.as_ref().and_then(|d| d.get(&key).cloned());
		match adopted {
			Some((path, expected_hex)) => {
				self.states.insert(
					tile,
					TileState::Checking {
						path: path.clone(),
						waiting: Vec::new(),
					},
				);
				Ok(vec![Msg::new(
					Address::Reader(self.spec.uid),
					Verb::CheckTile {
						tile,
						path,
						expected_hex,
						priority,
					},
				)])
			}
			None => Ok(self.start_production(tile, Vec::new(), priority)),
		}
	}

	fn receive_prod_needs_tiles(&mut self, query: QueryId, prod_id: usize) -> Result<Vec<Msg>> {
		let Some(plan) = self.plans.get(&query) else {
			return Ok(Vec::new());
		};
		let tiles = plan.prods[prod_id].cache_tiles.clone();
		let priority = JobPriority::new(query, prod_id);
		let mut msgs = Vec::new();
		for tile in tiles {
			msgs.extend(self.need(tile, (query, prod_id), priority)?);
		}
		Ok(msgs)
	}

	/// One production needs one tile; resolve its state.
	fn need(&mut self, tile: TileCoord2, waiter: Waiter, priority: JobPriority) -> Result<Vec<Msg>> {
		let uid = self.spec.uid;
		match self.states.get_mut(&tile) {
			Some(TileState::Ready { path, file_uid }) => Ok(vec![schedule_read(uid, waiter, tile, path.clone(), *file_uid)]),
			Some(
				TileState::Checking { waiting, .. }
				| TileState::Producing { waiting }
				| TileState::Writing { waiting }
				| TileState::MissingAfterCorruption { waiting },
			) => {
				waiting.push(waiter);
				Ok(Vec::new())
			}
			None => {
				// first contact with this tile: probe the directory
				if self.discovered.is_none() {
					self.discovered = Some(cache::scan_cache_dir(&self.cache().dir)?);
				}
				let key = cache::tile_key(self.cache().tiles.get(tile));
				let adopted = self.discovered.as_ref().and_then(|d| d.get(&key).cloned());
				match adopted {
					Some((path, expected_hex)) => {
						self.states.insert(
							tile,
							TileState::Checking {
								path: path.clone(),
								waiting: vec![waiter],
							},
						);
						Ok(vec![Msg::new(
							Address::Reader(uid),
							Verb::CheckTile {
								tile,
								path,
								expected_hex,
								priority,
							},
						)])
					}
					None => Ok(self.start_production(tile, vec![waiter], priority)),
				}
			}
		}
	}

	/// Kick the compute+merge+write pipeline for an absent tile.
	fn start_production(&mut self, tile: TileCoord2, waiting: Vec<Waiter>, priority: JobPriority) -> Vec<Msg> {
		self.states.insert(tile, TileState::Producing { waiting });
		vec![Msg::new(
			Address::ComputationGate(self.spec.uid),
			Verb::ProduceCacheTile { tile, priority },
		)]
	}

	fn receive_check_result(&mut self, tile: TileCoord2, path: &std::path::Path, ok: bool) -> Vec<Msg> {
		let Some(TileState::Checking { waiting, .. }) = self.states.remove(&tile) else {
			return Vec::new(); // stale result
		};
		if ok {
			self.to_ready(tile, path.to_path_buf(), waiting)
		} else {
			log::warn!("cache tile {tile} failed its checksum, recomputing ('{}')", path.display());
			self.spec.debug.cache_tile_corrupted(self.spec.uid, path);
			cache::delete_tile_file(path);
			let priority = waiting
				.first()
				.map_or(JobPriority::new(QueryId(0), 0), |&(q, p)| JobPriority::new(q, p));
			self.start_production(tile, waiting, priority)
		}
	}

	fn receive_write_done(&mut self, tile: TileCoord2, path: PathBuf) -> Vec<Msg> {
		let waiting = match self.states.remove(&tile) {
			Some(
				TileState::Producing { waiting }
				| TileState::Writing { waiting }
				| TileState::MissingAfterCorruption { waiting },
			) => waiting,
			other => {
				if let Some(state) = other {
					self.states.insert(tile, state);
				}
				return Vec::new();
			}
		};
		self.write_retries.remove(&tile);
		self.to_ready(tile, path, waiting)
	}

	fn receive_write_failed(&mut self, tile: TileCoord2, error: &str) -> Result<Vec<Msg>> {
		let waiting = match self.states.remove(&tile) {
			Some(
				TileState::Producing { waiting }
				| TileState::Writing { waiting }
				| TileState::MissingAfterCorruption { waiting },
			) => waiting,
			_ => return Ok(Vec::new()),
		};
		let retries = self.write_retries.entry(tile).or_insert(0);
		*retries += 1;
		if *retries > MAX_WRITE_RETRIES {
			return Err(Error::ComputeFailed(format!(
				"writing cache tile {tile} keeps failing: {error}"
			))
			.into());
		}
		log::warn!("cache tile {tile} write failed (attempt {retries}), recomputing: {error}");
		let priority = waiting
			.first()
			.map_or(JobPriority::new(QueryId(0), 0), |&(q, p)| JobPriority::new(q, p));
		Ok(self.start_production(tile, waiting, priority))
	}

	fn receive_read_corruption(&mut self, tile: TileCoord2, query: QueryId, prod_id: usize) -> Vec<Msg> {
		match self.states.remove(&tile) {
			Some(TileState::Ready { path, file_uid }) => {
				self.spec.debug.cache_tile_corrupted(self.spec.uid, &path);
				cache::delete_tile_file(&path);
				// stale idle handles point at the removed file
				if let Err(err) = self.handle_pool.deactivate(file_uid) {
					log::debug!("deferred handle cleanup for tile {tile}: {err:#}");
				}
				self.states.insert(
					tile,
					TileState::MissingAfterCorruption {
						waiting: vec![(query, prod_id)],
					},
				);
				vec![Msg::new(
					Address::ComputationGate(self.spec.uid),
					Verb::ProduceCacheTile {
						tile,
						priority: JobPriority::new(query, prod_id),
					},
				)]
			}
			Some(mut state) => {
				// someone else already noticed; just queue the replay
				if let TileState::Checking { waiting, .. }
				| TileState::Producing { waiting }
				| TileState::Writing { waiting }
				| TileState::MissingAfterCorruption { waiting } = &mut state
				{
					waiting.push((query, prod_id));
				}
				self.states.insert(tile, state);
				Vec::new()
			}
			None => Vec::new(),
		}
	}

	fn to_ready(&mut self, tile: TileCoord2, path: PathBuf, waiting: Vec<Waiter>) -> Vec<Msg> {
		self.spec.debug.cache_tile_ready(self.spec.uid, &path);
		self.interest.remove(&tile);
		let file_uid = Uuid::new_v4();
		let msgs = waiting
			.into_iter()
			.filter(|(query, _)| self.plans.contains_key(query))
			.map(|waiter| schedule_read(self.spec.uid, waiter, tile, path.clone(), file_uid))
			.collect();
		self.states.insert(tile, TileState::Ready { path, file_uid });
		msgs
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.plans.remove(&query);
		for state in self.states.values_mut() {
			if let TileState::Checking { waiting, .. }
			| TileState::Producing { waiting }
			| TileState::Writing { waiting }
			| TileState::MissingAfterCorruption { waiting } = state
			{
				waiting.retain(|(q, _)| *q != query);
			}
		}
		// abandon productions nobody wants anymore; tiles that reached the
		// writer complete anyway (durability is cheap at that point)
		let mut abandoned = Vec::new();
		let states = &self.states;
		self.interest.retain(|&tile, queries| {
			queries.remove(&query);
			if !queries.is_empty() {
				return true;
			}
			match states.get(&tile) {
				Some(TileState::Producing { waiting }) if waiting.is_empty() => {
					abandoned.push(tile);
					false
				}
				_ => true,
			}
		});
		let mut msgs = Vec::new();
		for tile in abandoned {
			log::debug!("abandoning cache tile {tile}: no interested query left");
			self.states.remove(&tile);
			self.write_retries.remove(&tile);
			msgs.push(Msg::new(
				Address::ComputationGate(self.spec.uid),
				Verb::AbandonCacheTile { tile },
			));
			msgs.push(Msg::new(Address::Merger(self.spec.uid), Verb::AbandonCacheTile { tile }));
		}
		msgs
	}

	/// Driver-handle keys of every ready tile file (teardown releases them).
	pub fn file_uids(&self) -> Vec<Uuid> {
		self
			.states
			.values()
			.filter_map(|s| match s {
				TileState::Ready { file_uid, .. } => Some(*file_uid),
				_ => None,
			})
			.collect()
	}

	/// Any tile still being produced or written? (Shutdown drains these.)
	pub fn has_pending_writes(&self) -> bool {
		self.states.values().any(|s| {
			matches!(
				s,
				TileState::Producing { .. } | TileState::Writing { .. } | TileState::MissingAfterCorruption { .. }
			)
		})
	}
}

fn schedule_read(uid: Uuid, (query, prod_id): Waiter, tile: TileCoord2, path: PathBuf, file_uid: Uuid) -> Msg {
	Msg::new(
		Address::CacheExtractor(uid),
		Verb::ScheduleRead {
			query,
			prod_id,
			tile,
			path,
			file_uid,
		},
	)
}
