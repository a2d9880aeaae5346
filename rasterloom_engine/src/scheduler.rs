//! The scheduler: one thread per Dataset owning every actor and the bus.
//!
//! The loop is single-threaded cooperative: drain the inbox, dispatch until
//! the local pass is empty, give every actor a spontaneous-progress tick,
//! then park on the inbox with a deadline. External threads (user calls,
//! pool workers) only ever `put_message`.

use crate::actors::RasterActors;
use crate::bus::{Address, Msg, Verb};
use crate::driver::pool::HandlePool;
use crate::observers::{DebugManager, QueryId};
use crate::pool_adapter::{PoolAdapter, TaskCtx};
use crate::query::{OutputQueue, QueueReceiver};
use crate::raster::{PoolBinding, RasterSpec};
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use rasterloom_core::errors::Error;
use rasterloom_core::{Footprint, Interpolation};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

/// How long the scheduler parks on an empty inbox before re-polling
/// liveness and back-pressure.
const PARK_DISTANCE: Duration = Duration::from_millis(20);

/// Patience for lifecycle acknowledgements (kill, stop).
const ACK_PATIENCE: Duration = Duration::from_secs(60);

struct EngineShared {
	tx: Sender<Msg>,
	alive: Arc<AtomicBool>,
	query_counter: AtomicU64,
	handle_pool: Arc<HandlePool>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running scheduler. Clonable; the thread stops when `stop` is
/// called (or on drop of the last clone).
#[derive(Clone)]
pub struct Engine {
	shared: Arc<EngineShared>,
}

impl Engine {
	/// Spawn the scheduler thread.
	pub fn start(handle_pool: Arc<HandlePool>, debug: DebugManager) -> Engine {
		let (tx, rx) = crossbeam_channel::unbounded();
		let alive = Arc::new(AtomicBool::new(true));
		let scheduler = Scheduler {
			rx,
			tx: tx.clone(),
			alive: alive.clone(),
			handle_pool: handle_pool.clone(),
			debug,
			rasters: HashMap::new(),
			pools: HashMap::new(),
			accepting: true,
			stop_ack: None,
		};
		let thread = std::thread::Builder::new()
			.name("rasterloom-scheduler".to_string())
			.spawn(move || scheduler.run())
			.expect("spawning the scheduler thread");
		Engine {
			shared: Arc::new(EngineShared {
				tx,
				alive,
				query_counter: AtomicU64::new(1),
				handle_pool,
				thread: Mutex::new(Some(thread)),
			}),
		}
	}

	pub fn handle_pool(&self) -> &Arc<HandlePool> {
		&self.shared.handle_pool
	}

	pub fn is_alive(&self) -> bool {
		self.shared.alive.load(Ordering::Acquire)
	}

	/// Fail fast when the scheduler died.
	pub fn ensure_alive(&self) -> Result<()> {
		if self.is_alive() {
			Ok(())
		} else {
			Err(Error::SchedulerDead("the dataset's scheduler is not running".to_string()).into())
		}
	}

	pub fn put_message(&self, msg: Msg) -> Result<()> {
		self.ensure_alive()?;
		self
			.shared
			.tx
			.send(msg)
			.map_err(|_| Error::SchedulerDead("the scheduler inbox is closed".to_string()).into())
	}

	/// Register a scheduled raster.
	pub fn new_raster(&self, spec: Arc<RasterSpec>) -> Result<()> {
		self.put_message(Msg::new(Address::TopLevel, Verb::NewRaster { spec }))
	}

	/// Queue footprints on a scheduled raster; arrays arrive on the returned
	/// receiver in input order.
	pub fn queue_data(
		&self,
		uid: Uuid,
		fps: Vec<Footprint>,
		channels: Vec<usize>,
		dst_nodata: Option<f64>,
		interpolation: Interpolation,
		max_queue_size: usize,
	) -> Result<QueueReceiver> {
		self.ensure_alive()?;
		let query = QueryId(self.shared.query_counter.fetch_add(1, Ordering::Relaxed));
		let (queue, receiver) = OutputQueue::new(max_queue_size.max(1), fps.len(), self.shared.alive.clone());
		self.put_message(Msg::new(
			Address::QueriesHandler(uid),
			Verb::NewQuery {
				query,
				queue,
				fps,
				channels,
				dst_nodata,
				interpolation,
				max_queue_size: max_queue_size.max(1),
			},
		))?;
		Ok(receiver)
	}

	/// Tear one raster down, synchronously.
	pub fn kill_raster(&self, uid: Uuid) -> Result<()> {
		let (ack, done) = crossbeam_channel::bounded(1);
		self.put_message(Msg::new(Address::TopLevel, Verb::KillRaster { uid, ack }))?;
		done
			.recv_timeout(ACK_PATIENCE)
			.map_err(|_| Error::SchedulerDead("no acknowledgement from the scheduler".to_string()))?;
		Ok(())
	}

	/// Two-phase shutdown: refuse new queries, drain pending cache writes,
	/// kill the rasters, join the thread. Idempotent.
	pub fn stop(&self) -> Result<()> {
		if self.is_alive() {
			let (ack, done) = crossbeam_channel::bounded(1);
			if self
				.shared
				.tx
				.send(Msg::new(Address::TopLevel, Verb::StopScheduler { ack }))
				.is_ok()
			{
				let _ = done.recv_timeout(ACK_PATIENCE);
			}
		}
		self.shared.alive.store(false, Ordering::Release);
		if let Some(thread) = self.shared.thread.lock().take() {
			thread.join().ok();
		}
		Ok(())
	}
}

struct Scheduler {
	rx: Receiver<Msg>,
	/// Cloned into pool adapters so workers can post completions.
	tx: Sender<Msg>,
	alive: Arc<AtomicBool>,
	handle_pool: Arc<HandlePool>,
	debug: DebugManager,
	rasters: HashMap<Uuid, RasterActors>,
	pools: HashMap<u64, PoolAdapter>,
	accepting: bool,
	stop_ack: Option<Sender<()>>,
}

impl Scheduler {
	fn run(mut self) {
		log::debug!("scheduler up");
		let mut local: VecDeque<Msg> = VecDeque::new();
		loop {
			// 1. drain the external inbox
			loop {
				match self.rx.try_recv() {
					Ok(msg) => local.push_back(msg),
					Err(TryRecvError::Empty) => break,
					Err(TryRecvError::Disconnected) => return,
				}
			}

			// 2. process the local pass to exhaustion
			while let Some(msg) = local.pop_front() {
				match self.dispatch(msg) {
					Ok(msgs) => local.extend(msgs),
					Err(err) => {
						self.die(&err);
						return;
					}
				}
			}

			// 3. spontaneous progress: pools first (free slots), then actors
			let mut progressed = false;
			for adapter in self.pools.values_mut() {
				let msgs = adapter.receive_nothing();
				progressed |= !msgs.is_empty();
				local.extend(msgs);
			}
			let uids: Vec<Uuid> = self.rasters.keys().copied().collect();
			for uid in uids {
				let result = self.rasters.get_mut(&uid).expect("listed above").receive_nothing();
				match result {
					Ok(msgs) => {
						progressed |= !msgs.is_empty();
						local.extend(msgs);
					}
					Err(err) => {
						self.die(&err);
						return;
					}
				}
			}
			if progressed {
				continue;
			}

			// 4. a requested stop completes once everything drained
			if self.stop_ack.is_some() && self.drained() {
				let uids: Vec<Uuid> = self.rasters.keys().copied().collect();
				for uid in uids {
					local.extend(self.kill_raster(uid, None));
				}
				while let Some(msg) = local.pop_front() {
					match self.dispatch(msg) {
						Ok(msgs) => local.extend(msgs),
						Err(err) => {
							self.die(&err);
							return;
						}
					}
				}
				self.alive.store(false, Ordering::Release);
				if let Some(ack) = self.stop_ack.take() {
					ack.send(()).ok();
				}
				log::debug!("scheduler down");
				return;
			}

			// 5. park until the next external event or the poll deadline
			match self.rx.recv_timeout(PARK_DISTANCE) {
				Ok(msg) => local.push_back(msg),
				Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
				Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
			}
		}
	}

	fn drained(&self) -> bool {
		self.pools.values().all(|p| p.is_idle())
			&& self
				.rasters
				.values()
				.all(|r| r.spec.cache.is_none() || !r.cache_supervisor.has_pending_writes())
	}

	fn dispatch(&mut self, msg: Msg) -> Result<Vec<Msg>> {
		let Msg { dest, verb } = msg;
		match dest {
			Address::TopLevel => self.dispatch_top_level(verb),
			Address::Pool(key) => {
				let Some(adapter) = self.pools.get_mut(&key) else {
					log::debug!("message for unknown pool {key}, dropping");
					return Ok(Vec::new());
				};
				Ok(match verb {
					Verb::Enqueue { priority, query, task } => adapter.receive_enqueue(priority, query, task),
					Verb::JobDone { reply } => adapter.receive_job_done(reply),
					Verb::CancelQuery { query } => adapter.receive_cancel_query(query),
					Verb::PurgeComputeKeys { keys } => adapter.receive_purge_compute_keys(&keys),
					other => anyhow::bail!("pool adapter received an unexpected verb: {other:?}"),
				})
			}
			_ => {
				let Some(uid) = dest.raster() else {
					unreachable!("non-raster addresses handled above")
				};
				// refuse queries while closing
				if let Verb::NewQuery { queue, .. } = &verb {
					if !self.accepting {
						if let Some(queue) = queue.upgrade() {
							queue.poison(Error::SchedulerDead("the dataset is closing".to_string()));
						}
						return Ok(Vec::new());
					}
				}
				let Some(raster) = self.rasters.get_mut(&uid) else {
					log::debug!("message for unknown raster {uid}, dropping");
					return Ok(Vec::new());
				};
				raster.dispatch(dest, verb)
			}
		}
	}

	fn dispatch_top_level(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::NewRaster { spec } => {
				if !self.accepting {
					log::warn!("raster registration while closing, ignoring");
					return Ok(Vec::new());
				}
				self.register_pools(&spec);
				self.debug.object_allocated("raster");
				self
					.rasters
					.insert(spec.uid, RasterActors::new(spec, self.handle_pool.clone()));
				Ok(Vec::new())
			}
			Verb::KillRaster { uid, ack } => Ok(self.kill_raster(uid, Some(ack))),
			Verb::StopScheduler { ack } => {
				log::debug!("scheduler stopping: refusing new queries, draining writes");
				self.accepting = false;
				self.stop_ack = Some(ack);
				// cancel live queries so reads and resamples drain quickly;
				// cache production keeps running to durability
				let mut msgs = Vec::new();
				for raster in self.rasters.values_mut() {
					for queue in raster.queries_handler.live_queues() {
						queue.poison(Error::SchedulerDead("the dataset is closing".to_string()));
					}
				}
				// the weak refs stay alive until users drop their receivers;
				// sweep the queries explicitly instead of waiting for that
				let pairs: Vec<(Uuid, Vec<QueryId>)> = self
					.rasters
					.iter()
					.map(|(uid, r)| (*uid, r.queries_handler.query_ids()))
					.collect();
				for (uid, queries) in pairs {
					for query in queries {
						msgs.push(Msg::new(Address::QueriesHandler(uid), Verb::CancelQuery { query }));
						if let Some(raster) = self.rasters.get_mut(&uid) {
							msgs.extend(raster.cancel_everywhere(query));
						}
						for key in self.pools.keys() {
							msgs.push(Msg::new(Address::Pool(*key), Verb::CancelQuery { query }));
						}
					}
				}
				Ok(msgs)
			}
			other => anyhow::bail!("TopLevel received an unexpected verb: {other:?}"),
		}
	}

	fn register_pools(&mut self, spec: &RasterSpec) {
		let mut bindings: Vec<&PoolBinding> = vec![&spec.computation_pool, &spec.merge_pool, &spec.resample_pool];
		if let Some(cache) = &spec.cache {
			bindings.push(&cache.io_pool);
		}
		for binding in bindings {
			self.pools.entry(binding.key).or_insert_with(|| {
				PoolAdapter::new(
					binding.key,
					binding.name.clone(),
					binding.kind.clone(),
					TaskCtx {
						handle_pool: self.handle_pool.clone(),
					},
					self.tx.clone(),
					self.debug.clone(),
				)
			});
		}
	}

	fn kill_raster(&mut self, uid: Uuid, ack: Option<Sender<()>>) -> Vec<Msg> {
		let mut msgs = Vec::new();
		if let Some(mut raster) = self.rasters.remove(&uid) {
			for queue in raster.queries_handler.live_queues() {
				queue.poison(Error::SchedulerDead("the raster was closed".to_string()));
			}
			for query in raster.queries_handler.query_ids() {
				msgs.extend(raster.cancel_everywhere(query));
				for key in self.pools.keys() {
					msgs.push(Msg::new(Address::Pool(*key), Verb::CancelQuery { query }));
				}
			}
			// release this raster's idle driver handles
			for file_uid in raster.cache_supervisor.file_uids() {
				if let Err(err) = self.handle_pool.deactivate(file_uid) {
					log::debug!("handle still in use while killing raster {uid}: {err:#}");
				}
			}
		}
		if let Some(ack) = ack {
			ack.send(()).ok();
		}
		msgs
	}

	/// Fatal error: surface it through every live output queue and die.
	fn die(&mut self, err: &anyhow::Error) {
		log::error!("scheduler crashed: {err:#}");
		let kind = Error::of(err)
			.cloned()
			.unwrap_or_else(|| Error::SchedulerDead(format!("{err:#}")));
		for raster in self.rasters.values() {
			for queue in raster.queries_handler.live_queues() {
				queue.poison(kind.clone());
			}
		}
		self.alive.store(false, Ordering::Release);
		self.debug.scheduler_crashed(&format!("{err:#}"));
		if let Some(ack) = self.stop_ack.take() {
			ack.send(()).ok();
		}
	}
}
