//! The pool-offload adapter: a waiting room in front of each worker pool.
//!
//! Tasks are not submitted to the pool right away; they wait in a priority
//! queue and are released one per free worker slot. Completions come back as
//! messages through the scheduler inbox, so all actor state stays on the
//! scheduler thread.

use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::cache;
use crate::driver::pool::HandlePool;
use crate::driver::{Driver, GridDriver};
use crate::observers::{DebugManager, QueryId};
use crate::raster::{PoolKind, default_merge};
use ndarray::s;
use rasterloom_remap::{RemapParams, remap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Context a task needs at run time.
#[derive(Clone)]
pub struct TaskCtx {
	pub handle_pool: Arc<HandlePool>,
}

struct WaitingJob {
	priority: JobPriority,
	query: Option<QueryId>,
	task: Box<PoolTask>,
}

/// One registered pool and its waiting room.
pub struct PoolAdapter {
	key: u64,
	name: String,
	kind: PoolKind,
	slots: usize,
	in_flight: usize,
	waiting: Vec<WaitingJob>,
	ctx: TaskCtx,
	inbox: crossbeam_channel::Sender<Msg>,
	debug: DebugManager,
}

impl PoolAdapter {
	pub fn new(
		key: u64,
		name: String,
		kind: PoolKind,
		ctx: TaskCtx,
		inbox: crossbeam_channel::Sender<Msg>,
		debug: DebugManager,
	) -> PoolAdapter {
		let slots = kind.slots();
		PoolAdapter {
			key,
			name,
			kind,
			slots,
			in_flight: 0,
			waiting: Vec::new(),
			ctx,
			inbox,
			debug,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Nothing waiting, nothing running.
	pub fn is_idle(&self) -> bool {
		self.waiting.is_empty() && self.in_flight == 0
	}

	pub fn receive_enqueue(&mut self, priority: JobPriority, query: Option<QueryId>, task: Box<PoolTask>) -> Vec<Msg> {
		self.debug.pool_job_enqueued(&self.name, task.kind());
		self.waiting.push(WaitingJob { priority, query, task });
		self.pump()
	}

	pub fn receive_job_done(&mut self, reply: Box<Msg>) -> Vec<Msg> {
		debug_assert!(self.in_flight > 0);
		self.in_flight -= 1;
		self.debug.pool_job_done(&self.name, "job");
		let mut msgs = vec![*reply];
		msgs.extend(self.pump());
		msgs
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		let (purged, kept) = std::mem::take(&mut self.waiting)
			.into_iter()
			.partition(|job| job.query == Some(query));
		self.waiting = kept;
		Self::purge_acks(purged)
	}

	/// Drop waiting compute jobs of the given keys (cache-production
	/// abandon); running jobs are unaffected.
	pub fn receive_purge_compute_keys(&mut self, keys: &[crate::bus::ComputeKey]) -> Vec<Msg> {
		let (purged, kept) = std::mem::take(&mut self.waiting)
			.into_iter()
			.partition(|job| job.task.compute_key().is_some_and(|k| keys.contains(&k)));
		self.waiting = kept;
		Self::purge_acks(purged)
	}

	/// The gate serializes computes per tile and must learn when a waiting
	/// compute disappears, or the tile's slot would stay occupied forever.
	fn purge_acks(purged: Vec<WaitingJob>) -> Vec<Msg> {
		purged
			.into_iter()
			.filter_map(|job| {
				let key = job.task.compute_key()?;
				let PoolTask::Compute { reply_to, .. } = *job.task else {
					return None;
				};
				let uid = reply_to.raster()?;
				Some(Msg::new(Address::ComputationGate(uid), Verb::ComputePurged { key }))
			})
			.collect()
	}

	pub fn receive_nothing(&mut self) -> Vec<Msg> {
		self.pump()
	}

	/// Launch waiting jobs while worker slots are free.
	fn pump(&mut self) -> Vec<Msg> {
		let mut msgs = Vec::new();
		while self.in_flight < self.slots && !self.waiting.is_empty() {
			let best = self
				.waiting
				.iter()
				.enumerate()
				.min_by_key(|(_, job)| job.priority)
				.map(|(i, _)| i)
				.expect("waiting is not empty");
			let job = self.waiting.swap_remove(best);
			match &self.kind {
				PoolKind::Inline => {
					// trivial work runs on the scheduler thread itself
					msgs.push(run_task(*job.task, &self.ctx));
					self.debug.pool_job_done(&self.name, "job");
				}
				PoolKind::Rayon(pool) => {
					self.in_flight += 1;
					let ctx = self.ctx.clone();
					let inbox = self.inbox.clone();
					let key = self.key;
					let task = job.task;
					pool.spawn(move || {
						let reply = run_task(*task, &ctx);
						// a closed inbox means the scheduler is gone; nothing to do
						let _ = inbox.send(Msg::new(Address::Pool(key), Verb::JobDone { reply: Box::new(reply) }));
					});
				}
			}
		}
		msgs
	}
}

impl std::fmt::Debug for PoolAdapter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PoolAdapter")
			.field("name", &self.name)
			.field("slots", &self.slots)
			.field("in_flight", &self.in_flight)
			.field("waiting", &self.waiting.len())
			.finish()
	}
}

/// Execute one task and build its reply message. User callbacks run under
/// `catch_unwind` so a panicking recipe surfaces as a failed compute, not a
/// dead worker.
pub fn run_task(task: PoolTask, ctx: &TaskCtx) -> Msg {
	match task {
		PoolTask::Read {
			reply_to,
			query,
			prod_id,
			tile,
			fp,
			path,
			file_uid,
			window,
			channels,
		} => {
			let result = (|| {
				let mut lease = ctx
					.handle_pool
					.acquire(file_uid, &|| GridDriver.open(&path, false))?;
				lease.get().read_window(&window, &channels)
			})()
			.map_err(|err| format!("{err:#}"));
			Msg::new(
				reply_to,
				Verb::ReadOutcome {
					query,
					prod_id,
					tile,
					fp,
					result,
				},
			)
		}
		PoolTask::Checksum {
			reply_to,
			tile,
			path,
			expected_hex,
		} => {
			let result = cache::checksum_file(&path)
				.map(|hex| hex == expected_hex)
				.map_err(|err| format!("{err:#}"));
			Msg::new(reply_to, Verb::ChecksumOutcome { tile, path, result })
		}
		PoolTask::Resample {
			reply_to,
			query,
			prod_id,
			piece_idx,
			sample_fp,
			dst_fp,
			array,
			sample_slice,
			src_nodata,
			dst_nodata,
			interpolation,
		} => {
			let result = (|| {
				let sub = array
					.slice(s![sample_slice.y.clone(), sample_slice.x.clone(), ..])
					.to_owned();
				let params = RemapParams {
					src_nodata,
					dst_nodata,
					mask_mode: rasterloom_core::MaskMode::Erode,
					interpolation: Some(interpolation),
				};
				let (out, _) = remap(&sample_fp, &dst_fp, Some(&sub), None, &params)?;
				Ok::<_, anyhow::Error>(out.expect("array in, array out"))
			})()
			.map_err(|err| format!("{err:#}"));
			Msg::new(
				reply_to,
				Verb::ResampleOutcome {
					query,
					prod_id,
					piece_idx,
					result,
				},
			)
		}
		PoolTask::Compute {
			reply_to,
			key,
			fp,
			inputs,
			compute,
			channel_count,
		} => {
			let result = catch_unwind(AssertUnwindSafe(|| compute(&fp, &inputs)))
				.unwrap_or_else(|panic| Err(anyhow::anyhow!("compute function panicked: {}", panic_text(&panic))))
				.and_then(|array| {
					let (rows, cols) = fp.shape();
					anyhow::ensure!(
						array.dim() == (rows, cols, channel_count),
						"compute function returned shape {:?}, expected ({rows}, {cols}, {channel_count})",
						array.dim(),
					);
					Ok(array)
				})
				.map_err(|err| format!("{err:#}"));
			Msg::new(reply_to, Verb::ComputeOutcome { key, fp, result })
		}
		PoolTask::Merge {
			reply_to,
			tile,
			fp,
			pieces,
			merge,
			fill,
		} => {
			let result = catch_unwind(AssertUnwindSafe(|| match &merge {
				Some(merge) => merge(&fp, &pieces),
				None => default_merge(&fp, &pieces, fill),
			}))
			.unwrap_or_else(|panic| Err(anyhow::anyhow!("merge function panicked: {}", panic_text(&panic))))
			.map_err(|err| format!("{err:#}"));
			Msg::new(reply_to, Verb::MergeOutcome { tile, result })
		}
		PoolTask::Write {
			reply_to,
			tile,
			dir,
			key_str,
			meta,
			array,
		} => {
			let result =
				cache::write_tile_atomic(&dir, &key_str, &meta, &array.view()).map_err(|err| format!("{err:#}"));
			Msg::new(reply_to, Verb::WriteOutcome { tile, result })
		}
	}
}

fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"opaque panic payload".to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::raster::PrimitiveInputs;
	use ndarray::Array3;
	use rasterloom_core::Footprint;

	fn ctx() -> TaskCtx {
		TaskCtx {
			handle_pool: HandlePool::new(4).unwrap(),
		}
	}

	fn fp4() -> Footprint {
		Footprint::new((0.0, 4.0), (1.0, -1.0), (4, 4)).unwrap()
	}

	#[test]
	fn compute_task_validates_shape() {
		let task = PoolTask::Compute {
			reply_to: Address::TopLevel,
			key: crate::bus::ComputeKey::AdHoc(QueryId(1), 0),
			fp: fp4(),
			inputs: PrimitiveInputs::default(),
			compute: Arc::new(|_, _| Ok(Array3::zeros((2, 2, 1)))),
			channel_count: 1,
		};
		let reply = run_task(task, &ctx());
		match reply.verb {
			Verb::ComputeOutcome { result, .. } => {
				assert!(result.unwrap_err().contains("shape"));
			}
			other => panic!("unexpected reply {other:?}"),
		}
	}

	#[test]
	fn panicking_compute_becomes_an_error() {
		let task = PoolTask::Compute {
			reply_to: Address::TopLevel,
			key: crate::bus::ComputeKey::AdHoc(QueryId(1), 0),
			fp: fp4(),
			inputs: PrimitiveInputs::default(),
			compute: Arc::new(|_, _| panic!("recipe bug")),
			channel_count: 1,
		};
		let reply = run_task(task, &ctx());
		match reply.verb {
			Verb::ComputeOutcome { result, .. } => {
				let err = result.unwrap_err();
				assert!(err.contains("panicked"), "{err}");
				assert!(err.contains("recipe bug"), "{err}");
			}
			other => panic!("unexpected reply {other:?}"),
		}
	}

	#[test]
	fn inline_adapter_runs_in_place_with_priorities() {
		let (tx, _rx) = crossbeam_channel::unbounded();
		let mut adapter = PoolAdapter::new(
			0,
			"inline".to_string(),
			PoolKind::Inline,
			ctx(),
			tx,
			DebugManager::default(),
		);
		let compute = |value: f64| -> Box<PoolTask> {
			Box::new(PoolTask::Compute {
				reply_to: Address::TopLevel,
				key: crate::bus::ComputeKey::AdHoc(QueryId(value as u64), 0),
				fp: fp4(),
				inputs: PrimitiveInputs::default(),
				compute: Arc::new(move |_, _| Ok(Array3::from_elem((4, 4, 1), value))),
				channel_count: 1,
			})
		};
		let msgs = adapter.receive_enqueue(JobPriority::new(QueryId(5), 0), Some(QueryId(5)), compute(5.0));
		assert_eq!(msgs.len(), 1);
		assert!(adapter.is_idle());
	}

	#[test]
	fn cancel_discards_waiting_jobs() {
		// a rayon pool with no free pump (slots busy) cannot be faked easily;
		// exercise the waiting room by enqueueing into a zero-progress state:
		// use an inline adapter but cancel before pumping via direct access
		let (tx, _rx) = crossbeam_channel::unbounded();
		let mut adapter = PoolAdapter::new(
			0,
			"inline".to_string(),
			PoolKind::Inline,
			ctx(),
			tx,
			DebugManager::default(),
		);
		adapter.waiting.push(WaitingJob {
			priority: JobPriority::new(QueryId(1), 0),
			query: Some(QueryId(1)),
			task: Box::new(PoolTask::Checksum {
				reply_to: Address::TopLevel,
				tile: crate::raster::TileCoord2 { x: 0, y: 0 },
				path: std::path::PathBuf::from("/nonexistent"),
				expected_hex: String::new(),
			}),
		});
		adapter.receive_cancel_query(QueryId(1));
		assert!(adapter.is_idle());
	}
}
