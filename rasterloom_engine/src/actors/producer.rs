//! The per-query production state machine.
//!
//! For each production index the producer tracks what is still missing
//! (sample pieces, compute pieces, resample pieces) and pushes finished
//! arrays to the output queue **in the order of the query's footprint
//! list**. Productions are only activated while they fit the output queue's
//! free space, which is what propagates back-pressure all the way down to
//! reads and computes.

use super::unexpected_verb;
use crate::bus::{Address, Msg, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::query::OutputQueue;
use crate::raster::RasterSpec;
use anyhow::Result;
use ndarray::{Array3, Axis, s};
use rasterloom_core::Footprint;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

enum Phase {
	/// Not yet activated (outside the back-pressure window).
	Pending,
	/// Waiting for sample and/or compute pieces.
	WaitingSources,
	/// Resample jobs in flight.
	Resampling,
	/// Final array ready, not yet pushed.
	Produced,
	/// Delivered to the output queue.
	Pushed,
}

struct ProdState {
	phase: Phase,
	/// Assembled source pixels (uncached path; accumulates compute pieces).
	sample: Option<Array3<f64>>,
	compute_remaining: usize,
	resample_remaining: usize,
	/// Accumulating output array.
	produce: Option<Array3<f64>>,
}

struct ProducerQuery {
	plan: Arc<QueryPlan>,
	queue: Weak<OutputQueue>,
	prods: Vec<ProdState>,
	/// Next production to push (ordering guarantee).
	next_push: usize,
	/// Productions `< active_end` have been activated.
	active_end: usize,
}

pub struct Producer {
	spec: Arc<RasterSpec>,
	queries: HashMap<QueryId, ProducerQuery>,
}

impl Producer {
	pub fn new(spec: Arc<RasterSpec>) -> Producer {
		Producer {
			spec,
			queries: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::RegisterQuery { query, plan, queue } => Ok(self.receive_register_query(query, plan, queue)),
			Verb::DoneOneSampling { query, prod_id, array } => Ok(self.receive_done_one_sampling(query, prod_id, array)),
			Verb::DoneOneCompute {
				query,
				prod_id,
				fp,
				array,
			} => self.receive_done_one_compute(query, prod_id, &fp, array),
			Verb::DoneOneResampling {
				query,
				prod_id,
				piece_idx,
				array,
			} => self.receive_done_one_resampling(query, prod_id, piece_idx, array),
			Verb::CancelQuery { query } => Ok(self.receive_cancel_query(query)),
			other => unexpected_verb!("Producer", other),
		}
	}

	fn receive_register_query(&mut self, query: QueryId, plan: Arc<QueryPlan>, queue: Weak<OutputQueue>) -> Vec<Msg> {
		let prods = plan
			.prods
			.iter()
			.map(|_| ProdState {
				phase: Phase::Pending,
				sample: None,
				compute_remaining: 0,
				resample_remaining: 0,
				produce: None,
			})
			.collect();
		self.queries.insert(
			query,
			ProducerQuery {
				plan,
				queue,
				prods,
				next_push: 0,
				active_end: 0,
			},
		);
		self.advance(query)
	}

	fn receive_done_one_sampling(&mut self, query: QueryId, prod_id: usize, array: Array3<f64>) -> Vec<Msg> {
		let Some(q) = self.queries.get_mut(&query) else {
			return Vec::new(); // cancelled; drop the late result
		};
		q.prods[prod_id].sample = Some(array);
		let mut msgs = self.start_resampling(query, prod_id);
		msgs.extend(self.advance(query));
		msgs
	}

	fn receive_done_one_compute(
		&mut self,
		query: QueryId,
		prod_id: usize,
		fp: &Footprint,
		array: Array3<f64>,
	) -> Result<Vec<Msg>> {
		let Some(q) = self.queries.get_mut(&query) else {
			return Ok(Vec::new());
		};
		let plan = q.plan.clone();
		let prod_plan = &plan.prods[prod_id];
		let state = &mut q.prods[prod_id];
		let sample_fp = prod_plan.sample_fp.as_ref().expect("compute pieces imply a sample");
		// the compute returns every channel; keep the queried ones
		let selected = array.select(Axis(2), &plan.channels);
		let sample = state.sample.as_mut().expect("sample allocated at activation");
		let into = fp.slice_in(sample_fp, true)?;
		let from = sample_fp.slice_in(fp, true)?;
		if !into.is_empty() {
			sample
				.slice_mut(s![into.y, into.x, ..])
				.assign(&selected.slice(s![from.y, from.x, ..]));
		}
		debug_assert!(state.compute_remaining > 0);
		state.compute_remaining -= 1;
		let mut msgs = Vec::new();
		if state.compute_remaining == 0 {
			msgs.extend(self.start_resampling(query, prod_id));
			msgs.extend(self.advance(query));
		}
		Ok(msgs)
	}

	fn receive_done_one_resampling(
		&mut self,
		query: QueryId,
		prod_id: usize,
		piece_idx: usize,
		array: Array3<f64>,
	) -> Result<Vec<Msg>> {
		let Some(q) = self.queries.get_mut(&query) else {
			return Ok(Vec::new());
		};
		let plan = q.plan.clone();
		let prod_plan = &plan.prods[prod_id];
		let piece_fp = &prod_plan.resamples[piece_idx].fp;
		let state = &mut q.prods[prod_id];
		let produce = state.produce.as_mut().expect("produce allocated before resampling");
		let into = piece_fp.slice_in(&prod_plan.fp, false)?;
		produce.slice_mut(s![into.y, into.x, ..]).assign(&array);
		debug_assert!(state.resample_remaining > 0);
		state.resample_remaining -= 1;
		if state.resample_remaining == 0 {
			state.phase = Phase::Produced;
		}
		Ok(self.advance(query))
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.queries.remove(&query);
		Vec::new()
	}

	pub fn receive_nothing(&mut self) -> Vec<Msg> {
		let queries: Vec<QueryId> = self.queries.keys().copied().collect();
		let mut msgs = Vec::new();
		for query in queries {
			msgs.extend(self.advance(query));
		}
		msgs
	}

	/// Gather the resample structure once all source pieces of `prod_id`
	/// arrived.
	fn start_resampling(&mut self, query: QueryId, prod_id: usize) -> Vec<Msg> {
		let Some(q) = self.queries.get_mut(&query) else {
			return Vec::new();
		};
		let plan = q.plan.clone();
		let prod_plan = &plan.prods[prod_id];
		let state = &mut q.prods[prod_id];

		let (rows, cols) = prod_plan.fp.shape();
		if state.produce.is_none() {
			state.produce = Some(Array3::from_elem(
				(rows, cols, plan.channels.len()),
				plan.dst_nodata,
			));
		}
		let live_pieces = prod_plan.resamples.iter().filter(|r| r.sample_fp.is_some()).count();
		state.resample_remaining = live_pieces;
		if live_pieces == 0 {
			state.phase = Phase::Produced;
			return Vec::new();
		}
		state.phase = Phase::Resampling;
		let sample = state.sample.take().expect("sources arrived");
		vec![Msg::new(
			Address::Resampler(self.spec.uid),
			Verb::ScheduleOneResample {
				query,
				prod_id,
				array: Arc::new(sample),
			},
		)]
	}

	/// Activate productions while the output queue has room, and push
	/// finished arrays in order. Loops until neither makes progress.
	fn advance(&mut self, query: QueryId) -> Vec<Msg> {
		let mut msgs = Vec::new();
		loop {
			let to_activate = {
				let Some(q) = self.queries.get_mut(&query) else {
					return msgs;
				};
				let Some(queue) = q.queue.upgrade() else {
					// consumer is gone; the QueriesHandler tick will cancel
					return msgs;
				};

				// push in input order
				while q.next_push < q.prods.len()
					&& matches!(q.prods[q.next_push].phase, Phase::Produced)
					&& queue.free_space() > 0
				{
					let state = &mut q.prods[q.next_push];
					let array = state.produce.take().expect("produced array present");
					queue.push(array);
					state.phase = Phase::Pushed;
					q.next_push += 1;
				}

				// activate the next production if the window allows
				let window_end = (q.next_push + queue.free_space()).min(q.prods.len());
				if q.active_end < window_end {
					q.active_end += 1;
					Some(q.active_end - 1)
				} else {
					None
				}
			};
			match to_activate {
				Some(prod_id) => msgs.extend(self.activate(query, prod_id)),
				None => return msgs,
			}
		}
	}

	fn activate(&mut self, query: QueryId, prod_id: usize) -> Vec<Msg> {
		let Some(q) = self.queries.get_mut(&query) else {
			return Vec::new();
		};
		let plan = q.plan.clone();
		let prod_plan = &plan.prods[prod_id];
		let state = &mut q.prods[prod_id];
		let uid = self.spec.uid;

		let Some(sample_fp) = &prod_plan.sample_fp else {
			// fully outside the raster: a nodata array, one scheduler-side
			// pass; the advance loop pushes it right after
			let (rows, cols) = prod_plan.fp.shape();
			state.produce = Some(Array3::from_elem(
				(rows, cols, plan.channels.len()),
				plan.dst_nodata,
			));
			state.phase = Phase::Produced;
			return Vec::new();
		};

		state.phase = Phase::WaitingSources;
		if self.spec.cache.is_some() {
			vec![
				Msg::new(Address::Sampler(uid), Verb::ExpectSample { query, prod_id }),
				Msg::new(Address::CacheSupervisor(uid), Verb::ProdNeedsTiles { query, prod_id }),
			]
		} else {
			// uncached: computes write straight into the sample assembly
			let (rows, cols) = sample_fp.shape();
			state.sample = Some(Array3::from_elem(
				(rows, cols, plan.channels.len()),
				plan.dst_nodata,
			));
			state.compute_remaining = if self.spec.automatic_remapping {
				prod_plan.compute_tiles.len()
			} else {
				1
			};
			vec![Msg::new(
				Address::ComputationGate(uid),
				Verb::ComputeNeeded { query, prod_id },
			)]
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::observers::DebugManager;
	use crate::plan::QueryPlan;
	use crate::query::OutputQueue;
	use crate::raster::{PoolBinding, PoolKind, TileGrid};
	use rasterloom_core::{BoundaryEffect, ChannelsSchema, Interpolation, PixelDtype};
	use std::sync::atomic::AtomicBool;
	use uuid::Uuid;

	fn pool(key: u64) -> PoolBinding {
		PoolBinding {
			key,
			name: format!("p{key}"),
			kind: PoolKind::Inline,
		}
	}

	fn uncached_spec() -> Arc<RasterSpec> {
		let fp = Footprint::new((0.0, 40.0), (1.0, -1.0), (40, 40)).unwrap();
		let tiles = TileGrid::new(fp.tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap()).unwrap();
		Arc::new(RasterSpec {
			uid: Uuid::new_v4(),
			fp,
			dtype: PixelDtype::F64,
			channel_count: 1,
			schema: ChannelsSchema::with_nodata(1, -99.0),
			wkt: None,
			compute: Arc::new(|_, _| Ok(Array3::zeros((1, 1, 1)))),
			merge: None,
			primitives: vec![],
			computation_tiles: tiles,
			cache: None,
			computation_pool: pool(0),
			merge_pool: pool(1),
			resample_pool: pool(2),
			max_resampling_size: None,
			automatic_remapping: true,
			allow_interpolation: true,
			debug: DebugManager::default(),
		})
	}

	fn make_query(
		spec: &RasterSpec,
		fps: Vec<Footprint>,
		capacity: usize,
	) -> (Arc<QueryPlan>, Weak<OutputQueue>, crate::query::QueueReceiver) {
		let plan = Arc::new(
			QueryPlan::build(spec, &fps, vec![0], None, Interpolation::Area, capacity).unwrap(),
		);
		let alive = Arc::new(AtomicBool::new(true));
		let (weak, rx) = OutputQueue::new(capacity, fps.len(), alive);
		(plan, weak, rx)
	}

	#[test]
	fn outside_productions_deliver_nodata_in_order() {
		let spec = uncached_spec();
		let mut producer = Producer::new(spec.clone());
		let outside = Footprint::new((500.0, 500.0), (1.0, -1.0), (4, 4)).unwrap();
		let (plan, weak, mut rx) = make_query(&spec, vec![outside.clone(), outside], 5);
		let msgs = producer.receive_register_query(QueryId(1), plan, weak);
		assert!(msgs.is_empty());
		for _ in 0..2 {
			let arr = rx.try_recv().unwrap().unwrap();
			assert!(arr.iter().all(|&v| v == -99.0));
			assert_eq!(arr.dim(), (4, 4, 1));
		}
		assert!(rx.try_recv().is_none());
	}

	#[test]
	fn back_pressure_window_limits_activation() {
		let spec = uncached_spec();
		let mut producer = Producer::new(spec.clone());
		let inside = Footprint::new((0.0, 40.0), (1.0, -1.0), (10, 10)).unwrap();
		let fps = vec![inside.clone(), inside.clone(), inside.clone(), inside];
		let (plan, weak, mut rx) = make_query(&spec, fps, 1);
		let msgs = producer.receive_register_query(QueryId(1), plan.clone(), weak);
		// window of 1: exactly one production activated
		let computes = msgs
			.iter()
			.filter(|m| matches!(m.verb, Verb::ComputeNeeded { .. }))
			.count();
		assert_eq!(computes, 1);

		// feed its single compute piece (one tile overlap)
		let sample_fp = plan.prods[0].sample_fp.clone().unwrap();
		let piece = Array3::from_elem((sample_fp.rsizey(), sample_fp.rsizex(), 1), 3.0);
		let msgs = producer
			.receive_done_one_compute(QueryId(1), 0, &sample_fp, piece)
			.unwrap();
		// resampling scheduled for production 0
		assert!(
			msgs
				.iter()
				.any(|m| matches!(m.verb, Verb::ScheduleOneResample { prod_id: 0, .. }))
		);
		// resample completes; array pushed; queue now full, nothing new activates
		let out = Array3::from_elem((10, 10, 1), 3.0);
		let msgs = producer.receive_done_one_resampling(QueryId(1), 0, 0, out).unwrap();
		assert_eq!(rx.ready(), 1);
		let activated: usize = msgs
			.iter()
			.filter(|m| matches!(m.verb, Verb::ComputeNeeded { .. }))
			.count();
		assert_eq!(activated, 0, "queue full, window closed");

		// consumer takes the array: the next tick opens the window again
		rx.try_recv().unwrap().unwrap();
		let msgs = producer.receive_nothing();
		let activated: usize = msgs
			.iter()
			.filter(|m| matches!(m.verb, Verb::ComputeNeeded { .. }))
			.count();
		assert_eq!(activated, 1);
	}

	#[test]
	fn late_results_after_cancel_are_dropped() {
		let spec = uncached_spec();
		let mut producer = Producer::new(spec.clone());
		let inside = Footprint::new((0.0, 40.0), (1.0, -1.0), (10, 10)).unwrap();
		let (plan, weak, rx) = make_query(&spec, vec![inside], 2);
		producer.receive_register_query(QueryId(1), plan, weak);
		producer.receive_cancel_query(QueryId(1));
		drop(rx);
		let msgs = producer.receive_done_one_sampling(QueryId(1), 0, Array3::zeros((10, 10, 1)));
		assert!(msgs.is_empty());
	}
}
