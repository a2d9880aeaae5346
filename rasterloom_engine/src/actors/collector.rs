//! Pulls primitive arrays from upstream rasters, in lockstep.
//!
//! For each compute batch the collector opens one bounded upstream query per
//! primitive, with the footprint-converted computation tiles. Compute `k` is
//! only scheduled once **every** primitive has delivered its array for item
//! `k`; queue bounds upstream keep the lockstep from ballooning.

use super::unexpected_verb;
use crate::bus::{Address, ComputeKey, JobPriority, Msg, Verb};
use crate::observers::QueryId;
use crate::query::QueueReceiver;
use crate::raster::{PrimitiveInputs, RasterSpec};
use anyhow::{Context, Result};
use ndarray::Array3;
use rasterloom_core::Footprint;
use std::collections::HashMap;
use std::sync::Arc;

/// Lookahead of the upstream queries; small to keep memory bounded, more
/// than one to overlap upstream production with downstream computes.
const PRIMITIVE_QUEUE_SIZE: usize = 2;

struct Feed {
	name: String,
	converted_fps: Vec<Footprint>,
	receiver: QueueReceiver,
	/// Arrived-but-not-consumed array of the current item.
	head: Option<Array3<f64>>,
}

struct Batch {
	items: Vec<(ComputeKey, Footprint)>,
	feeds: Vec<Feed>,
	next: usize,
	priority: JobPriority,
	query: Option<QueryId>,
}

pub struct PrimitiveCollector {
	spec: Arc<RasterSpec>,
	batches: HashMap<u64, Batch>,
}

impl PrimitiveCollector {
	pub fn new(spec: Arc<RasterSpec>) -> PrimitiveCollector {
		PrimitiveCollector {
			spec,
			batches: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::Collect {
				batch_id,
				items,
				priority,
				query,
			} => self.receive_collect(batch_id, items, priority, query),
			Verb::CancelQuery { query } => Ok(self.receive_cancel_query(query)),
			other => unexpected_verb!("PrimitiveCollector", other),
		}
	}

	fn receive_collect(
		&mut self,
		batch_id: u64,
		items: Vec<(ComputeKey, Footprint)>,
		priority: JobPriority,
		query: Option<QueryId>,
	) -> Result<Vec<Msg>> {
		if self.spec.primitives.is_empty() {
			// nothing to gather; computes go straight out
			return Ok(items
				.into_iter()
				.map(|(key, fp)| {
					Msg::new(
						Address::Computer(self.spec.uid),
						Verb::ScheduleCompute {
							key,
							fp,
							inputs: PrimitiveInputs::default(),
							priority,
							query,
						},
					)
				})
				.collect());
		}

		let mut feeds = Vec::with_capacity(self.spec.primitives.len());
		for binding in &self.spec.primitives {
			let converted_fps: Vec<Footprint> = items
				.iter()
				.map(|(_, fp)| (binding.convert_fp)(fp))
				.collect::<Result<_>>()
				.with_context(|| format!("converting footprints for primitive '{}'", binding.name))?;
			let receiver = binding
				.source
				.queue(converted_fps.clone(), PRIMITIVE_QUEUE_SIZE)
				.with_context(|| format!("queueing primitive '{}'", binding.name))?;
			feeds.push(Feed {
				name: binding.name.clone(),
				converted_fps,
				receiver,
				head: None,
			});
		}
		self.batches.insert(
			batch_id,
			Batch {
				items,
				feeds,
				next: 0,
				priority,
				query,
			},
		);
		// arrays may already be sitting in the upstream queues
		self.receive_nothing()
	}

	/// Poll the upstream queues; schedule every compute whose primitives are
	/// all in.
	pub fn receive_nothing(&mut self) -> Result<Vec<Msg>> {
		let uid = self.spec.uid;
		let mut msgs = Vec::new();
		let mut finished = Vec::new();
		for (&batch_id, batch) in &mut self.batches {
			loop {
				// fill the head slot of every feed
				for feed in &mut batch.feeds {
					if feed.head.is_none() {
						match feed.receiver.try_recv() {
							None => {}
							Some(Ok(array)) => feed.head = Some(array),
							Some(Err(err)) => {
								return Err(err.context(format!(
									"primitive '{}' failed while feeding a compute",
									feed.name
								)));
							}
						}
					}
				}
				if batch.feeds.iter().any(|f| f.head.is_none()) {
					break;
				}
				// advance the lockstep by one item
				let (key, fp) = batch.items[batch.next].clone();
				let mut inputs = PrimitiveInputs::default();
				for feed in &mut batch.feeds {
					inputs.fps.insert(feed.name.clone(), feed.converted_fps[batch.next].clone());
					inputs
						.arrays
						.insert(feed.name.clone(), feed.head.take().expect("head filled"));
				}
				msgs.push(Msg::new(
					Address::Computer(uid),
					Verb::ScheduleCompute {
						key,
						fp,
						inputs,
						priority: batch.priority,
						query: batch.query,
					},
				));
				batch.next += 1;
				if batch.next == batch.items.len() {
					finished.push(batch_id);
					break;
				}
			}
		}
		for batch_id in finished {
			self.batches.remove(&batch_id);
		}
		Ok(msgs)
	}

	/// Dropping a batch drops its upstream receivers, which cancels the
	/// upstream queries through their own weak references.
	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.batches.retain(|_, batch| batch.query != Some(query));
		Vec::new()
	}
}
