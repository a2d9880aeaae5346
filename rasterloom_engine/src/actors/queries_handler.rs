//! Entry point of every query: planning, registration, liveness.

use super::unexpected_verb;
use crate::bus::{Address, Msg, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::query::OutputQueue;
use crate::raster::RasterSpec;
use anyhow::Result;
use rasterloom_core::errors::Error;
use rasterloom_core::{Footprint, Interpolation};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

struct LiveQuery {
	queue: Weak<OutputQueue>,
}

/// Accepts new queries, plans them, fans them out, and watches the weak
/// output references for cancellation.
pub struct QueriesHandler {
	spec: Arc<RasterSpec>,
	queries: HashMap<QueryId, LiveQuery>,
}

impl QueriesHandler {
	pub fn new(spec: Arc<RasterSpec>) -> QueriesHandler {
		QueriesHandler {
			spec,
			queries: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::NewQuery {
				query,
				queue,
				fps,
				channels,
				dst_nodata,
				interpolation,
				max_queue_size,
			} => Ok(self.receive_new_query(query, queue, fps, channels, dst_nodata, interpolation, max_queue_size)),
			Verb::CancelQuery { query } => {
				self.queries.remove(&query);
				Ok(Vec::new())
			}
			other => unexpected_verb!("QueriesHandler", other),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn receive_new_query(
		&mut self,
		query: QueryId,
		queue: Weak<OutputQueue>,
		fps: Vec<Footprint>,
		channels: Vec<usize>,
		dst_nodata: Option<f64>,
		interpolation: Interpolation,
		max_queue_size: usize,
	) -> Vec<Msg> {
		let plan = match QueryPlan::build(&self.spec, &fps, channels, dst_nodata, interpolation, max_queue_size) {
			Ok(plan) => Arc::new(plan),
			Err(err) => {
				// a malformed query fails alone, without crashing the engine
				log::warn!("rejecting query {query} on raster {}: {err:#}", self.spec.uid);
				if let Some(queue) = queue.upgrade() {
					let kind = Error::of(&err)
						.cloned()
						.unwrap_or_else(|| Error::InvalidParameter(format!("{err:#}")));
					queue.poison(kind);
				}
				return Vec::new();
			}
		};

		self.spec.debug.query_created(self.spec.uid, query, plan.prods.len());
		self.queries.insert(query, LiveQuery { queue: queue.clone() });

		let uid = self.spec.uid;
		let mut msgs = Vec::new();
		for dest in [
			Address::Producer(uid),
			Address::Sampler(uid),
			Address::Resampler(uid),
			Address::CacheExtractor(uid),
			Address::CacheSupervisor(uid),
			Address::ComputationGate(uid),
		] {
			msgs.push(Msg::new(
				dest,
				Verb::RegisterQuery {
					query,
					plan: plan.clone(),
					queue: queue.clone(),
				},
			));
		}
		msgs
	}

	/// Liveness pass: a dead weak reference cancels its query everywhere.
	pub fn receive_nothing(&mut self) -> Vec<Msg> {
		let mut dropped = Vec::new();
		self.queries.retain(|&query, live| {
			if live.queue.strong_count() == 0 {
				dropped.push(query);
				false
			} else {
				true
			}
		});
		let mut msgs = Vec::new();
		for query in dropped {
			log::debug!("query {query} dropped by consumer, cancelling");
			self.spec.debug.query_dropped(self.spec.uid, query);
			msgs.extend(self.cancel_broadcast(query));
		}
		msgs
	}

	/// Cancellation fan-out: the raster's actors plus its pools.
	fn cancel_broadcast(&self, query: QueryId) -> Vec<Msg> {
		let uid = self.spec.uid;
		let mut dests = vec![
			Address::Producer(uid),
			Address::Sampler(uid),
			Address::Resampler(uid),
			Address::CacheExtractor(uid),
			Address::CacheSupervisor(uid),
			Address::Collector(uid),
			Address::ComputationGate(uid),
		];
		let mut pool_keys = vec![
			self.spec.computation_pool.key,
			self.spec.merge_pool.key,
			self.spec.resample_pool.key,
		];
		if let Some(cache) = &self.spec.cache {
			pool_keys.push(cache.io_pool.key);
		}
		pool_keys.sort_unstable();
		pool_keys.dedup();
		dests.extend(pool_keys.into_iter().map(Address::Pool));
		dests
			.into_iter()
			.map(|dest| Msg::new(dest, Verb::CancelQuery { query }))
			.collect()
	}

	/// Queues of every live query, for failure fan-out.
	pub fn live_queues(&self) -> Vec<Arc<OutputQueue>> {
		self.queries.values().filter_map(|q| q.queue.upgrade()).collect()
	}

	/// Ids of every registered query, for teardown sweeps.
	pub fn query_ids(&self) -> Vec<QueryId> {
		self.queries.keys().copied().collect()
	}
}
