//! Assembles each production's sample array from per-cache-tile reads.

use super::unexpected_verb;
use crate::bus::{Address, Msg, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::raster::RasterSpec;
use anyhow::Result;
use ndarray::{Array3, s};
use rasterloom_core::Footprint;
use std::collections::HashMap;
use std::sync::Arc;

struct Assembly {
	array: Array3<f64>,
	remaining: usize,
}

pub struct Sampler {
	spec: Arc<RasterSpec>,
	plans: HashMap<QueryId, Arc<QueryPlan>>,
	assemblies: HashMap<(QueryId, usize), Assembly>,
}

impl Sampler {
	pub fn new(spec: Arc<RasterSpec>) -> Sampler {
		Sampler {
			spec,
			plans: HashMap::new(),
			assemblies: HashMap::new(),
		}
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::RegisterQuery { query, plan, .. } => {
				self.plans.insert(query, plan);
				Ok(Vec::new())
			}
			Verb::ExpectSample { query, prod_id } => Ok(self.receive_expect_sample(query, prod_id)),
			Verb::PieceRead {
				query,
				prod_id,
				fp,
				array,
			} => self.receive_piece_read(query, prod_id, &fp, array),
			Verb::CancelQuery { query } => {
				self.plans.remove(&query);
				self.assemblies.retain(|(q, _), _| *q != query);
				Ok(Vec::new())
			}
			other => unexpected_verb!("Sampler", other),
		}
	}

	fn receive_expect_sample(&mut self, query: QueryId, prod_id: usize) -> Vec<Msg> {
		let Some(plan) = self.plans.get(&query) else {
			return Vec::new();
		};
		let prod = &plan.prods[prod_id];
		let sample_fp = prod.sample_fp.as_ref().expect("sampling requires a sample footprint");
		let (rows, cols) = sample_fp.shape();
		self.assemblies.insert(
			(query, prod_id),
			Assembly {
				array: Array3::from_elem((rows, cols, plan.channels.len()), plan.dst_nodata),
				remaining: prod.cache_tiles.len(),
			},
		);
		Vec::new()
	}

	fn receive_piece_read(
		&mut self,
		query: QueryId,
		prod_id: usize,
		fp: &Footprint,
		array: Array3<f64>,
	) -> Result<Vec<Msg>> {
		let Some(plan) = self.plans.get(&query) else {
			return Ok(Vec::new());
		};
		let Some(assembly) = self.assemblies.get_mut(&(query, prod_id)) else {
			return Ok(Vec::new());
		};
		let sample_fp = plan.prods[prod_id]
			.sample_fp
			.as_ref()
			.expect("assembly implies a sample footprint");
		let into = fp.slice_in(sample_fp, false)?;
		assembly.array.slice_mut(s![into.y, into.x, ..]).assign(&array);
		debug_assert!(assembly.remaining > 0);
		assembly.remaining -= 1;
		if assembly.remaining > 0 {
			return Ok(Vec::new());
		}
		let assembly = self.assemblies.remove(&(query, prod_id)).expect("present");
		Ok(vec![Msg::new(
			Address::Producer(self.spec.uid),
			Verb::DoneOneSampling {
				query,
				prod_id,
				array: assembly.array,
			},
		)])
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.plans.remove(&query);
		self.assemblies.retain(|(q, _), _| *q != query);
		Vec::new()
	}
}
