//! Ships resample pieces to the resample pool and reports them back to the
//! Producer.

use super::unexpected_verb;
use crate::bus::{Address, JobPriority, Msg, PoolTask, Verb};
use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::raster::RasterSpec;
use anyhow::Result;
use ndarray::Array3;
use rasterloom_core::errors::Error;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Resampler {
	spec: Arc<RasterSpec>,
	plans: HashMap<QueryId, Arc<QueryPlan>>,
}

impl Resampler {
	pub fn new(spec: Arc<RasterSpec>) -> Resampler {
		Resampler {
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
			Verb::ScheduleOneResample { query, prod_id, array } => self.receive_schedule_one_resample(query, prod_id, array),
			Verb::ResampleOutcome {
				query,
				prod_id,
				piece_idx,
				result,
			} => self.receive_resample_outcome(query, prod_id, piece_idx, result),
			Verb::CancelQuery { query } => {
				self.plans.remove(&query);
				Ok(Vec::new())
			}
			other => unexpected_verb!("Resampler", other),
		}
	}

	/// One job per planned resample piece; each slices its own sub-region
	/// out of the shared sample array.
	fn receive_schedule_one_resample(
		&mut self,
		query: QueryId,
		prod_id: usize,
		array: Arc<Array3<f64>>,
	) -> Result<Vec<Msg>> {
		let Some(plan) = self.plans.get(&query) else {
			return Ok(Vec::new());
		};
		let prod = &plan.prods[prod_id];
		let sample_fp = prod.sample_fp.as_ref().expect("resampling implies a sample");
		let mut msgs = Vec::new();
		for (piece_idx, piece) in prod.resamples.iter().enumerate() {
			let Some(piece_sample_fp) = &piece.sample_fp else {
				continue; // stays nodata; the producer pre-filled it
			};
			let sample_slice = piece_sample_fp.slice_in(sample_fp, false)?;
			msgs.push(Msg::new(
				Address::Pool(self.spec.resample_pool.key),
				Verb::Enqueue {
					priority: JobPriority::new(query, prod_id),
					query: Some(query),
					task: Box::new(PoolTask::Resample {
						reply_to: Address::Resampler(self.spec.uid),
						query,
						prod_id,
						piece_idx,
						sample_fp: piece_sample_fp.clone(),
						dst_fp: piece.fp.clone(),
						array: array.clone(),
						sample_slice,
						src_nodata: self.spec.nodata(),
						dst_nodata: plan.dst_nodata,
						interpolation: plan.interpolation,
					}),
				},
			));
		}
		Ok(msgs)
	}

	fn receive_resample_outcome(
		&mut self,
		query: QueryId,
		prod_id: usize,
		piece_idx: usize,
		result: Result<Array3<f64>, String>,
	) -> Result<Vec<Msg>> {
		if !self.plans.contains_key(&query) {
			return Ok(Vec::new()); // cancelled
		}
		match result {
			Ok(array) => Ok(vec![Msg::new(
				Address::Producer(self.spec.uid),
				Verb::DoneOneResampling {
					query,
					prod_id,
					piece_idx,
					array,
				},
			)]),
			// planning already vetoed forbidden interpolation; a failure here
			// is a broken invariant, terminal for the engine
			Err(error) => Err(Error::ComputeFailed(format!("resampling failed: {error}")).into()),
		}
	}

	pub fn receive_cancel_query(&mut self, query: QueryId) -> Vec<Msg> {
		self.plans.remove(&query);
		Vec::new()
	}
}
