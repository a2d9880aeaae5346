//! Ships user computes to the computation pool.

use super::unexpected_verb;
use crate::bus::{Address, ComputeKey, JobPriority, Msg, PoolTask, Verb};
use crate::raster::{PrimitiveInputs, RasterSpec};
use anyhow::Result;
use ndarray::Array3;
use rasterloom_core::Footprint;
use rasterloom_core::errors::Error;
use std::sync::Arc;

pub struct Computer {
	spec: Arc<RasterSpec>,
}

impl Computer {
	pub fn new(spec: Arc<RasterSpec>) -> Computer {
		Computer { spec }
	}

	pub fn receive(&mut self, verb: Verb) -> Result<Vec<Msg>> {
		match verb {
			Verb::ScheduleCompute {
				key,
				fp,
				inputs,
				priority,
				query,
			} => Ok(self.receive_schedule_compute(key, fp, inputs, priority, query)),
			Verb::ComputeOutcome { key, fp, result } => self.receive_compute_outcome(key, fp, result),
			other => unexpected_verb!("Computer", other),
		}
	}

	fn receive_schedule_compute(
		&mut self,
		key: ComputeKey,
		fp: Footprint,
		inputs: PrimitiveInputs,
		priority: JobPriority,
		query: Option<crate::observers::QueryId>,
	) -> Vec<Msg> {
		vec![Msg::new(
			Address::Pool(self.spec.computation_pool.key),
			Verb::Enqueue {
				priority,
				query,
				task: Box::new(PoolTask::Compute {
					reply_to: Address::Computer(self.spec.uid),
					key,
					fp,
					inputs,
					compute: self.spec.compute.clone(),
					channel_count: self.spec.channel_count,
				}),
			},
		)]
	}

	fn receive_compute_outcome(
		&mut self,
		key: ComputeKey,
		fp: Footprint,
		result: Result<Array3<f64>, String>,
	) -> Result<Vec<Msg>> {
		match result {
			Ok(array) => Ok(vec![Msg::new(
				Address::ComputationGate(self.spec.uid),
				Verb::ComputeDone { key, fp, array },
			)]),
			// a failing compute is terminal for the raster's compute path;
			// the scheduler fans the error out to every live query
			Err(error) => Err(Error::ComputeFailed(format!("compute of {fp} failed: {error}")).into()),
		}
	}
}
