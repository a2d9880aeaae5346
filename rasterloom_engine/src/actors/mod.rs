//! The per-raster actor set.
//!
//! Every scheduled raster owns one instance of each actor below. All of them
//! run on the scheduler thread; a handler mutates its own actor's state and
//! returns the messages to deliver next. Nothing here blocks: heavy work
//! leaves through the pool adapters and comes back as messages.
//!
//! The read path of a cached recipe:
//!
//! ```text
//! QueriesHandler -> Producer -> CacheSupervisor -> (hit)  Reader/CacheExtractor -> Sampler
//!                                              -> (miss) ComputationGate -> PrimitiveCollector
//!                                                         -> Computer -> Merger -> Writer -> Supervisor
//! Sampler -> Producer -> Resampler -> Producer -> output queue
//! ```

mod cache_extractor;
mod cache_supervisor;
mod collector;
mod computer;
mod gate;
mod merger;
mod producer;
mod queries_handler;
mod reader;
mod resampler;
mod sampler;
mod writer;

pub use cache_extractor::CacheExtractor;
pub use cache_supervisor::CacheSupervisor;
pub use collector::PrimitiveCollector;
pub use computer::Computer;
pub use gate::ComputationGate;
pub use merger::Merger;
pub use producer::Producer;
pub use queries_handler::QueriesHandler;
pub use reader::Reader;
pub use resampler::Resampler;
pub use sampler::Sampler;
pub use writer::Writer;

use crate::bus::{Address, Msg, Verb};
use crate::driver::pool::HandlePool;
use crate::raster::RasterSpec;
use anyhow::{Result, bail};
use std::sync::Arc;

/// The twelve actors of one scheduled raster.
pub struct RasterActors {
	pub spec: Arc<RasterSpec>,
	pub queries_handler: QueriesHandler,
	pub producer: Producer,
	pub sampler: Sampler,
	pub resampler: Resampler,
	pub reader: Reader,
	pub cache_supervisor: CacheSupervisor,
	pub cache_extractor: CacheExtractor,
	pub writer: Writer,
	pub merger: Merger,
	pub computer: Computer,
	pub collector: PrimitiveCollector,
	pub gate: ComputationGate,
}

impl RasterActors {
	pub fn new(spec: Arc<RasterSpec>, handle_pool: Arc<HandlePool>) -> RasterActors {
		RasterActors {
			queries_handler: QueriesHandler::new(spec.clone()),
			producer: Producer::new(spec.clone()),
			sampler: Sampler::new(spec.clone()),
			resampler: Resampler::new(spec.clone()),
			reader: Reader::new(spec.clone()),
			cache_supervisor: CacheSupervisor::new(spec.clone(), handle_pool),
			cache_extractor: CacheExtractor::new(spec.clone()),
			writer: Writer::new(spec.clone()),
			merger: Merger::new(spec.clone()),
			computer: Computer::new(spec.clone()),
			collector: PrimitiveCollector::new(spec.clone()),
			gate: ComputationGate::new(spec.clone()),
			spec,
		}
	}

	/// Route one message to the addressed actor.
	pub fn dispatch(&mut self, dest: Address, verb: Verb) -> Result<Vec<Msg>> {
		match dest {
			Address::QueriesHandler(_) => self.queries_handler.receive(verb),
			Address::Producer(_) => self.producer.receive(verb),
			Address::Sampler(_) => self.sampler.receive(verb),
			Address::Resampler(_) => self.resampler.receive(verb),
			Address::Reader(_) => self.reader.receive(verb),
			Address::CacheSupervisor(_) => self.cache_supervisor.receive(verb),
			Address::CacheExtractor(_) => self.cache_extractor.receive(verb),
			Address::Writer(_) => self.writer.receive(verb),
			Address::Merger(_) => self.merger.receive(verb),
			Address::Computer(_) => self.computer.receive(verb),
			Address::Collector(_) => self.collector.receive(verb),
			Address::ComputationGate(_) => self.gate.receive(verb),
			Address::TopLevel | Address::Pool(_) => bail!("message for {dest:?} routed to a raster"),
		}
	}

	/// Spontaneous-progress pass over the actors that have any.
	pub fn receive_nothing(&mut self) -> Result<Vec<Msg>> {
		let mut msgs = self.queries_handler.receive_nothing();
		msgs.extend(self.producer.receive_nothing());
		msgs.extend(self.collector.receive_nothing()?);
		Ok(msgs)
	}

	/// Deliver a cancellation to every actor of the raster.
	pub fn cancel_everywhere(&mut self, query: crate::observers::QueryId) -> Vec<Msg> {
		let mut msgs = Vec::new();
		msgs.extend(self.producer.receive_cancel_query(query));
		msgs.extend(self.sampler.receive_cancel_query(query));
		msgs.extend(self.resampler.receive_cancel_query(query));
		msgs.extend(self.cache_extractor.receive_cancel_query(query));
		msgs.extend(self.cache_supervisor.receive_cancel_query(query));
		msgs.extend(self.collector.receive_cancel_query(query));
		msgs.extend(self.gate.receive_cancel_query(query));
		msgs
	}
}

/// Wrong verb for an actor is a scheduler bug, not a user error.
macro_rules! unexpected_verb {
	($actor:literal, $verb:expr) => {
		anyhow::bail!(concat!($actor, " received an unexpected verb: {:?}"), $verb)
	};
}
pub(crate) use unexpected_verb;
