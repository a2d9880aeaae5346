//! The in-process message bus: addresses, verbs, messages.
//!
//! Every actor handler has the shape `fn receive_x(&mut self, …) ->
//! Vec<Msg>`: it mutates its own state and returns the messages to deliver
//! next. The scheduler appends them to the current local pass, so messages
//! produced during a dispatch are processed before the next external drain.
//!
//! Addresses are small enums and dispatch is a match, not a registry.

use crate::observers::QueryId;
use crate::plan::QueryPlan;
use crate::query::OutputQueue;
use crate::raster::{ComputeFn, MergeFn, PrimitiveInputs, RasterSpec};
use ndarray::Array3;
use rasterloom_core::{Footprint, Interpolation, Slice2};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Stable address of one actor instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
	/// Dataset-level lifecycle actor.
	TopLevel,
	/// Pool-offload adapter of one registered pool.
	Pool(u64),
	QueriesHandler(Uuid),
	Producer(Uuid),
	Sampler(Uuid),
	Resampler(Uuid),
	Reader(Uuid),
	CacheSupervisor(Uuid),
	CacheExtractor(Uuid),
	Writer(Uuid),
	Merger(Uuid),
	Computer(Uuid),
	Collector(Uuid),
	ComputationGate(Uuid),
}

impl Address {
	/// The raster this address belongs to, if any.
	pub fn raster(&self) -> Option<Uuid> {
		match self {
			Address::TopLevel | Address::Pool(_) => None,
			Address::QueriesHandler(uid)
			| Address::Producer(uid)
			| Address::Sampler(uid)
			| Address::Resampler(uid)
			| Address::Reader(uid)
			| Address::CacheSupervisor(uid)
			| Address::CacheExtractor(uid)
			| Address::Writer(uid)
			| Address::Merger(uid)
			| Address::Computer(uid)
			| Address::Collector(uid)
			| Address::ComputationGate(uid) => Some(*uid),
		}
	}
}

/// Key of one compute: either a computation tile of the raster's grid, or an
/// ad-hoc footprint (recipes with `automatic_remapping` disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeKey {
	Tile(crate::raster::TileCoord2),
	AdHoc(QueryId, usize),
}

/// Priority of a pool job: earlier queries first, then earlier productions.
/// Cache-production work inherits the priority of the query that first
/// requested the tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobPriority {
	pub query_seq: u64,
	pub prod_id: u64,
}

impl JobPriority {
	pub fn new(query: QueryId, prod_id: usize) -> JobPriority {
		JobPriority {
			query_seq: query.0,
			prod_id: prod_id as u64,
		}
	}
}

/// A message: destination plus verb.
#[derive(Debug)]
pub struct Msg {
	pub dest: Address,
	pub verb: Verb,
}

impl Msg {
	pub fn new(dest: Address, verb: Verb) -> Msg {
		Msg { dest, verb }
	}
}

/// Everything actors say to each other.
#[derive(Debug)]
pub enum Verb {
	// -- lifecycle (TopLevel) --------------------------------------------
	NewRaster {
		spec: Arc<RasterSpec>,
	},
	KillRaster {
		uid: Uuid,
		ack: crossbeam_channel::Sender<()>,
	},
	StopScheduler {
		ack: crossbeam_channel::Sender<()>,
	},

	// -- query lifecycle --------------------------------------------------
	NewQuery {
		query: QueryId,
		queue: Weak<OutputQueue>,
		fps: Vec<Footprint>,
		channels: Vec<usize>,
		dst_nodata: Option<f64>,
		interpolation: Interpolation,
		max_queue_size: usize,
	},
	/// Fan-out of a planned query to the raster's actors.
	RegisterQuery {
		query: QueryId,
		plan: Arc<QueryPlan>,
		queue: Weak<OutputQueue>,
	},
	/// Broadcast when a query's consumer disappeared or the query failed.
	CancelQuery {
		query: QueryId,
	},

	// -- producer ---------------------------------------------------------
	DoneOneSampling {
		query: QueryId,
		prod_id: usize,
		array: Array3<f64>,
	},
	DoneOneCompute {
		query: QueryId,
		prod_id: usize,
		fp: Footprint,
		array: Array3<f64>,
	},
	DoneOneResampling {
		query: QueryId,
		prod_id: usize,
		piece_idx: usize,
		array: Array3<f64>,
	},

	// -- sampler / cache extraction --------------------------------------
	/// Producer activates one production's sampling.
	ExpectSample {
		query: QueryId,
		prod_id: usize,
	},
	/// One cache tile's pixels for one production.
	PieceRead {
		query: QueryId,
		prod_id: usize,
		fp: Footprint,
		array: Array3<f64>,
	},
	ScheduleRead {
		query: QueryId,
		prod_id: usize,
		tile: crate::raster::TileCoord2,
		path: PathBuf,
		file_uid: Uuid,
	},
	ReadOutcome {
		query: QueryId,
		prod_id: usize,
		tile: crate::raster::TileCoord2,
		fp: Footprint,
		result: Result<Array3<f64>, String>,
	},

	// -- cache supervision ------------------------------------------------
	/// Producer activates one production's cache-tile needs.
	ProdNeedsTiles {
		query: QueryId,
		prod_id: usize,
	},
	CheckTile {
		tile: crate::raster::TileCoord2,
		path: PathBuf,
		expected_hex: String,
		priority: JobPriority,
	},
	ChecksumOutcome {
		tile: crate::raster::TileCoord2,
		path: PathBuf,
		result: Result<bool, String>,
	},
	CheckResult {
		tile: crate::raster::TileCoord2,
		path: PathBuf,
		ok: bool,
	},
	ReadCorruption {
		tile: crate::raster::TileCoord2,
		query: QueryId,
		prod_id: usize,
	},
	/// The tile's bytes entered the Writer (Producing -> Writing).
	WriteStarted {
		tile: crate::raster::TileCoord2,
	},
	WriteDone {
		tile: crate::raster::TileCoord2,
		path: PathBuf,
	},
	WriteFailed {
		tile: crate::raster::TileCoord2,
		error: String,
	},

	// -- computation ------------------------------------------------------
	/// Producer activates one production's computes (uncached rasters).
	ComputeNeeded {
		query: QueryId,
		prod_id: usize,
	},
	/// Supervisor requests the computes feeding one absent cache tile.
	ProduceCacheTile {
		tile: crate::raster::TileCoord2,
		priority: JobPriority,
	},
	/// Collector hands a primitive-fed compute to the Computer.
	ScheduleCompute {
		key: ComputeKey,
		fp: Footprint,
		inputs: PrimitiveInputs,
		priority: JobPriority,
		/// The query the compute serves; `None` for cache production.
		query: Option<QueryId>,
	},
	ComputeOutcome {
		key: ComputeKey,
		fp: Footprint,
		result: Result<Array3<f64>, String>,
	},
	ComputeDone {
		key: ComputeKey,
		fp: Footprint,
		array: Array3<f64>,
	},
	/// A still-waiting compute job was purged from its pool's waiting room;
	/// the gate frees the tile's in-flight slot.
	ComputePurged {
		key: ComputeKey,
	},
	/// No query is interested in this cache tile anymore; stop producing it
	/// if production has not reached the write stage.
	AbandonCacheTile {
		tile: crate::raster::TileCoord2,
	},
	/// Drop waiting compute jobs of these keys (cache-production abandon).
	PurgeComputeKeys {
		keys: Vec<ComputeKey>,
	},
	/// Gate asks the Collector to gather primitives for a batch of computes.
	Collect {
		batch_id: u64,
		items: Vec<(ComputeKey, Footprint)>,
		priority: JobPriority,
		/// The query the batch serves; `None` for cache production.
		query: Option<QueryId>,
	},

	// -- merge / write ----------------------------------------------------
	ExpectCacheTile {
		tile: crate::raster::TileCoord2,
		ctile_fps: Vec<Footprint>,
		priority: JobPriority,
	},
	PieceReady {
		tile: crate::raster::TileCoord2,
		fp: Footprint,
		array: Array3<f64>,
	},
	MergeOutcome {
		tile: crate::raster::TileCoord2,
		result: Result<Array3<f64>, String>,
	},
	WriteTile {
		tile: crate::raster::TileCoord2,
		array: Array3<f64>,
		priority: JobPriority,
	},
	WriteOutcome {
		tile: crate::raster::TileCoord2,
		result: Result<(PathBuf, String), String>,
	},

	// -- resampling -------------------------------------------------------
	ScheduleOneResample {
		query: QueryId,
		prod_id: usize,
		array: Arc<Array3<f64>>,
	},
	ResampleOutcome {
		query: QueryId,
		prod_id: usize,
		piece_idx: usize,
		result: Result<Array3<f64>, String>,
	},

	// -- pool offload -----------------------------------------------------
	/// An actor parks a task in a pool's waiting room.
	Enqueue {
		priority: JobPriority,
		query: Option<QueryId>,
		task: Box<PoolTask>,
	},
	/// A worker finished; the adapter frees the slot and forwards the reply.
	JobDone {
		reply: Box<Msg>,
	},
}

/// A unit of heavy work shipped to a pool. Plain data plus the callbacks it
/// owns; runs on a worker thread and produces the reply message.
pub enum PoolTask {
	Read {
		reply_to: Address,
		query: QueryId,
		prod_id: usize,
		tile: crate::raster::TileCoord2,
		fp: Footprint,
		path: PathBuf,
		file_uid: Uuid,
		window: Slice2,
		channels: Vec<usize>,
	},
	Checksum {
		reply_to: Address,
		tile: crate::raster::TileCoord2,
		path: PathBuf,
		expected_hex: String,
	},
	Resample {
		reply_to: Address,
		query: QueryId,
		prod_id: usize,
		piece_idx: usize,
		sample_fp: Footprint,
		dst_fp: Footprint,
		array: Arc<Array3<f64>>,
		sample_slice: Slice2,
		src_nodata: Option<f64>,
		dst_nodata: f64,
		interpolation: Interpolation,
	},
	Compute {
		reply_to: Address,
		key: ComputeKey,
		fp: Footprint,
		inputs: PrimitiveInputs,
		compute: Arc<ComputeFn>,
		channel_count: usize,
	},
	Merge {
		reply_to: Address,
		tile: crate::raster::TileCoord2,
		fp: Footprint,
		pieces: Vec<(Footprint, Array3<f64>)>,
		merge: Option<Arc<MergeFn>>,
		fill: f64,
	},
	Write {
		reply_to: Address,
		tile: crate::raster::TileCoord2,
		dir: PathBuf,
		key_str: String,
		meta: crate::driver::RasterMeta,
		array: Array3<f64>,
	},
}

impl PoolTask {
	pub fn kind(&self) -> &'static str {
		match self {
			PoolTask::Read { .. } => "read",
			PoolTask::Checksum { .. } => "checksum",
			PoolTask::Resample { .. } => "resample",
			PoolTask::Compute { .. } => "compute",
			PoolTask::Merge { .. } => "merge",
			PoolTask::Write { .. } => "write",
		}
	}

	/// The compute key of a waiting compute job (purge sweeps).
	pub fn compute_key(&self) -> Option<ComputeKey> {
		match self {
			PoolTask::Compute { key, .. } => Some(*key),
			_ => None,
		}
	}
}

impl std::fmt::Debug for PoolTask {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "PoolTask::{}", self.kind())
	}
}
