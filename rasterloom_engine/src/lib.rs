//! The asynchronous tile engine: scheduler, per-raster actors, query
//! planning, pool offloading, the driver-handle pool and the content-
//! addressed file cache.
//!
//! One [`Engine`] runs per Dataset. Rasters are registered as immutable
//! [`RasterSpec`] records; queries enter through [`Engine::queue_data`] and
//! deliver arrays through a bounded [`QueueReceiver`] whose disappearance
//! cancels the rest of the work.
//!
//! The user-facing API lives in the `rasterloom` facade crate; this crate is
//! the machinery.

pub mod actors;
pub mod bus;
pub mod cache;
pub mod driver;
pub mod observers;
pub mod plan;
pub mod pool_adapter;
pub mod query;
pub mod raster;
pub mod scheduler;

pub use driver::pool::{HandleLease, HandlePool};
pub use driver::{Driver, DriverHandle, GridDriver, RasterMeta};
pub use observers::{DebugManager, DebugObserver, QueryId};
pub use plan::QueryPlan;
pub use query::QueueReceiver;
pub use raster::{
	CacheConfig, ComputeFn, ConvertFpFn, MergeFn, PoolBinding, PoolKind, PrimitiveBinding, PrimitiveInputs,
	PrimitiveSource, RasterSpec, TileCoord2, TileGrid,
};
pub use scheduler::Engine;
