//! Debug observers: multicast of named engine events to user callbacks.
//!
//! Observers are purely diagnostic; nothing in the engine reads back from
//! them and they must never affect scheduling.

use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of one query, unique per engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub u64);

impl std::fmt::Display for QueryId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "q{}", self.0)
	}
}

/// User hook set. Every method has an empty default body; implement the ones
/// you care about.
#[allow(unused_variables)]
pub trait DebugObserver: Send + Sync {
	fn on_object_allocated(&self, what: &str) {}
	fn on_query_created(&self, raster: Uuid, query: QueryId, produce_count: usize) {}
	fn on_query_dropped(&self, raster: Uuid, query: QueryId) {}
	fn on_cache_tile_ready(&self, raster: Uuid, path: &Path) {}
	fn on_cache_tile_corrupted(&self, raster: Uuid, path: &Path) {}
	fn on_pool_job_enqueued(&self, pool: &str, kind: &str) {}
	fn on_pool_job_done(&self, pool: &str, kind: &str) {}
	fn on_scheduler_crashed(&self, message: &str) {}
}

/// Shared, cheaply clonable observer multicast.
#[derive(Clone, Default)]
pub struct DebugManager {
	observers: Arc<Vec<Arc<dyn DebugObserver>>>,
}

impl DebugManager {
	pub fn new(observers: Vec<Arc<dyn DebugObserver>>) -> DebugManager {
		DebugManager {
			observers: Arc::new(observers),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.observers.is_empty()
	}

	/// A manager multicasting to this set and to `extra`.
	pub fn merged_with(&self, extra: &DebugManager) -> DebugManager {
		if extra.observers.is_empty() {
			return self.clone();
		}
		let mut all = self.observers.as_ref().clone();
		all.extend(extra.observers.iter().cloned());
		DebugManager {
			observers: Arc::new(all),
		}
	}

	pub fn object_allocated(&self, what: &str) {
		for o in self.observers.iter() {
			o.on_object_allocated(what);
		}
	}

	pub fn query_created(&self, raster: Uuid, query: QueryId, produce_count: usize) {
		for o in self.observers.iter() {
			o.on_query_created(raster, query, produce_count);
		}
	}

	pub fn query_dropped(&self, raster: Uuid, query: QueryId) {
		for o in self.observers.iter() {
			o.on_query_dropped(raster, query);
		}
	}

	pub fn cache_tile_ready(&self, raster: Uuid, path: &Path) {
		for o in self.observers.iter() {
			o.on_cache_tile_ready(raster, path);
		}
	}

	pub fn cache_tile_corrupted(&self, raster: Uuid, path: &Path) {
		for o in self.observers.iter() {
			o.on_cache_tile_corrupted(raster, path);
		}
	}

	pub fn pool_job_enqueued(&self, pool: &str, kind: &str) {
		for o in self.observers.iter() {
			o.on_pool_job_enqueued(pool, kind);
		}
	}

	pub fn pool_job_done(&self, pool: &str, kind: &str) {
		for o in self.observers.iter() {
			o.on_pool_job_done(pool, kind);
		}
	}

	pub fn scheduler_crashed(&self, message: &str) {
		for o in self.observers.iter() {
			o.on_scheduler_crashed(message);
		}
	}
}

impl std::fmt::Debug for DebugManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DebugManager")
			.field("observers", &self.observers.len())
			.finish()
	}
}
