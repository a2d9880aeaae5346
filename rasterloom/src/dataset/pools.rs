//! The pools container: aliases shared between rasters.
//!
//! A pool parameter is either a concrete `rayon` pool, `Scheduler` (run on
//! the scheduler thread; trivial work only), or a hashable alias. Aliases
//! absent from the container are created on first use as thread pools sized
//! to the CPU count, and die with the Dataset.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rasterloom_engine::{PoolBinding, PoolKind};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a recipe names one of its pools.
#[derive(Clone)]
pub enum PoolRef {
	/// A shared alias; auto-created as a CPU-count thread pool on first use.
	Alias(String),
	/// A concrete pool owned by the caller.
	Pool(Arc<rayon::ThreadPool>),
	/// Run on the scheduler thread itself.
	Scheduler,
}

impl PoolRef {
	pub fn alias(name: &str) -> PoolRef {
		PoolRef::Alias(name.to_string())
	}
}

impl Default for PoolRef {
	fn default() -> Self {
		PoolRef::Alias("cpu".to_string())
	}
}

impl std::fmt::Debug for PoolRef {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			PoolRef::Alias(name) => write!(f, "Alias({name:?})"),
			PoolRef::Pool(pool) => write!(f, "Pool({} threads)", pool.current_num_threads()),
			PoolRef::Scheduler => write!(f, "Scheduler"),
		}
	}
}

pub(crate) struct PoolsContainer {
	counter: AtomicU64,
	aliases: Mutex<HashMap<String, PoolBinding>>,
	/// Concrete pools, keyed by pointer identity so that the same pool maps
	/// to the same adapter.
	concrete: Mutex<HashMap<usize, PoolBinding>>,
	inline: Mutex<Option<PoolBinding>>,
}

impl PoolsContainer {
	pub fn new() -> PoolsContainer {
		PoolsContainer {
			counter: AtomicU64::new(1),
			aliases: Mutex::new(HashMap::new()),
			concrete: Mutex::new(HashMap::new()),
			inline: Mutex::new(None),
		}
	}

	fn next_key(&self) -> u64 {
		self.counter.fetch_add(1, Ordering::Relaxed)
	}

	pub fn resolve(&self, pool: &PoolRef) -> Result<PoolBinding> {
		match pool {
			PoolRef::Alias(name) => {
				let mut aliases = self.aliases.lock();
				if let Some(binding) = aliases.get(name) {
					return Ok(binding.clone());
				}
				let threads = num_cpus::get().max(1);
				let pool = rayon::ThreadPoolBuilder::new()
					.num_threads(threads)
					.thread_name(|i| format!("rasterloom-{i}"))
					.build()
					.with_context(|| format!("creating thread pool for alias '{name}'"))?;
				let binding = PoolBinding {
					key: self.next_key(),
					name: name.clone(),
					kind: PoolKind::Rayon(Arc::new(pool)),
				};
				aliases.insert(name.clone(), binding.clone());
				Ok(binding)
			}
			PoolRef::Pool(pool) => {
				let ptr = Arc::as_ptr(pool) as usize;
				let mut concrete = self.concrete.lock();
				if let Some(binding) = concrete.get(&ptr) {
					return Ok(binding.clone());
				}
				let binding = PoolBinding {
					key: self.next_key(),
					name: format!("user-pool-{ptr:x}"),
					kind: PoolKind::Rayon(pool.clone()),
				};
				concrete.insert(ptr, binding.clone());
				Ok(binding)
			}
			PoolRef::Scheduler => {
				let mut inline = self.inline.lock();
				if let Some(binding) = inline.as_ref() {
					return Ok(binding.clone());
				}
				let binding = PoolBinding {
					key: self.next_key(),
					name: "scheduler".to_string(),
					kind: PoolKind::Inline,
				};
				*inline = Some(binding.clone());
				Ok(binding)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aliases_are_shared_and_stable() {
		let pools = PoolsContainer::new();
		let a = pools.resolve(&PoolRef::alias("io")).unwrap();
		let b = pools.resolve(&PoolRef::alias("io")).unwrap();
		assert_eq!(a.key, b.key);
		let c = pools.resolve(&PoolRef::alias("cpu")).unwrap();
		assert_ne!(a.key, c.key);
	}

	#[test]
	fn concrete_pools_keep_their_identity() {
		let pools = PoolsContainer::new();
		let user = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap());
		let a = pools.resolve(&PoolRef::Pool(user.clone())).unwrap();
		let b = pools.resolve(&PoolRef::Pool(user)).unwrap();
		assert_eq!(a.key, b.key);
	}

	#[test]
	fn scheduler_pool_is_inline() {
		let pools = PoolsContainer::new();
		let a = pools.resolve(&PoolRef::Scheduler).unwrap();
		assert!(matches!(a.kind, PoolKind::Inline));
		let b = pools.resolve(&PoolRef::Scheduler).unwrap();
		assert_eq!(a.key, b.key);
	}
}
