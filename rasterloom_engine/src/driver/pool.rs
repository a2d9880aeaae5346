//! The bounded pool of idle driver handles.
//!
//! Opening a raster file is expensive, so handles are kept around after use —
//! but never more than `max_active` of them across the whole Dataset, idle
//! and checked-out combined. Idle handles are evicted least-recently-used
//! when a new one must be allocated.

use super::DriverHandle;
use anyhow::Result;
use parking_lot::Mutex;
use rasterloom_core::errors::Error;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

/// Allocates one handle when the pool has none idle for a raster.
pub type Allocator<'a> = &'a dyn Fn() -> Result<Box<dyn DriverHandle>>;

struct PoolState {
	/// Idle handles, most recently used at the front.
	idle: VecDeque<(Uuid, Box<dyn DriverHandle>)>,
	/// Checked-out handle counts per raster.
	used: HashMap<Uuid, usize>,
}

impl PoolState {
	fn used_total(&self) -> usize {
		self.used.values().sum()
	}

	fn idle_count_of(&self, uid: Uuid) -> usize {
		self.idle.iter().filter(|(u, _)| *u == uid).count()
	}

	/// Make room for one more handle, evicting the LRU idle handle if the
	/// budget is full.
	fn ensure_one_slot(&mut self, max_active: usize) -> Result<()> {
		let total = self.used_total() + self.idle.len();
		debug_assert!(total <= max_active);
		if total == max_active {
			if self.idle.pop_back().is_none() {
				return Err(Error::PoolExhausted {
					max_active,
					idle: 0,
					used: self.used_total(),
				}
				.into());
			}
		}
		Ok(())
	}
}

/// Per-Dataset pool of driver handles, bounded by `max_active`.
pub struct HandlePool {
	max_active: usize,
	state: Mutex<PoolState>,
}

impl HandlePool {
	pub fn new(max_active: usize) -> Result<Arc<HandlePool>> {
		if max_active < 1 {
			return Err(Error::Config(format!("`max_active` should be >= 1, got {max_active}")).into());
		}
		Ok(Arc::new(HandlePool {
			max_active,
			state: Mutex::new(PoolState {
				idle: VecDeque::new(),
				used: HashMap::new(),
			}),
		}))
	}

	pub fn max_active(&self) -> usize {
		self.max_active
	}

	/// Make sure at least one handle exists (idle or used) for `uid`.
	pub fn activate(&self, uid: Uuid, allocator: Allocator<'_>) -> Result<()> {
		{
			let state = self.state.lock();
			if state.used.get(&uid).copied().unwrap_or(0) > 0 || state.idle_count_of(uid) > 0 {
				return Ok(());
			}
		}
		// allocate outside the lock, then re-check: a concurrent activation
		// may have beaten us, in which case the fresh handle is dropped
		let handle = allocator()?;
		let mut state = self.state.lock();
		if state.used.get(&uid).copied().unwrap_or(0) == 0 && state.idle_count_of(uid) == 0 {
			state.ensure_one_slot(self.max_active)?;
			state.idle.push_front((uid, handle));
		}
		Ok(())
	}

	/// Check a handle out; it returns to the front of the idle list when the
	/// lease drops.
	pub fn acquire(self: &Arc<Self>, uid: Uuid, allocator: Allocator<'_>) -> Result<HandleLease> {
		let reuse = {
			let mut state = self.state.lock();
			if let Some(pos) = state.idle.iter().position(|(u, _)| *u == uid) {
				let (_, handle) = state.idle.remove(pos).unwrap();
				*state.used.entry(uid).or_insert(0) += 1;
				Some(handle)
			} else {
				state.ensure_one_slot(self.max_active)?;
				*state.used.entry(uid).or_insert(0) += 1;
				None
			}
		};
		let handle = match reuse {
			Some(handle) => handle,
			None => match allocator() {
				Ok(handle) => handle,
				Err(err) => {
					// allocation failed: restore the counter
					let mut state = self.state.lock();
					let count = state.used.get_mut(&uid).expect("counter was incremented");
					*count -= 1;
					return Err(err);
				}
			},
		};
		Ok(HandleLease {
			pool: Arc::clone(self),
			uid,
			handle: Some(handle),
		})
	}

	/// Drop every idle handle of `uid`.
	///
	/// # Errors
	/// [`Error::PoolInUse`] while handles of `uid` are checked out.
	pub fn deactivate(&self, uid: Uuid) -> Result<()> {
		let mut state = self.state.lock();
		let used = state.used.get(&uid).copied().unwrap_or(0);
		if used > 0 {
			return Err(Error::PoolInUse {
				uid: uid.as_u64_pair().0,
				used,
			}
			.into());
		}
		state.idle.retain(|(u, _)| *u != uid);
		Ok(())
	}

	pub fn idle_count(&self, uid: Option<Uuid>) -> usize {
		let state = self.state.lock();
		match uid {
			None => state.idle.len(),
			Some(uid) => state.idle_count_of(uid),
		}
	}

	pub fn used_count(&self, uid: Option<Uuid>) -> usize {
		let state = self.state.lock();
		match uid {
			None => state.used_total(),
			Some(uid) => state.used.get(&uid).copied().unwrap_or(0),
		}
	}

	pub fn active_count(&self, uid: Option<Uuid>) -> usize {
		self.idle_count(uid) + self.used_count(uid)
	}

	fn release(&self, uid: Uuid, handle: Box<dyn DriverHandle>) {
		let mut state = self.state.lock();
		let count = state.used.get_mut(&uid).expect("releasing an unleased handle");
		debug_assert!(*count > 0);
		*count -= 1;
		state.idle.push_front((uid, handle));
	}
}

impl std::fmt::Debug for HandlePool {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let state = self.state.lock();
		f.debug_struct("HandlePool")
			.field("max_active", &self.max_active)
			.field("idle", &state.idle.len())
			.field("used", &state.used_total())
			.finish()
	}
}

/// A checked-out driver handle; returns to the pool's MRU position on drop.
pub struct HandleLease {
	pool: Arc<HandlePool>,
	uid: Uuid,
	handle: Option<Box<dyn DriverHandle>>,
}

impl std::fmt::Debug for HandleLease {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HandleLease").field("uid", &self.uid).finish()
	}
}

impl HandleLease {
	pub fn get(&mut self) -> &mut dyn DriverHandle {
		self.handle.as_mut().expect("lease is live").as_mut()
	}
}

impl Drop for HandleLease {
	fn drop(&mut self) {
		if let Some(handle) = self.handle.take() {
			self.pool.release(self.uid, handle);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::driver::RasterMeta;
	use anyhow::anyhow;
	use ndarray::{Array3, ArrayView3};
	use rasterloom_core::{ChannelsSchema, Footprint, PixelDtype, Slice2};
	use std::sync::atomic::{AtomicUsize, Ordering};

	/// Handle stub counting allocations.
	struct FakeHandle {
		meta: RasterMeta,
	}

	impl DriverHandle for FakeHandle {
		fn meta(&self) -> &RasterMeta {
			&self.meta
		}
		fn read_window(&mut self, window: &Slice2, channels: &[usize]) -> Result<Array3<f64>> {
			Ok(Array3::zeros((window.y.len(), window.x.len(), channels.len())))
		}
		fn write_window(&mut self, _: &Slice2, _: &ArrayView3<'_, f64>) -> Result<()> {
			Ok(())
		}
		fn sync(&mut self) -> Result<()> {
			Ok(())
		}
	}

	fn fake() -> Box<dyn DriverHandle> {
		Box::new(FakeHandle {
			meta: RasterMeta {
				fp: Footprint::new((0.0, 4.0), (1.0, -1.0), (4, 4)).unwrap(),
				dtype: PixelDtype::F64,
				channel_count: 1,
				schema: ChannelsSchema::default_for(1),
				wkt: None,
			},
		})
	}

	#[test]
	fn budget_is_enforced() {
		let pool = HandlePool::new(2).unwrap();
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		let c = Uuid::new_v4();
		let lease_a = pool.acquire(a, &|| Ok(fake())).unwrap();
		let lease_b = pool.acquire(b, &|| Ok(fake())).unwrap();
		assert_eq!(pool.used_count(None), 2);
		// both handles used, nothing to evict
		let err = pool.acquire(c, &|| Ok(fake())).unwrap_err();
		assert!(matches!(Error::of(&err), Some(Error::PoolExhausted { .. })));
		drop(lease_a);
		drop(lease_b);
		assert_eq!(pool.idle_count(None), 2);
		assert_eq!(pool.used_count(None), 0);
		// now c can evict the LRU idle handle (a, released first)
		let _lease_c = pool.acquire(c, &|| Ok(fake())).unwrap();
		assert_eq!(pool.idle_count(Some(a)), 0);
		assert_eq!(pool.idle_count(Some(b)), 1);
	}

	#[test]
	fn acquire_reuses_idle_handles() {
		let pool = HandlePool::new(4).unwrap();
		let uid = Uuid::new_v4();
		let allocations = AtomicUsize::new(0);
		let allocator = || {
			allocations.fetch_add(1, Ordering::SeqCst);
			Ok(fake())
		};
		drop(pool.acquire(uid, &allocator).unwrap());
		drop(pool.acquire(uid, &allocator).unwrap());
		drop(pool.acquire(uid, &allocator).unwrap());
		assert_eq!(allocations.load(Ordering::SeqCst), 1);
		assert_eq!(pool.active_count(Some(uid)), 1);
	}

	#[test]
	fn failed_allocation_restores_counters() {
		let pool = HandlePool::new(2).unwrap();
		let uid = Uuid::new_v4();
		let err = pool.acquire(uid, &|| Err(anyhow!("disk on fire")));
		assert!(err.is_err());
		assert_eq!(pool.used_count(None), 0);
		assert_eq!(pool.idle_count(None), 0);
	}

	#[test]
	fn activate_is_idempotent() {
		let pool = HandlePool::new(2).unwrap();
		let uid = Uuid::new_v4();
		let allocations = AtomicUsize::new(0);
		let allocator = || {
			allocations.fetch_add(1, Ordering::SeqCst);
			Ok(fake())
		};
		pool.activate(uid, &allocator).unwrap();
		pool.activate(uid, &allocator).unwrap();
		assert_eq!(allocations.load(Ordering::SeqCst), 1);
		assert_eq!(pool.idle_count(Some(uid)), 1);
	}

	#[test]
	fn deactivate_refuses_while_used() {
		let pool = HandlePool::new(2).unwrap();
		let uid = Uuid::new_v4();
		let lease = pool.acquire(uid, &|| Ok(fake())).unwrap();
		let err = pool.deactivate(uid).unwrap_err();
		assert!(matches!(Error::of(&err), Some(Error::PoolInUse { .. })));
		drop(lease);
		pool.deactivate(uid).unwrap();
		assert_eq!(pool.active_count(Some(uid)), 0);
	}

	#[test]
	fn invariant_never_exceeds_budget() {
		let pool = HandlePool::new(3).unwrap();
		let uids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
		for _ in 0..3 {
			for &uid in &uids {
				let _lease = pool.acquire(uid, &|| Ok(fake())).unwrap();
				assert!(pool.idle_count(None) + pool.used_count(None) <= 3);
			}
		}
	}
}
