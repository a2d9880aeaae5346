//! Typed error kinds surfaced to users.
//!
//! All fallible functions in the workspace return `anyhow::Result`; the kinds
//! below travel inside the `anyhow::Error` so that callers who care can match
//! on them with `err.downcast_ref::<Error>()` while everybody else just
//! bubbles them up with `?`.
//!
//! `Clone` is part of the contract: a scheduler failure is replicated into
//! every live output queue.

use thiserror::Error;

/// Error kinds a user of the library can observe.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
	/// Bad construction parameter detected synchronously (scale of zero,
	/// empty extent, incompatible spatial-reference modes, `max_active < 1`).
	#[error("invalid configuration: {0}")]
	Config(String),

	/// Infeasible geometric operation: empty or touching-only intersection,
	/// out-of-bounds slice, non-orthogonal move beyond precision.
	#[error("geometry error: {0}")]
	Geometry(String),

	/// An operation required two footprints to lie on the same grid.
	#[error("footprints do not lie on the same grid: {0}")]
	GridMismatch(String),

	/// Resampling was required but interpolation is disabled on the Dataset.
	#[error("remap requires interpolation but `allow_interpolation` is false: {0}")]
	InterpolationForbidden(String),

	/// The driver-handle budget is fully used with nothing idle to evict.
	#[error("driver-handle budget of {max_active} exhausted: {idle} idle, {used} used")]
	PoolExhausted { max_active: usize, idle: usize, used: usize },

	/// `deactivate` was called while handles are checked out.
	#[error("cannot deactivate raster {uid}: {used} driver handle(s) still in use")]
	PoolInUse { uid: u64, used: usize },

	/// The Dataset's scheduler died; any API that needs it now fails fast.
	#[error("the scheduler is dead: {0}")]
	SchedulerDead(String),

	/// A cache tile file failed its checksum. Never surfaced directly to the
	/// user (recovery is transparent); exists for debug observers and logs.
	#[error("corrupted cache tile: {0}")]
	CorruptedCache(String),

	/// A user `compute_array`/`merge_arrays` callback or a driver call inside
	/// a pool failed. Terminal for the raster's compute path.
	#[error("compute failed: {0}")]
	ComputeFailed(String),

	/// A runtime parameter is out of contract.
	#[error("invalid parameter: {0}")]
	InvalidParameter(String),
}

impl Error {
	/// The kind of `err` when it carries a rasterloom [`Error`].
	pub fn of(err: &anyhow::Error) -> Option<&Error> {
		err.downcast_ref::<Error>()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::anyhow;

	#[test]
	fn downcast_through_anyhow() {
		let err: anyhow::Error = Error::InvalidParameter("channels".to_string()).into();
		let err = err.context("while planning a query");
		assert!(matches!(Error::of(&err), Some(Error::InvalidParameter(_))));

		let plain = anyhow!("some other failure");
		assert!(Error::of(&plain).is_none());
	}

	#[test]
	fn clone_keeps_message() {
		let err = Error::PoolExhausted {
			max_active: 2,
			idle: 0,
			used: 2,
		};
		assert_eq!(err.clone().to_string(), err.to_string());
	}
}
