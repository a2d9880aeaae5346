//! Process options as a thread-local scoped stack.
//!
//! Three options influence numeric behavior at call time:
//! - `significant` — relative digits used by footprint comparisons (9.0),
//! - `default_index_dtype` — dtype of raster indices ([`IndexDtype::I32`]),
//! - `allow_complex_footprint` — accept rotated / non north-up grids (false).
//!
//! Values are read through the free functions ([`significant()`], …) and
//! overridden for a lexical scope with an [`Env`] guard:
//!
//! ```
//! use rasterloom_core::env::{self, Env};
//!
//! assert_eq!(env::significant(), 9.0);
//! {
//! 	let _guard = Env::new().significant(7.0).scoped().unwrap();
//! 	assert_eq!(env::significant(), 7.0);
//! }
//! assert_eq!(env::significant(), 9.0);
//! ```
//!
//! Each thread starts its stack from the process defaults. Guards must be
//! dropped in reverse order of creation; this falls out of scoping naturally.

use crate::errors::Error;
use crate::types::IndexDtype;
use anyhow::Result;
use std::cell::RefCell;

/// A full snapshot of the option values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvValues {
	pub significant: f64,
	pub default_index_dtype: IndexDtype,
	pub allow_complex_footprint: bool,
}

impl Default for EnvValues {
	fn default() -> Self {
		EnvValues {
			significant: 9.0,
			default_index_dtype: IndexDtype::I32,
			allow_complex_footprint: false,
		}
	}
}

thread_local! {
	static STACK: RefCell<Vec<EnvValues>> = RefCell::new(vec![EnvValues::default()]);
}

fn top() -> EnvValues {
	STACK.with(|s| *s.borrow().last().expect("env stack never empty"))
}

/// Current `significant` value for this thread.
pub fn significant() -> f64 {
	top().significant
}

/// Current index dtype for this thread.
pub fn default_index_dtype() -> IndexDtype {
	top().default_index_dtype
}

/// Whether rotated / non north-up footprints are currently allowed.
pub fn allow_complex_footprint() -> bool {
	top().allow_complex_footprint
}

/// Current snapshot of all option values.
pub fn current() -> EnvValues {
	top()
}

/// Builder for a scoped option override.
#[derive(Debug, Default, Clone)]
pub struct Env {
	significant: Option<f64>,
	default_index_dtype: Option<IndexDtype>,
	allow_complex_footprint: Option<bool>,
}

impl Env {
	pub fn new() -> Self {
		Env::default()
	}

	/// Number of significant digits for floating point comparisons.
	pub fn significant(mut self, value: f64) -> Self {
		self.significant = Some(value);
		self
	}

	pub fn default_index_dtype(mut self, value: IndexDtype) -> Self {
		self.default_index_dtype = Some(value);
		self
	}

	pub fn allow_complex_footprint(mut self, value: bool) -> Self {
		self.allow_complex_footprint = Some(value);
		self
	}

	/// Push the overrides on this thread's stack; popping happens when the
	/// returned guard drops.
	pub fn scoped(self) -> Result<EnvGuard> {
		if let Some(s) = self.significant {
			if !s.is_finite() || s <= 0.0 {
				return Err(Error::Config(format!("`significant` should be > 0, got {s}")).into());
			}
		}
		let mut values = top();
		if let Some(v) = self.significant {
			values.significant = v;
		}
		if let Some(v) = self.default_index_dtype {
			values.default_index_dtype = v;
		}
		if let Some(v) = self.allow_complex_footprint {
			values.allow_complex_footprint = v;
		}
		STACK.with(|s| s.borrow_mut().push(values));
		Ok(EnvGuard { _priv: () })
	}
}

/// RAII guard popping one [`Env`] frame on drop.
#[must_use = "dropping the guard immediately cancels the override"]
pub struct EnvGuard {
	_priv: (),
}

impl Drop for EnvGuard {
	fn drop(&mut self) {
		STACK.with(|s| {
			let mut stack = s.borrow_mut();
			debug_assert!(stack.len() > 1, "env stack underflow");
			stack.pop();
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults() {
		assert_eq!(significant(), 9.0);
		assert_eq!(default_index_dtype(), IndexDtype::I32);
		assert!(!allow_complex_footprint());
	}

	#[test]
	fn nested_scopes() {
		let _a = Env::new().significant(8.0).scoped().unwrap();
		assert_eq!(significant(), 8.0);
		{
			let _b = Env::new()
				.allow_complex_footprint(true)
				.default_index_dtype(IndexDtype::I64)
				.scoped()
				.unwrap();
			// inherited from the outer frame
			assert_eq!(significant(), 8.0);
			assert!(allow_complex_footprint());
			assert_eq!(default_index_dtype(), IndexDtype::I64);
		}
		assert!(!allow_complex_footprint());
		assert_eq!(significant(), 8.0);
	}

	#[test]
	fn bad_significant_is_rejected() {
		assert!(Env::new().significant(0.0).scoped().is_err());
		assert!(Env::new().significant(-3.0).scoped().is_err());
	}

	#[test]
	fn fresh_thread_starts_from_defaults() {
		let _guard = Env::new().significant(5.0).scoped().unwrap();
		let seen = std::thread::spawn(significant).join().unwrap();
		assert_eq!(seen, 9.0);
	}
}
