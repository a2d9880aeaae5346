//! Binary predicates: grid alignment, equality, area sharing.
//!
//! All comparisons run under the spatial precision
//! `max(|coords|) * 10^-significant`, with `significant` read from the env
//! stack at call time. Mismatch is reported as `Ok(false)`; a `significant`
//! too small to resolve one pixel of either footprint is an error, as it
//! would make every comparison meaningless.

use super::Footprint;
use crate::env;
use crate::errors::Error;
use anyhow::{Result, ensure};

impl Footprint {
	fn precision_with(&self, other: &Footprint) -> Result<f64> {
		for fp in [self, other] {
			ensure!(
				env::significant() > fp.significant_min,
				Error::Config(format!(
					"`significant` of value {} should be greater than {} for this footprint",
					env::significant(),
					fp.significant_min,
				))
			);
		}
		let largest = self.largest_coord().max(other.largest_coord());
		Ok(largest * 10f64.powf(-env::significant()))
	}

	/// Does `other` lie on the same grid as `self`?
	///
	/// True iff `other`'s origin sits on a whole number of `self`'s pixel
	/// vectors and both footprints share those vectors, all within the
	/// current spatial precision.
	pub fn same_grid(&self, other: &Footprint) -> Result<bool> {
		let precision = self.precision_with(other)?;
		let (slr, stb) = (self.pxlrvec(), self.pxtbvec());
		let (olr, otb) = (other.pxlrvec(), other.pxtbvec());
		let (stl, otl) = (self.tl(), other.tl());

		// other.tl must be reachable from self.tl by whole pixel steps
		let [ia, ib, ic, id, ie, if_] = self.inv_affine();
		let rdx = (ia * otl.0 + ib * otl.1 + ic).round();
		let rdy = (id * otl.0 + ie * otl.1 + if_).round();
		let ex = otl.0 - (stb.0 * rdy + slr.0 * rdx) - stl.0;
		let ey = otl.1 - (stb.1 * rdy + slr.1 * rdx) - stl.1;
		if ex.abs() >= precision || ey.abs() >= precision {
			return Ok(false);
		}

		// each footprint's corners must be consistent with the other's pixel
		// vectors (checks both length and direction over the full extent)
		let checks = [
			(stl, otb, self.rsizey(), self.bl()),
			(stl, olr, self.rsizex(), self.tr()),
			(otl, stb, other.rsizey(), other.bl()),
			(otl, slr, other.rsizex(), other.tr()),
		];
		for (origin, vec, count, corner) in checks {
			let ex = origin.0 + vec.0 * count as f64 - corner.0;
			let ey = origin.1 + vec.1 * count as f64 - corner.1;
			if ex.abs() >= precision || ey.abs() >= precision {
				return Ok(false);
			}
		}
		Ok(true)
	}

	/// Is `other` the same footprint as `self` (same rectangle, same pixel
	/// grid) within the current precision?
	pub fn equals(&self, other: &Footprint) -> Result<bool> {
		let precision = self.precision_with(other)?;
		if self.rsize != other.rsize {
			return Ok(false);
		}
		Ok(self
			.coords()
			.iter()
			.zip(other.coords().iter())
			.all(|(a, b)| (a.0 - b.0).abs() < precision && (a.1 - b.1).abs() < precision))
	}

	/// Does `other` share a non-degenerate area with `self`?
	///
	/// Touching edges or corners do not count as shared area.
	pub fn share_area(&self, other: &Footprint) -> Result<bool> {
		let precision = self.precision_with(other)?;
		let a = quad(self);
		let b = quad(other);
		// separating-axis test over both quads' edge normals; overlap must be
		// strictly positive (beyond precision) on every axis
		for axis in axes(&a).into_iter().chain(axes(&b)) {
			let (min_a, max_a) = project(&a, axis);
			let (min_b, max_b) = project(&b, axis);
			let norm = (axis.0.hypot(axis.1)).max(f64::MIN_POSITIVE);
			let overlap = max_a.min(max_b) - min_a.max(min_b);
			if overlap <= precision * norm {
				return Ok(false);
			}
		}
		Ok(true)
	}
}

fn quad(fp: &Footprint) -> [(f64, f64); 4] {
	fp.coords()
}

fn axes(q: &[(f64, f64); 4]) -> [(f64, f64); 2] {
	let lr = (q[3].0 - q[0].0, q[3].1 - q[0].1);
	let tb = (q[1].0 - q[0].0, q[1].1 - q[0].1);
	// normals of the two edge directions
	[(-lr.1, lr.0), (-tb.1, tb.0)]
}

fn project(q: &[(f64, f64); 4], axis: (f64, f64)) -> (f64, f64) {
	let mut min = f64::INFINITY;
	let mut max = f64::NEG_INFINITY;
	for &(x, y) in q {
		let v = x * axis.0 + y * axis.1;
		min = min.min(v);
		max = max.max(v);
	}
	(min, max)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::env::Env;

	fn fp() -> Footprint {
		Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap()
	}

	#[test]
	fn reflexive() {
		let fp = fp();
		assert!(fp.same_grid(&fp).unwrap());
		assert!(fp.equals(&fp).unwrap());
		assert!(fp.share_area(&fp).unwrap());
	}

	#[test]
	fn same_grid_shifted_and_unaligned() {
		let fp = fp();
		// whole-pixel shift: same grid, not equal
		let shifted = Footprint::new((3.0, 7.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(fp.same_grid(&shifted).unwrap());
		assert!(!fp.equals(&shifted).unwrap());
		// half-pixel shift: different grid
		let off = Footprint::new((3.5, 7.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(!fp.same_grid(&off).unwrap());
		// different resolution: different grid
		let coarse = Footprint::new((0.0, 10.0), (2.0, -2.0), (5, 5)).unwrap();
		assert!(!fp.same_grid(&coarse).unwrap());
	}

	#[test]
	fn same_grid_tolerates_sub_precision_drift() {
		let fp = fp();
		let drift = 1e-12; // far below 10 * 10^-9
		let other = Footprint::new((3.0 + drift, 7.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(fp.same_grid(&other).unwrap());

		// lowering `significant` loosens the comparison
		let off = Footprint::new((3.0 + 1e-4, 7.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(!fp.same_grid(&off).unwrap());
		let _guard = Env::new().significant(3.0).scoped().unwrap();
		assert!(fp.same_grid(&off).unwrap());
	}

	#[test]
	fn share_area_excludes_touching() {
		let fp = fp();
		let inside = Footprint::new((9.0, 1.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(fp.share_area(&inside).unwrap());
		// flush against the right edge: touching only
		let touching = Footprint::new((10.0, 10.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(!fp.share_area(&touching).unwrap());
		// corner contact only
		let corner = Footprint::new((10.0, 15.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(!fp.share_area(&corner).unwrap());
		let far = Footprint::new((100.0, 100.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(!fp.share_area(&far).unwrap());
	}

	#[test]
	fn insufficient_significant_is_an_error() {
		// one-millimeter pixels a million units out need ~9 digits; build the
		// footprints under a permissive env, then compare under a meager one
		let (a, b) = {
			let _guard = Env::new().significant(14.0).scoped().unwrap();
			(
				Footprint::new((1_000_000.0, 10.0), (0.001, -0.001), (10, 10)).unwrap(),
				Footprint::new((1_000_000.0, 10.0), (0.001, -0.001), (10, 10)).unwrap(),
			)
		};
		let _guard = Env::new().significant(4.0).scoped().unwrap();
		for result in [a.same_grid(&b), a.equals(&b), a.share_area(&b)] {
			let err = result.unwrap_err();
			assert!(matches!(Error::of(&err), Some(Error::Config(_))), "{err:#}");
		}
	}
}
