//! Coordinate conversions between spatial and raster space, slicing and
//! meshgrids.

use super::Footprint;
use super::constructors::{grid_density, snap};
use crate::env;
use crate::errors::Error;
use anyhow::{Result, ensure};
use ndarray::Array2;
use std::ops::Range;

/// A pair of index ranges `(rows, cols)` locating one footprint inside
/// another's array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice2 {
	pub y: Range<usize>,
	pub x: Range<usize>,
}

impl Slice2 {
	pub fn shape(&self) -> (usize, usize) {
		(self.y.end - self.y.start, self.x.end - self.x.start)
	}

	pub fn is_empty(&self) -> bool {
		self.y.is_empty() || self.x.is_empty()
	}
}

impl Footprint {
	/// Convert raster coordinates to spatial coordinates.
	pub fn raster_to_spatial(&self, xy: (f64, f64)) -> (f64, f64) {
		let [a, b, c, d, e, f] = self.aff;
		let (i, j) = xy;
		(a * i + b * j + c, d * i + e * j + f)
	}

	/// Inverse affine `(a, b, c, d, e, f)` mapping spatial coordinates to
	/// raster coordinates.
	pub(crate) fn inv_affine(&self) -> [f64; 6] {
		let [a, b, c, d, e, f] = self.aff;
		let det = a * e - b * d;
		[
			e / det,
			-b / det,
			(b * f - e * c) / det,
			-d / det,
			a / det,
			(d * c - a * f) / det,
		]
	}

	/// Convert spatial coordinates to fractional raster coordinates, snapped
	/// onto the abstract grid given by the current precision.
	///
	/// The snapping keeps coordinates that are one float-dust away from a
	/// pixel corner on the right side of the `floor` below.
	pub fn spatial_to_raster_f(&self, xy: (f64, f64)) -> (f64, f64) {
		let [ia, ib, ic, id, ie, if_] = self.inv_affine();
		let (x, y) = xy;
		let (i, j) = (ia * x + ib * y + ic, id * x + ie * y + if_);
		let (pxw, pxh) = self.pxsize();
		let density = grid_density(self.largest_coord(), pxw.min(pxh));
		(snap(i, density), snap(j, density))
	}

	/// Convert spatial coordinates to integer raster indices (floor).
	///
	/// # Errors
	/// When the result does not fit the current `default_index_dtype`.
	pub fn spatial_to_raster(&self, xy: (f64, f64)) -> Result<(i64, i64)> {
		let (i, j) = self.spatial_to_raster_f(xy);
		let (i, j) = (i.floor(), j.floor());
		let max = env::default_index_dtype().max_index() as f64;
		ensure!(
			i.abs() <= max && j.abs() <= max,
			Error::Geometry(format!(
				"raster index ({i}, {j}) does not fit the current index dtype"
			))
		);
		Ok((i as i64, j as i64))
	}

	/// Pixel-index rectangle of `self` inside `other`'s array.
	///
	/// With `clip`, ranges are clamped to `other`'s bounds; a disjoint pair
	/// yields an empty range. Without `clip`, `self` must lie within `other`.
	///
	/// Burn `small` into `big` where overlapping:
	/// `big[small.slice_in(big, true)] = small[big.slice_in(small, true)]`.
	pub fn slice_in(&self, other: &Footprint, clip: bool) -> Result<Slice2> {
		let (x0, y0) = other.spatial_to_raster(self.tl())?;
		let (x1, y1) = other.spatial_to_raster(self.br())?;
		let (w, h) = (other.rsizex() as i64, other.rsizey() as i64);
		let (x0, x1, y0, y1) = if clip {
			(
				x0.clamp(0, w),
				x1.clamp(0, w),
				y0.clamp(0, h),
				y1.clamp(0, h),
			)
		} else {
			ensure!(
				x0 >= 0 && y0 >= 0 && x1 <= w && y1 <= h,
				Error::Geometry(format!(
					"footprint slice ({x0}..{x1}, {y0}..{y1}) exceeds target bounds ({w}, {h})"
				))
			);
			(x0, x1, y0, y1)
		};
		Ok(Slice2 {
			y: y0.max(0) as usize..y1.max(0) as usize,
			x: x0.max(0) as usize..x1.max(0) as usize,
		})
	}

	/// Index matrices `(xs, ys)` of shape `shape()`.
	pub fn meshgrid_raster(&self) -> (Array2<i64>, Array2<i64>) {
		let shape = self.shape();
		let xs = Array2::from_shape_fn(shape, |(_, i)| i as i64);
		let ys = Array2::from_shape_fn(shape, |(j, _)| j as i64);
		(xs, ys)
	}

	/// Spatial coordinate matrices `(xs, ys)` of each pixel, shape `shape()`.
	pub fn meshgrid_spatial(&self) -> (Array2<f64>, Array2<f64>) {
		let [a, b, c, d, e, f] = self.aff;
		let shape = self.shape();
		let xs = Array2::from_shape_fn(shape, |(j, i)| a * i as f64 + b * j as f64 + c);
		let ys = Array2::from_shape_fn(shape, |(j, i)| d * i as f64 + e * j as f64 + f);
		(xs, ys)
	}

	/// Raster coordinates of `self`'s pixels expressed in `other`'s raster
	/// referential, shape `self.shape()`. This is the map used by the
	/// resampling kernel.
	pub fn meshgrid_raster_in(&self, other: &Footprint) -> (Array2<f64>, Array2<f64>) {
		let [a, b, c, d, e, f] = self.aff;
		let [ia, ib, ic, id, ie, if_] = other.inv_affine();
		let shape = self.shape();
		let xs = Array2::from_shape_fn(shape, |(j, i)| {
			let (x, y) = (a * i as f64 + b * j as f64 + c, d * i as f64 + e * j as f64 + f);
			ia * x + ib * y + ic
		});
		let ys = Array2::from_shape_fn(shape, |(j, i)| {
			let (x, y) = (a * i as f64 + b * j as f64 + c, d * i as f64 + e * j as f64 + f);
			id * x + ie * y + if_
		});
		(xs, ys)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;

	fn fp() -> Footprint {
		Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap()
	}

	#[test]
	fn spatial_raster_roundtrip() {
		let fp = fp();
		assert_eq!(fp.raster_to_spatial((0.0, 0.0)), (0.0, 10.0));
		assert_eq!(fp.raster_to_spatial((10.0, 10.0)), (10.0, 0.0));
		assert_eq!(fp.spatial_to_raster((0.0, 10.0)).unwrap(), (0, 0));
		assert_eq!(fp.spatial_to_raster((3.5, 6.5)).unwrap(), (3, 3));
		// outside positions give negative indices
		assert_eq!(fp.spatial_to_raster((-1.5, 10.0)).unwrap(), (-2, 0));
	}

	#[test]
	fn snapping_absorbs_float_dust() {
		let fp = fp();
		// one float-dust below a corner still lands on the corner index
		let (i, _) = fp.spatial_to_raster((3.0 - 1e-12, 10.0)).unwrap();
		assert_eq!(i, 3);
	}

	#[test]
	fn slice_in_within_and_clipped() {
		let big = fp();
		let small = big.clip(3, 7, 7, 10).unwrap();
		let slice = small.slice_in(&big, false).unwrap();
		assert_eq!(slice, Slice2 { y: 7..10, x: 3..7 });
		assert_eq!(slice.shape(), (3, 4));

		// shifted footprint crosses the edge: unclipped errors, clipped clamps
		let outside = Footprint::new((8.0, 3.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(outside.slice_in(&big, false).is_err());
		let slice = outside.slice_in(&big, true).unwrap();
		assert_eq!(slice, Slice2 { y: 7..10, x: 8..10 });

		// fully disjoint: at least one empty range
		let far = Footprint::new((50.0, 50.0), (1.0, -1.0), (4, 4)).unwrap();
		assert!(far.slice_in(&big, true).unwrap().is_empty());
	}

	#[test]
	fn meshgrids_are_consistent() {
		let fp = fp();
		let (xs, ys) = fp.meshgrid_spatial();
		assert_eq!(xs[(0, 0)], 0.0);
		assert_eq!(ys[(0, 0)], 10.0);
		assert_eq!(xs[(2, 5)], 5.0);
		assert_eq!(ys[(2, 5)], 8.0);

		// meshgrid of self in self is the identity map
		let (mx, my) = fp.meshgrid_raster_in(&fp);
		let (rx, ry) = fp.meshgrid_raster();
		for j in 0..fp.rsizey() {
			for i in 0..fp.rsizex() {
				assert_abs_diff_eq!(mx[(j, i)], rx[(j, i)] as f64, epsilon = 1e-9);
				assert_abs_diff_eq!(my[(j, i)], ry[(j, i)] as f64, epsilon = 1e-9);
			}
		}
	}

	#[test]
	fn slice_in_meshgrid_recovery() {
		// spec'd invariant: indexing the outer meshgrid with `slice_in`
		// recovers the inner meshgrid
		let big = fp();
		let small = big.clip(2, 1, 8, 6).unwrap();
		let slice = small.slice_in(&big, false).unwrap();
		let (bx, by) = big.meshgrid_spatial();
		let (sx, sy) = small.meshgrid_spatial();
		let view_x = bx.slice(ndarray::s![slice.y.clone(), slice.x.clone()]);
		let view_y = by.slice(ndarray::s![slice.y.clone(), slice.x.clone()]);
		assert_eq!(view_x, sx);
		assert_eq!(view_y, sy);
	}
}
