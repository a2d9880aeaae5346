//! Footprint constructors and derived-footprint helpers.

use super::Footprint;
use crate::env;
use crate::errors::Error;
use anyhow::{Result, ensure};

impl Footprint {
	/// Create a footprint from raw affine coefficients `(a, b, c, d, e, f)`
	/// mapping raster indices to spatial coordinates.
	///
	/// # Errors
	/// - `rsize` has a zero component,
	/// - the transform is singular or non-finite,
	/// - the grid is rotated or not north-up/west-left while
	///   `allow_complex_footprint` is unset,
	/// - the current `significant` cannot resolve one pixel at these
	///   coordinates.
	pub fn from_affine(aff: [f64; 6], rsize: (usize, usize)) -> Result<Footprint> {
		let [a, b, _c, d, e, _f] = aff;
		ensure!(
			rsize.0 > 0 && rsize.1 > 0,
			Error::Config(format!("rsize should be > 0, got ({}, {})", rsize.0, rsize.1))
		);
		ensure!(
			aff.iter().all(|v| v.is_finite()),
			Error::Config(format!("affine coefficients should be finite, got {aff:?}"))
		);
		let det = a * e - b * d;
		ensure!(
			det != 0.0,
			Error::Config(format!("affine transform is singular: {aff:?}"))
		);
		if !env::allow_complex_footprint() {
			ensure!(
				b == 0.0 && d == 0.0 && a > 0.0 && e < 0.0,
				Error::Config(format!(
					"footprint is not north-up/west-left (affine {aff:?}); \
					 scope `allow_complex_footprint` to allow it"
				))
			);
		} else if b != 0.0 || d != 0.0 {
			log::warn!("creating a non north-up/west-left footprint, affine: {aff:?}");
		}

		let fp = Footprint {
			aff,
			rsize: [rsize.0, rsize.1],
			significant_min: 0.0,
		};
		let fp = Footprint {
			significant_min: significant_min_of(&fp),
			..fp
		};
		ensure!(
			env::significant() > fp.significant_min,
			Error::Config(format!(
				"`significant` of value {} should be greater than {} for this footprint",
				env::significant(),
				fp.significant_min,
			))
		);
		Ok(fp)
	}

	/// Create a north-up footprint from its top-left corner, signed pixel
	/// scale `(sx > 0, sy < 0)` and pixel size.
	///
	/// # Example
	/// ```
	/// # use rasterloom_core::Footprint;
	/// let fp = Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
	/// assert_eq!(fp.tl(), (0.0, 10.0));
	/// assert_eq!(fp.br(), (10.0, 0.0));
	/// ```
	pub fn new(tl: (f64, f64), scale: (f64, f64), rsize: (usize, usize)) -> Result<Footprint> {
		ensure!(
			scale.0 != 0.0 && scale.1 != 0.0,
			Error::Config(format!("scale should be non-zero, got {scale:?}"))
		);
		Footprint::from_affine([scale.0, 0.0, tl.0, 0.0, scale.1, tl.1], rsize)
	}

	/// Create a footprint from a GDAL-ordered geotransform
	/// `(c, a, b, f, d, e)`.
	pub fn from_gt(gt: [f64; 6], rsize: (usize, usize)) -> Result<Footprint> {
		let [c, a, b, f, d, e] = gt;
		Footprint::from_affine([a, b, c, d, e, f], rsize)
	}

	/// Create a footprint from a rectangle extent `(minx, maxx, miny, maxy)`
	/// and a pixel scale.
	///
	/// The pixel count is derived from the extent; the extent is trusted up to
	/// the current precision (a `10.0000…1` wide extent at scale 1 gives 10
	/// pixels, not 11).
	pub fn of_extent(extent: (f64, f64, f64, f64), scale: (f64, f64)) -> Result<Footprint> {
		let (minx, maxx, miny, maxy) = extent;
		ensure!(
			[minx, maxx, miny, maxy].iter().all(|v| v.is_finite()),
			Error::Config(format!("invalid extent value {extent:?}"))
		);
		ensure!(
			minx != maxx && miny != maxy,
			Error::Config(format!("empty extent {extent:?}"))
		);
		ensure!(
			scale.0 != 0.0 && scale.1 != 0.0,
			Error::Config(format!("scale should be non-zero, got {scale:?}"))
		);
		let pxw = scale.0.abs();
		let pxh = scale.1.abs();
		let largest = [minx.abs(), maxx.abs(), miny.abs(), maxy.abs()]
			.into_iter()
			.fold(0.0_f64, f64::max);
		// Snap the pixel counts onto the abstract grid before rounding, so
		// that float dust in the extent does not add or drop a pixel.
		let density = grid_density(largest, pxw.min(pxh));
		let countx = snap(( maxx - minx) / pxw, density).round();
		let county = snap((maxy - miny) / pxh, density).round();
		ensure!(
			countx >= 1.0 && county >= 1.0,
			Error::Config(format!("extent {extent:?} is smaller than one pixel at scale {scale:?}"))
		);
		Footprint::new(
			(minx, maxy),
			(pxw, -pxh),
			(countx as usize, county as usize),
		)
	}

	/// A sub-footprint by pixel indices of `self`: origin `(x0, y0)`
	/// (inclusive) to `(x1, y1)` (exclusive).
	pub fn clip(&self, x0: isize, y0: isize, x1: isize, y1: isize) -> Result<Footprint> {
		ensure!(
			x1 > x0 && y1 > y0,
			Error::Geometry(format!("empty clip ({x0}, {y0}, {x1}, {y1})"))
		);
		Ok(self.translated_px(x0 as f64, y0 as f64, ((x1 - x0) as usize, (y1 - y0) as usize)))
	}

	/// A footprint sharing `self`'s grid vectors, with its top-left at
	/// `self`'s raster position `(dx, dy)` and the given pixel size.
	///
	/// Infallible: the parent already passed construction checks and the
	/// derived coordinates stay in the same order of magnitude.
	pub(crate) fn translated_px(&self, dx: f64, dy: f64, rsize: (usize, usize)) -> Footprint {
		let [a, b, _, d, e, _] = self.aff;
		let (cx, cy) = self.raster_to_spatial((dx, dy));
		let fp = Footprint {
			aff: [a, b, cx, d, e, cy],
			rsize: [rsize.0, rsize.1],
			significant_min: 0.0,
		};
		Footprint {
			significant_min: significant_min_of(&fp),
			..fp
		}
	}
}

/// `-log10(smallest_pixel / largest_coord)`: the number of digits needed to
/// tell one pixel apart at these coordinates.
fn significant_min_of(fp: &Footprint) -> f64 {
	let largest = fp
		.coords()
		.iter()
		.flat_map(|&(x, y)| [x.abs(), y.abs()])
		.fold(0.0_f64, f64::max);
	if largest == 0.0 {
		return 0.0;
	}
	let (pxw, pxh) = fp.pxsize();
	-(pxw.min(pxh) / largest).log10()
}

/// Density of the abstract grid onto which raster coordinates are snapped
/// before integer conversions.
pub(super) fn grid_density(largest_coord: f64, smallest_reso: f64) -> f64 {
	let spatial_precision = largest_coord * 10f64.powf(-env::significant());
	if spatial_precision == 0.0 {
		return 0.0;
	}
	(smallest_reso / spatial_precision).floor()
}

/// Round `value` onto a grid of the given density; identity when the density
/// is degenerate.
pub(super) fn snap(value: f64, density: f64) -> f64 {
	if density <= 0.0 || !density.is_finite() {
		value
	} else {
		(value * density).round() / density
	}
}

#[cfg(test)]
mod tests {
	use super::super::Footprint;
	use crate::env::Env;

	#[test]
	fn new_rejects_degenerate_inputs() {
		assert!(Footprint::new((0.0, 10.0), (0.0, -1.0), (10, 10)).is_err());
		assert!(Footprint::new((0.0, 10.0), (1.0, -1.0), (0, 10)).is_err());
		assert!(Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 0)).is_err());
		assert!(Footprint::from_affine([1.0, 0.0, 0.0, 0.0, f64::NAN, 10.0], (1, 1)).is_err());
	}

	#[test]
	fn complex_footprints_are_gated() {
		// rotated
		let aff = [0.0, 1.0, 0.0, 1.0, 0.0, 0.0];
		assert!(Footprint::from_affine(aff, (5, 5)).is_err());
		let _guard = Env::new().allow_complex_footprint(true).scoped().unwrap();
		Footprint::from_affine(aff, (5, 5)).unwrap();
	}

	#[test]
	fn gt_order_matches_gdal() {
		let fp = Footprint::from_gt([100.0, 2.0, 0.0, 50.0, 0.0, -2.0], (4, 3)).unwrap();
		assert_eq!(fp.tl(), (100.0, 50.0));
		assert_eq!(fp.scale(), (2.0, -2.0));
		assert_eq!(fp.gt(), [100.0, 2.0, 0.0, 50.0, 0.0, -2.0]);
	}

	#[test]
	fn of_extent_derives_pixel_counts() {
		let fp = Footprint::of_extent((0.0, 10.0, 0.0, 10.0), (1.0, -1.0)).unwrap();
		assert_eq!(fp.rsize(), (10, 10));
		assert_eq!(fp.tl(), (0.0, 10.0));

		// a hair of float dust must not add a pixel
		let fp = Footprint::of_extent((0.0, 10.0 + 1e-9, 0.0, 10.0), (1.0, -1.0)).unwrap();
		assert_eq!(fp.rsize(), (10, 10));
	}

	#[test]
	fn clip_selects_pixels() {
		let fp = Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
		let sub = fp.clip(3, 3, 7, 7).unwrap();
		assert_eq!(sub.rsize(), (4, 4));
		assert_eq!(sub.tl(), (3.0, 7.0));
		assert!(fp.clip(3, 3, 3, 7).is_err());
	}

	#[test]
	fn significant_guard_at_construction() {
		// one-millimeter pixels a thousand kilometers from the origin need
		// more than 9 digits
		let r = Footprint::new((1_000_000_000.0, 10.0), (0.001, -0.001), (10, 10));
		assert!(r.is_err());
		let _guard = Env::new().significant(14.0).scoped().unwrap();
		Footprint::new((1_000_000_000.0, 10.0), (0.001, -0.001), (10, 10)).unwrap();
	}
}
