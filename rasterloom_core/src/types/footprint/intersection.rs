//! Footprint intersection under scale/alignment policies.

use super::Footprint;
use crate::errors::Error;
use anyhow::{Result, ensure};

/// Which pixel scale the intersection result adopts.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScalePolicy {
	/// The first footprint's scale.
	#[default]
	First,
	/// The coarsest scale among the inputs.
	Lowest,
	/// The finest scale among the inputs.
	Highest,
	/// An explicit signed scale `(sx > 0, sy < 0)`.
	Custom((f64, f64)),
}

/// Which grid the intersection result aligns to.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AlignmentPolicy {
	/// The grid of the footprint that provided the scale.
	#[default]
	Auto,
	/// An explicit grid anchor point.
	Custom((f64, f64)),
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntersectionOptions {
	pub scale: ScalePolicy,
	pub alignment: AlignmentPolicy,
	/// Require every input to lie on the result's grid.
	pub homogeneous: bool,
}

impl Footprint {
	/// Minimal footprint bounding the intersection of `self` and `other`,
	/// on `self`'s grid.
	pub fn intersection(&self, other: &Footprint) -> Result<Footprint> {
		Footprint::intersection_of(&[self, other], &IntersectionOptions::default())
	}

	/// Minimal footprint bounding the intersection of all `fps`, under the
	/// given scale/alignment policies.
	///
	/// # Errors
	/// - `Geometry` when fewer than one input, inputs are rotated, or the
	///   intersection is empty or touching-only,
	/// - `GridMismatch` when `homogeneous` is set and some input does not lie
	///   on the result's grid.
	pub fn intersection_of(fps: &[&Footprint], options: &IntersectionOptions) -> Result<Footprint> {
		ensure!(
			!fps.is_empty(),
			Error::Geometry("intersection of zero footprints".to_string())
		);
		for fp in fps {
			ensure!(
				fp.angle().abs() < 1e-9,
				Error::Geometry(format!(
					"intersection of rotated footprints is not supported (angle {})",
					fp.angle()
				))
			);
		}

		// intersect extents
		let mut minx = f64::NEG_INFINITY;
		let mut maxx = f64::INFINITY;
		let mut miny = f64::NEG_INFINITY;
		let mut maxy = f64::INFINITY;
		for fp in fps {
			let (x0, x1, y0, y1) = fp.extent();
			minx = minx.max(x0);
			maxx = maxx.min(x1);
			miny = miny.max(y0);
			maxy = maxy.min(y1);
		}
		let precision = fps
			.iter()
			.map(|fp| fp.spatial_precision())
			.fold(0.0_f64, f64::max);
		ensure!(
			maxx - minx > precision && maxy - miny > precision,
			Error::Geometry(format!(
				"footprints do not intersect (intersection extent ({minx}, {maxx}, {miny}, {maxy}))"
			))
		);

		// resolve scale and its reference footprint
		let (scale, reference) = match options.scale {
			ScalePolicy::First => (fps[0].scale(), Some(fps[0])),
			ScalePolicy::Lowest => {
				let fp = fps
					.iter()
					.max_by(|a, b| a.pxsizex().total_cmp(&b.pxsizex()))
					.unwrap();
				(fp.scale(), Some(*fp))
			}
			ScalePolicy::Highest => {
				let fp = fps
					.iter()
					.min_by(|a, b| a.pxsizex().total_cmp(&b.pxsizex()))
					.unwrap();
				(fp.scale(), Some(*fp))
			}
			ScalePolicy::Custom(scale) => {
				ensure!(
					scale.0 > 0.0 && scale.1 < 0.0,
					Error::InvalidParameter(format!("custom scale should be (+x, -y), got {scale:?}"))
				);
				(scale, None)
			}
		};
		let anchor = match options.alignment {
			AlignmentPolicy::Auto => match reference {
				Some(fp) => fp.tl(),
				// a custom scale with no anchor aligns on the origin
				None => (0.0, 0.0),
			},
			AlignmentPolicy::Custom(p) => p,
		};

		// expand the intersection outward onto the reference grid
		let (pxw, pxh) = (scale.0.abs(), scale.1.abs());
		let left = anchor.0 + snap_floor((minx - anchor.0) / pxw) * pxw;
		let right = anchor.0 + snap_ceil((maxx - anchor.0) / pxw) * pxw;
		let top = anchor.1 - snap_floor((anchor.1 - maxy) / pxh) * pxh;
		let bottom = anchor.1 - snap_ceil((anchor.1 - miny) / pxh) * pxh;
		let rsizex = ((right - left) / pxw).round() as usize;
		let rsizey = ((top - bottom) / pxh).round() as usize;
		let result = Footprint::new((left, top), scale, (rsizex, rsizey))?;

		if options.homogeneous {
			for fp in fps {
				ensure!(
					fp.same_grid(&result)?,
					Error::GridMismatch(format!(
						"homogeneous intersection requested but {fp} does not lie on the result grid"
					))
				);
			}
		}
		Ok(result)
	}
}

/// `floor` that forgives float dust just below a whole number.
fn snap_floor(v: f64) -> f64 {
	let r = v.round();
	if (v - r).abs() < 1e-9 * r.abs().max(1.0) { r } else { v.floor() }
}

/// `ceil` that forgives float dust just above a whole number.
fn snap_ceil(v: f64) -> f64 {
	let r = v.round();
	if (v - r).abs() < 1e-9 * r.abs().max(1.0) { r } else { v.ceil() }
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fp() -> Footprint {
		Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap()
	}

	#[test]
	fn aligned_intersection_is_overlap() {
		let a = fp();
		let b = Footprint::new((3.0, 7.0), (1.0, -1.0), (10, 10)).unwrap();
		let i = a.intersection(&b).unwrap();
		assert_eq!(i.tl(), (3.0, 7.0));
		assert_eq!(i.rsize(), (7, 7));
		assert!(i.same_grid(&a).unwrap());
	}

	#[test]
	fn unaligned_intersection_bounds_overlap_on_first_grid() {
		let a = fp();
		let b = Footprint::new((3.5, 7.5), (1.0, -1.0), (10, 10)).unwrap();
		let i = a.intersection(&b).unwrap();
		// bounding the overlap [3.5, 10]x[0, 7.5] on a's grid
		assert_eq!(i.tl(), (3.0, 8.0));
		assert_eq!(i.br(), (10.0, 0.0));
		assert!(i.same_grid(&a).unwrap());
	}

	#[test]
	fn empty_and_touching_intersections_fail() {
		let a = fp();
		let apart = Footprint::new((50.0, 10.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(a.intersection(&apart).is_err());
		let touching = Footprint::new((10.0, 10.0), (1.0, -1.0), (5, 5)).unwrap();
		assert!(a.intersection(&touching).is_err());
	}

	#[test]
	fn scale_policies() {
		let a = fp();
		let coarse = Footprint::new((0.0, 10.0), (2.0, -2.0), (5, 5)).unwrap();
		let low = Footprint::intersection_of(
			&[&a, &coarse],
			&IntersectionOptions {
				scale: ScalePolicy::Lowest,
				..Default::default()
			},
		)
		.unwrap();
		assert_eq!(low.scale(), (2.0, -2.0));
		let high = Footprint::intersection_of(
			&[&a, &coarse],
			&IntersectionOptions {
				scale: ScalePolicy::Highest,
				..Default::default()
			},
		)
		.unwrap();
		assert_eq!(high.scale(), (1.0, -1.0));
	}

	#[test]
	fn homogeneous_detects_grid_mismatch() {
		let a = fp();
		let off = Footprint::new((3.5, 7.0), (1.0, -1.0), (10, 10)).unwrap();
		let err = Footprint::intersection_of(
			&[&a, &off],
			&IntersectionOptions {
				homogeneous: true,
				..Default::default()
			},
		)
		.unwrap_err();
		assert!(matches!(
			crate::errors::Error::of(&err),
			Some(crate::errors::Error::GridMismatch(_))
		));
	}
}
