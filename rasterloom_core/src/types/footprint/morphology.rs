//! Growing, shrinking and moving footprints.

use super::Footprint;
use crate::errors::Error;
use anyhow::{Result, ensure};

impl Footprint {
	/// Grow the footprint by `count` pixels on every side.
	pub fn dilate(&self, count: usize) -> Result<Footprint> {
		if count == 0 {
			return Ok(self.clone());
		}
		let c = count as f64;
		Footprint::from_affine(
			{
				let [a, b, _, d, e, _] = self.aff;
				let (cx, cy) = self.raster_to_spatial((-c, -c));
				[a, b, cx, d, e, cy]
			},
			(self.rsizex() + 2 * count, self.rsizey() + 2 * count),
		)
	}

	/// Shrink the footprint by `count` pixels on every side.
	///
	/// # Errors
	/// `Geometry` when nothing would remain.
	pub fn erode(&self, count: usize) -> Result<Footprint> {
		if count == 0 {
			return Ok(self.clone());
		}
		ensure!(
			self.rsizex() > 2 * count && self.rsizey() > 2 * count,
			Error::Geometry(format!(
				"eroding a ({}, {}) footprint by {count} pixels leaves nothing",
				self.rsizex(),
				self.rsizey()
			))
		);
		let c = count as f64;
		Footprint::from_affine(
			{
				let [a, b, _, d, e, _] = self.aff;
				let (cx, cy) = self.raster_to_spatial((c, c));
				[a, b, cx, d, e, cy]
			},
			(self.rsizex() - 2 * count, self.rsizey() - 2 * count),
		)
	}

	/// Move the footprint to a new location, keeping its pixel counts.
	///
	/// - `tl` alone translates the footprint;
	/// - `tl` + `tr` also rotates and rescales the x axis, deriving the y
	///   axis perpendicular with the previous aspect ratio;
	/// - `tl` + `tr` + `br` fixes all three corners; the corners must form a
	///   right angle at `tr` within the current precision.
	pub fn move_to(&self, tl: (f64, f64), tr: Option<(f64, f64)>, br: Option<(f64, f64)>) -> Result<Footprint> {
		let (rsx, rsy) = (self.rsizex() as f64, self.rsizey() as f64);
		let Some(tr) = tr else {
			ensure!(
				br.is_none(),
				Error::InvalidParameter("`br` requires `tr` in move_to".to_string())
			);
			let [a, b, _, d, e, _] = self.aff;
			return Footprint::from_affine([a, b, tl.0, d, e, tl.1], self.rsize());
		};

		let lr = (tr.0 - tl.0, tr.1 - tl.1);
		let lr_len = lr.0.hypot(lr.1);
		ensure!(
			lr_len > 0.0,
			Error::Geometry("move_to with tl == tr".to_string())
		);
		let tb = match br {
			None => {
				// perpendicular, preserving the previous aspect ratio and the
				// previous orientation (sign of the affine determinant)
				let ratio = {
					let (w, h) = self.size();
					w / h
				};
				let tb_len = lr_len / ratio;
				let [a, b, d, e] = [self.aff[0], self.aff[1], self.aff[3], self.aff[4]];
				let flip = if a * e - b * d < 0.0 { -1.0 } else { 1.0 };
				(
					-lr.1 / lr_len * tb_len * flip,
					lr.0 / lr_len * tb_len * flip,
				)
			}
			Some(br) => {
				let tb = (br.0 - tr.0, br.1 - tr.1);
				let tb_len = tb.0.hypot(tb.1);
				ensure!(
					tb_len > 0.0,
					Error::Geometry("move_to with tr == br".to_string())
				);
				// right angle at tr, within the slack the precision allows
				let largest = [tl, tr, br]
					.iter()
					.flat_map(|&(x, y)| [x.abs(), y.abs()])
					.fold(0.0_f64, f64::max);
				let precision = largest * 10f64.powf(-crate::env::significant());
				let deviation = (lr.0 * tb.0 + lr.1 * tb.1).abs() / lr_len;
				ensure!(
					deviation <= precision.max(f64::EPSILON * largest),
					Error::Geometry(format!(
						"move_to corners are not orthogonal: deviation {deviation} exceeds precision {precision}"
					))
				);
				tb
			}
		};
		Footprint::from_affine(
			[
				lr.0 / rsx,
				tb.0 / rsy,
				tl.0,
				lr.1 / rsx,
				tb.1 / rsy,
				tl.1,
			],
			self.rsize(),
		)
	}
}
