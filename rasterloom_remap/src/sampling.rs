//! Deriving the source region a remap needs to read.

use anyhow::Result;
use rasterloom_core::errors::Error;
use rasterloom_core::{Footprint, Interpolation};

/// The footprint of `src_fp` that must be sampled to produce `dst_fp`.
///
/// - `None` when the two footprints share no area (the caller fills the
///   output with nodata),
/// - the plain overlap when the grids align,
/// - otherwise the destination dilated by the interpolation's support (in
///   source pixels, at least 2) and clipped to the source.
///
/// # Errors
/// `InterpolationForbidden` when resampling would be required but
/// `allow_interpolation` is false.
pub fn build_sampling_footprint(
	src_fp: &Footprint,
	dst_fp: &Footprint,
	interpolation: Interpolation,
	allow_interpolation: bool,
) -> Result<Option<Footprint>> {
	if !dst_fp.share_area(src_fp)? {
		return Ok(None);
	}
	if dst_fp.same_grid(src_fp)? {
		return Ok(Some(src_fp.intersection(dst_fp)?));
	}
	if !allow_interpolation {
		return Err(Error::InterpolationForbidden(format!(
			"footprint {dst_fp} does not lie on the grid of {src_fp}"
		))
		.into());
	}
	let dilate = interpolation.dilation_factor() * src_fp.pxsizex() / dst_fp.pxsizex();
	let dilate = dilate.ceil().max(2.0) as usize;
	let dilated = dst_fp.dilate(dilate)?;
	Ok(Some(src_fp.intersection(&dilated)?))
}
