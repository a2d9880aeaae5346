//! The remap entry point and its three paths.

use crate::interpolate::resample_band;
use anyhow::{Result, ensure};
use ndarray::{Array2, Array3, s};
use rasterloom_core::errors::Error;
use rasterloom_core::{Footprint, Interpolation, MaskMode};

/// Nodata and interpolation policy of one remap call.
#[derive(Debug, Clone, Copy)]
pub struct RemapParams {
	/// Sentinel marking missing pixels in the source, if any.
	pub src_nodata: Option<f64>,
	/// Sentinel to write into destination pixels without source data.
	pub dst_nodata: f64,
	/// Mask behavior under resampling.
	pub mask_mode: MaskMode,
	/// `None` forbids the resampling path.
	pub interpolation: Option<Interpolation>,
}

/// Transform `array` and/or `mask` from the `src_fp` referential to the
/// `dst_fp` referential.
///
/// - equal footprints: identity,
/// - same grid: slicing into a `dst_nodata`-prefilled output,
/// - otherwise: resampling; `src_nodata` pixels are shielded so interpolation
///   does not bleed them into valid neighbors.
///
/// Arrays are `(rows, cols, channels)`; the mask is `(rows, cols)` with
/// `true` marking valid pixels.
pub fn remap(
	src_fp: &Footprint,
	dst_fp: &Footprint,
	array: Option<&Array3<f64>>,
	mask: Option<&Array2<bool>>,
	params: &RemapParams,
) -> Result<(Option<Array3<f64>>, Option<Array2<bool>>)> {
	ensure!(
		array.is_some() || mask.is_some(),
		Error::InvalidParameter("remap needs an array or a mask".to_string())
	);
	if let Some(array) = array {
		ensure!(
			(array.dim().0, array.dim().1) == src_fp.shape(),
			Error::InvalidParameter(format!(
				"array shape ({}, {}) does not match source shape {:?}",
				array.dim().0,
				array.dim().1,
				src_fp.shape(),
			))
		);
	}
	if let Some(mask) = mask {
		ensure!(
			mask.dim() == src_fp.shape(),
			Error::InvalidParameter(format!(
				"mask shape {:?} does not match source shape {:?}",
				mask.dim(),
				src_fp.shape(),
			))
		);
	}

	if src_fp.equals(dst_fp)? {
		return Ok((
			array.map(|a| convert_nodata(a.clone(), params)),
			mask.cloned(),
		));
	}
	if src_fp.same_grid(dst_fp)? {
		return remap_same_grid(src_fp, dst_fp, array, mask, params);
	}
	let Some(interpolation) = params.interpolation else {
		return Err(Error::InterpolationForbidden(format!(
			"remap from {src_fp} to {dst_fp} requires resampling"
		))
		.into());
	};
	remap_resample(src_fp, dst_fp, array, mask, params, interpolation)
}

/// Rewrite `src_nodata` pixels to `dst_nodata` when the sentinels differ.
fn convert_nodata(mut array: Array3<f64>, params: &RemapParams) -> Array3<f64> {
	if let Some(src_nodata) = params.src_nodata {
		if src_nodata != params.dst_nodata {
			array.mapv_inplace(|v| if v == src_nodata { params.dst_nodata } else { v });
		}
	}
	array
}

fn remap_same_grid(
	src_fp: &Footprint,
	dst_fp: &Footprint,
	array: Option<&Array3<f64>>,
	mask: Option<&Array2<bool>>,
	params: &RemapParams,
) -> Result<(Option<Array3<f64>>, Option<Array2<bool>>)> {
	let (rows, cols) = dst_fp.shape();
	let into = src_fp.slice_in(dst_fp, true)?;
	let from = dst_fp.slice_in(src_fp, true)?;

	let out_array = match array {
		None => None,
		Some(array) => {
			let channels = array.dim().2;
			let mut out = Array3::from_elem((rows, cols, channels), params.dst_nodata);
			if !into.is_empty() {
				out
					.slice_mut(s![into.y.clone(), into.x.clone(), ..])
					.assign(&array.slice(s![from.y.clone(), from.x.clone(), ..]));
			}
			Some(convert_nodata(out, params))
		}
	};
	let out_mask = match mask {
		None => None,
		Some(mask) => {
			let mut out = Array2::from_elem((rows, cols), false);
			if !into.is_empty() {
				out
					.slice_mut(s![into.y.clone(), into.x.clone()])
					.assign(&mask.slice(s![from.y, from.x]));
			}
			Some(out)
		}
	};
	Ok((out_array, out_mask))
}

fn remap_resample(
	src_fp: &Footprint,
	dst_fp: &Footprint,
	array: Option<&Array3<f64>>,
	mask: Option<&Array2<bool>>,
	params: &RemapParams,
	interpolation: Interpolation,
) -> Result<(Option<Array3<f64>>, Option<Array2<bool>>)> {
	let (mapx, mapy) = dst_fp.meshgrid_raster_in(src_fp);
	let (rows, cols) = dst_fp.shape();

	let out_array = match array {
		None => None,
		Some(array) => {
			let channels = array.dim().2;
			let mut out = Array3::from_elem((rows, cols, channels), params.dst_nodata);
			// resample the nodata indicator once; any contact with a nodata
			// source pixel (or with the outside) poisons the destination pixel
			let poisoned = params.src_nodata.map(|src_nodata| {
				let indicator =
					Array2::from_shape_fn((array.dim().0, array.dim().1), |p| {
						if array.slice(s![p.0, p.1, ..]).iter().any(|&v| v == src_nodata) {
							1.0
						} else {
							0.0
						}
					});
				resample_band(&indicator.view(), &mapx, &mapy, interpolation, 1.0)
			});
			for channel in 0..channels {
				let band = array.slice(s![.., .., channel]);
				let border = params.src_nodata.unwrap_or(0.0);
				let resampled = resample_band(&band, &mapx, &mapy, interpolation, border);
				let mut out_band = out.slice_mut(s![.., .., channel]);
				out_band.assign(&resampled);
				if let Some(poisoned) = &poisoned {
					ndarray::Zip::from(&mut out_band).and(poisoned).for_each(|v, &p| {
						if p != 0.0 {
							*v = params.dst_nodata;
						}
					});
				}
			}
			Some(out)
		}
	};

	let out_mask = match mask {
		None => None,
		Some(mask) => {
			let as_float = mask.mapv(|m| if m { 1.0 } else { 0.0 });
			let (border, keep): (f64, fn(f64) -> bool) = match params.mask_mode {
				MaskMode::Erode => (0.0, |v| v == 1.0),
				MaskMode::Dilate => (1.0, |v| v != 0.0),
			};
			let resampled = resample_band(&as_float.view(), &mapx, &mapy, interpolation, border);
			// under Dilate the constant border claims validity arbitrarily far
			// from the source; cap it at the kernel's actual reach
			let reach = interpolation.kernel_radius() as f64;
			let (h, w) = (mask.nrows() as f64, mask.ncols() as f64);
			let out = Array2::from_shape_fn((rows, cols), |p| {
				let within =
					mapx[p] >= -reach && mapx[p] <= w - 1.0 + reach && mapy[p] >= -reach && mapy[p] <= h - 1.0 + reach;
				within && keep(resampled[p])
			});
			Some(out)
		}
	};

	Ok((out_array, out_mask))
}
