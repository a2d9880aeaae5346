//! Scalar resampling over a coordinate map.
//!
//! The map gives, for every destination pixel, fractional source array
//! coordinates; integer values land on source pixel centers. Positions
//! outside the source read a constant border value, which is how nodata and
//! mask semantics reach the edges.

use ndarray::{Array2, ArrayView2};
use rasterloom_core::Interpolation;

/// Resample one band of `src` at the positions given by `mapx`/`mapy`.
///
/// `Area` degrades to `Linear` here: a coordinate map carries no pixel
/// extent, so a box filter is not defined for it. This matches the behavior
/// the rest of the pipeline is calibrated against.
pub fn resample_band(
	src: &ArrayView2<'_, f64>,
	mapx: &Array2<f64>,
	mapy: &Array2<f64>,
	interpolation: Interpolation,
	border_value: f64,
) -> Array2<f64> {
	let shape = (mapx.nrows(), mapx.ncols());
	match interpolation {
		Interpolation::Nearest => Array2::from_shape_fn(shape, |p| {
			let (x, y) = (mapx[p], mapy[p]);
			sample(src, x.round() as i64, y.round() as i64, border_value)
		}),
		Interpolation::Linear | Interpolation::Area => {
			Array2::from_shape_fn(shape, |p| bilinear(src, mapx[p], mapy[p], border_value))
		}
		Interpolation::Cubic => Array2::from_shape_fn(shape, |p| {
			convolve(src, mapx[p], mapy[p], border_value, 2, cubic_weight)
		}),
		Interpolation::Lanczos4 => Array2::from_shape_fn(shape, |p| {
			convolve(src, mapx[p], mapy[p], border_value, 4, lanczos4_weight)
		}),
	}
}

/// Read one source pixel, falling back to `border` outside.
#[inline]
fn sample(src: &ArrayView2<'_, f64>, x: i64, y: i64, border: f64) -> f64 {
	if x < 0 || y < 0 || x >= src.ncols() as i64 || y >= src.nrows() as i64 {
		border
	} else {
		src[(y as usize, x as usize)]
	}
}

#[inline]
fn bilinear(src: &ArrayView2<'_, f64>, x: f64, y: f64, border: f64) -> f64 {
	let x0 = x.floor();
	let y0 = y.floor();
	let fx = x - x0;
	let fy = y - y0;
	let (x0, y0) = (x0 as i64, y0 as i64);
	let v00 = sample(src, x0, y0, border);
	let v10 = sample(src, x0 + 1, y0, border);
	let v01 = sample(src, x0, y0 + 1, border);
	let v11 = sample(src, x0 + 1, y0 + 1, border);
	let top = v00 * (1.0 - fx) + v10 * fx;
	let bottom = v01 * (1.0 - fx) + v11 * fx;
	top * (1.0 - fy) + bottom * fy
}

/// Separable convolution with a kernel of the given half-width.
fn convolve(
	src: &ArrayView2<'_, f64>,
	x: f64,
	y: f64,
	border: f64,
	radius: i64,
	weight: fn(f64) -> f64,
) -> f64 {
	let x0 = x.floor() as i64;
	let y0 = y.floor() as i64;
	let mut acc = 0.0;
	let mut wsum = 0.0;
	for dy in (1 - radius)..=radius {
		let sy = y0 + dy;
		let wy = weight(y - sy as f64);
		if wy == 0.0 {
			continue;
		}
		for dx in (1 - radius)..=radius {
			let sx = x0 + dx;
			let wx = weight(x - sx as f64);
			if wx == 0.0 {
				continue;
			}
			acc += wx * wy * sample(src, sx, sy, border);
			wsum += wx * wy;
		}
	}
	if wsum == 0.0 { border } else { acc / wsum }
}

/// Keys bicubic kernel, a = -0.5.
fn cubic_weight(t: f64) -> f64 {
	const A: f64 = -0.5;
	let t = t.abs();
	if t < 1.0 {
		(A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
	} else if t < 2.0 {
		A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
	} else {
		0.0
	}
}

/// Four-lobe Lanczos kernel.
fn lanczos4_weight(t: f64) -> f64 {
	const A: f64 = 4.0;
	let t = t.abs();
	if t < 1e-12 {
		1.0
	} else if t < A {
		let pt = std::f64::consts::PI * t;
		A * pt.sin() * (pt / A).sin() / (pt * pt)
	} else {
		0.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use approx::assert_abs_diff_eq;
	use ndarray::array;
	use rstest::rstest;

	fn ramp() -> Array2<f64> {
		// value = x + y
		Array2::from_shape_fn((6, 6), |(j, i)| (i + j) as f64)
	}

	#[rstest]
	#[case(Interpolation::Nearest)]
	#[case(Interpolation::Linear)]
	#[case(Interpolation::Cubic)]
	#[case(Interpolation::Lanczos4)]
	fn identity_map_reproduces_source(#[case] interpolation: Interpolation) {
		let src = ramp();
		let mapx = Array2::from_shape_fn((6, 6), |(_, i)| i as f64);
		let mapy = Array2::from_shape_fn((6, 6), |(j, _)| j as f64);
		let out = resample_band(&src.view(), &mapx, &mapy, interpolation, -1.0);
		for (p, v) in out.indexed_iter() {
			assert_abs_diff_eq!(*v, src[p], epsilon = 1e-9);
		}
	}

	#[test]
	fn bilinear_interpolates_halfway() {
		let src = ramp();
		let mapx = array![[1.5]];
		let mapy = array![[2.5]];
		let out = resample_band(&src.view(), &mapx, &mapy, Interpolation::Linear, -1.0);
		assert_abs_diff_eq!(out[(0, 0)], 4.0, epsilon = 1e-12);
	}

	#[test]
	fn cubic_is_exact_on_linear_ramps() {
		// Keys' kernel reproduces degree-1 polynomials exactly
		let src = ramp();
		let mapx = array![[2.25, 3.75]];
		let mapy = array![[2.5, 2.5]];
		let out = resample_band(&src.view(), &mapx, &mapy, Interpolation::Cubic, 0.0);
		assert_abs_diff_eq!(out[(0, 0)], 4.75, epsilon = 1e-9);
		assert_abs_diff_eq!(out[(0, 1)], 6.25, epsilon = 1e-9);
	}

	#[test]
	fn out_of_bounds_reads_border() {
		let src = ramp();
		let mapx = array![[-10.0]];
		let mapy = array![[3.0]];
		for interpolation in [
			Interpolation::Nearest,
			Interpolation::Linear,
			Interpolation::Cubic,
			Interpolation::Lanczos4,
		] {
			let out = resample_band(&src.view(), &mapx, &mapy, interpolation, -99.0);
			assert_abs_diff_eq!(out[(0, 0)], -99.0, epsilon = 1e-9);
		}
	}
}
