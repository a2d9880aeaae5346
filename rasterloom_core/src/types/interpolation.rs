//! Interpolation and mask remapping policies.

use crate::errors::Error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resampling algorithm used when remapping between unaligned grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
	/// Box average when shrinking, bilinear when growing.
	Area,
	Nearest,
	Linear,
	Cubic,
	Lanczos4,
}

impl Interpolation {
	/// Dilation factor (in source pixels) used when deriving the sampling
	/// footprint of a resampling, before clipping to the source.
	pub fn dilation_factor(self) -> f64 {
		match self {
			Interpolation::Nearest => 1.0,
			Interpolation::Linear | Interpolation::Area => 2.0,
			Interpolation::Cubic | Interpolation::Lanczos4 => 4.0,
		}
	}

	/// Half width of the kernel support, in source pixels.
	pub fn kernel_radius(self) -> usize {
		match self {
			Interpolation::Nearest => 1,
			Interpolation::Linear | Interpolation::Area => 1,
			Interpolation::Cubic => 2,
			Interpolation::Lanczos4 => 4,
		}
	}
}

impl Default for Interpolation {
	fn default() -> Self {
		Interpolation::Area
	}
}

impl fmt::Display for Interpolation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Interpolation::Area => "area",
			Interpolation::Nearest => "nearest",
			Interpolation::Linear => "linear",
			Interpolation::Cubic => "cubic",
			Interpolation::Lanczos4 => "lanczos4",
		};
		f.write_str(name)
	}
}

impl FromStr for Interpolation {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Interpolation> {
		Ok(match s {
			"area" => Interpolation::Area,
			"nearest" => Interpolation::Nearest,
			"linear" => Interpolation::Linear,
			"cubic" => Interpolation::Cubic,
			"lanczos4" => Interpolation::Lanczos4,
			_ => return Err(Error::InvalidParameter(format!("unknown interpolation '{s}'")).into()),
		})
	}
}

/// How a boolean validity mask behaves under resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskMode {
	/// A destination pixel is valid only when fully covered by valid sources.
	Erode,
	/// A destination pixel is valid on any contact with a valid source.
	Dilate,
}
