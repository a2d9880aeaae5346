//! Storage dtypes.
//!
//! Pixels travel through the engine as `f64`; [`PixelDtype`] tags how a
//! raster stores them on disk (or how an in-memory raster presents them) and
//! drives encoding in the drivers.

use crate::errors::Error;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The storage dtype of a raster's pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelDtype {
	U8,
	U16,
	I16,
	U32,
	I32,
	F32,
	F64,
}

impl PixelDtype {
	/// Bytes per pixel per channel.
	pub fn size_bytes(self) -> usize {
		match self {
			PixelDtype::U8 => 1,
			PixelDtype::U16 | PixelDtype::I16 => 2,
			PixelDtype::U32 | PixelDtype::I32 | PixelDtype::F32 => 4,
			PixelDtype::F64 => 8,
		}
	}

	/// Stable one-byte code used by the grid file codec.
	pub fn code(self) -> u8 {
		match self {
			PixelDtype::U8 => 1,
			PixelDtype::U16 => 2,
			PixelDtype::I16 => 3,
			PixelDtype::U32 => 4,
			PixelDtype::I32 => 5,
			PixelDtype::F32 => 6,
			PixelDtype::F64 => 7,
		}
	}

	pub fn from_code(code: u8) -> Result<PixelDtype> {
		Ok(match code {
			1 => PixelDtype::U8,
			2 => PixelDtype::U16,
			3 => PixelDtype::I16,
			4 => PixelDtype::U32,
			5 => PixelDtype::I32,
			6 => PixelDtype::F32,
			7 => PixelDtype::F64,
			_ => return Err(Error::InvalidParameter(format!("unknown dtype code {code}")).into()),
		})
	}

	/// Whether values are stored as IEEE floats.
	pub fn is_float(self) -> bool {
		matches!(self, PixelDtype::F32 | PixelDtype::F64)
	}

	/// Bring an in-flight `f64` value into this dtype's representable range,
	/// rounding for integer dtypes. Used by drivers when encoding.
	pub fn quantize(self, value: f64) -> f64 {
		match self {
			PixelDtype::F64 => value,
			PixelDtype::F32 => value as f32 as f64,
			PixelDtype::U8 => value.round().clamp(0.0, f64::from(u8::MAX)),
			PixelDtype::U16 => value.round().clamp(0.0, f64::from(u16::MAX)),
			PixelDtype::I16 => value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)),
			PixelDtype::U32 => value.round().clamp(0.0, f64::from(u32::MAX)),
			PixelDtype::I32 => value.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)),
		}
	}
}

impl fmt::Display for PixelDtype {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			PixelDtype::U8 => "u8",
			PixelDtype::U16 => "u16",
			PixelDtype::I16 => "i16",
			PixelDtype::U32 => "u32",
			PixelDtype::I32 => "i32",
			PixelDtype::F32 => "f32",
			PixelDtype::F64 => "f64",
		};
		f.write_str(name)
	}
}

impl FromStr for PixelDtype {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<PixelDtype> {
		Ok(match s {
			"u8" | "uint8" => PixelDtype::U8,
			"u16" | "uint16" => PixelDtype::U16,
			"i16" | "int16" => PixelDtype::I16,
			"u32" | "uint32" => PixelDtype::U32,
			"i32" | "int32" => PixelDtype::I32,
			"f32" | "float32" => PixelDtype::F32,
			"f64" | "float64" => PixelDtype::F64,
			_ => return Err(Error::InvalidParameter(format!("unknown dtype '{s}'")).into()),
		})
	}
}

/// Dtype of raster indices returned by coordinate conversions.
///
/// Signed by default so that out-of-footprint positions can be expressed with
/// negative indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexDtype {
	I32,
	I64,
}

impl IndexDtype {
	/// Largest representable index magnitude.
	pub fn max_index(self) -> i64 {
		match self {
			IndexDtype::I32 => i64::from(i32::MAX),
			IndexDtype::I64 => i64::MAX,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	#[case(PixelDtype::U8)]
	#[case(PixelDtype::U16)]
	#[case(PixelDtype::I16)]
	#[case(PixelDtype::U32)]
	#[case(PixelDtype::I32)]
	#[case(PixelDtype::F32)]
	#[case(PixelDtype::F64)]
	fn code_roundtrip(#[case] dtype: PixelDtype) {
		assert_eq!(PixelDtype::from_code(dtype.code()).unwrap(), dtype);
		assert_eq!(dtype.to_string().parse::<PixelDtype>().unwrap(), dtype);
	}

	#[test]
	fn quantize_clamps_and_rounds() {
		assert_eq!(PixelDtype::U8.quantize(-3.0), 0.0);
		assert_eq!(PixelDtype::U8.quantize(255.7), 255.0);
		assert_eq!(PixelDtype::I16.quantize(12.49), 12.0);
		assert_eq!(PixelDtype::F64.quantize(12.49), 12.49);
	}

	#[test]
	fn unknown_code_is_rejected() {
		assert!(PixelDtype::from_code(0).is_err());
		assert!("i9".parse::<PixelDtype>().is_err());
	}
}
