//! Per-channel schema: nodata, color interpretation, value offset/scale and
//! mask policy.

use crate::errors::Error;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Color interpretation of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelInterpretation {
	Undefined,
	GrayIndex,
	PaletteIndex,
	Red,
	Green,
	Blue,
	Alpha,
	Hue,
	Saturation,
	Lightness,
	Cyan,
	Magenta,
	Yellow,
	Black,
}

/// Mask policy of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMask {
	AllValid,
	PerDataset,
	Alpha,
	Nodata,
}

/// Schema of all channels of a raster. Vectors are indexed by channel.
///
/// Defaults per channel: no nodata, `Undefined` interpretation, offset `0`,
/// scale `1`, `AllValid` mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelsSchema {
	pub nodata: Vec<Option<f64>>,
	pub interpretation: Vec<ChannelInterpretation>,
	pub offset: Vec<f64>,
	pub scale: Vec<f64>,
	pub mask: Vec<ChannelMask>,
}

impl ChannelsSchema {
	/// The default schema for `channel_count` channels.
	pub fn default_for(channel_count: usize) -> ChannelsSchema {
		ChannelsSchema {
			nodata: vec![None; channel_count],
			interpretation: vec![ChannelInterpretation::Undefined; channel_count],
			offset: vec![0.0; channel_count],
			scale: vec![1.0; channel_count],
			mask: vec![ChannelMask::AllValid; channel_count],
		}
	}

	/// A default schema where every channel shares one nodata value.
	pub fn with_nodata(channel_count: usize, nodata: f64) -> ChannelsSchema {
		let mut schema = Self::default_for(channel_count);
		schema.nodata = vec![Some(nodata); channel_count];
		schema
	}

	pub fn channel_count(&self) -> usize {
		self.nodata.len()
	}

	/// Check internal consistency against the raster's channel count.
	pub fn validate(&self, channel_count: usize) -> Result<()> {
		let lengths = [
			self.nodata.len(),
			self.interpretation.len(),
			self.offset.len(),
			self.scale.len(),
			self.mask.len(),
		];
		if lengths.iter().any(|&l| l != channel_count) {
			return Err(Error::InvalidParameter(format!(
				"channels schema field lengths {lengths:?} do not all equal channel count {channel_count}"
			))
			.into());
		}
		for (i, &scale) in self.scale.iter().enumerate() {
			if scale == 0.0 || !scale.is_finite() {
				return Err(
					Error::InvalidParameter(format!("channel {i}: scale should be finite and non-zero, got {scale}")).into(),
				);
			}
		}
		for (i, mask) in self.mask.iter().enumerate() {
			if *mask == ChannelMask::Nodata && self.nodata[i].is_none() {
				return Err(
					Error::InvalidParameter(format!("channel {i}: mask policy is `nodata` but nodata is unset")).into(),
				);
			}
		}
		Ok(())
	}

	/// The raster-level nodata: channel 0's nodata value.
	///
	/// The engine treats nodata per raster (all channels of a sample share the
	/// sentinel); schemas with heterogeneous nodata are accepted for storage
	/// but the first channel's value rules the remapping.
	pub fn shared_nodata(&self) -> Option<f64> {
		self.nodata.first().copied().flatten()
	}
}
