//! The pure remapping kernel: moving pixels between two [`Footprint`]
//! referentials.
//!
//! [`remap`] is stateless and picks one of three paths:
//! 1. equal footprints — identity,
//! 2. same grid — index slicing into a nodata-prefilled destination,
//! 3. anything else — resampling over the destination's pixel positions
//!    expressed in source raster coordinates.
//!
//! [`build_sampling_footprint`] derives the source region a resampling needs,
//! dilated per interpolation and clipped to the source.
//!
//! [`Footprint`]: rasterloom_core::Footprint

mod interpolate;
mod kernel;
mod sampling;

pub use kernel::{RemapParams, remap};
pub use sampling::build_sampling_footprint;
