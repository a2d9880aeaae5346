//! Rasterloom: lazy, parallel, tiled access to geospatial raster data.
//!
//! Register raster sources on a [`Dataset`] — stored files, in-memory
//! arrays, or *recipes* that compute pixels on demand — and query them
//! through [`Footprint`]s. The library reads, computes, remaps, caches,
//! parallelizes and back-pressures the work for you.
//!
//! ```no_run
//! use rasterloom::{Dataset, DatasetConfig, Footprint};
//!
//! # fn main() -> anyhow::Result<()> {
//! let ds = Dataset::new(DatasetConfig::default())?;
//! let dsm = ds.open_raster(Some("dsm"), "dsm.tif", Default::default())?;
//! let fp = Footprint::new((0.0, 1024.0), (1.0, -1.0), (512, 512))?;
//! let heights = dsm.get_data(&fp, Default::default())?;
//! println!("max height: {}", heights.iter().cloned().fold(f64::MIN, f64::max));
//! ds.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The heavy lifting lives in `rasterloom_engine` (scheduler, actors, file
//! cache), `rasterloom_remap` (the pixel remapping kernel) and
//! `rasterloom_core` (the [`Footprint`] toolbox and the scoped [`env`]
//! option stack).

mod dataset;
mod raster;
mod recipe;
mod sr;

pub use dataset::{Dataset, DatasetConfig, PoolRef};
pub use raster::{DataIterator, OpenOptions, QueryOptions, Raster, RasterMode};
pub use recipe::{CacheParams, CachedRecipeParams, PrimitiveSpec, RecipeParams};
pub use sr::{CoordTransform, IdentityProvider, SpatialReferenceProvider};

pub use rasterloom_core::env;
pub use rasterloom_core::errors::Error;
pub use rasterloom_core::{
	BoundaryEffect, ChannelInterpretation, ChannelMask, ChannelsSchema, Footprint, Interpolation, PixelDtype,
};
pub use rasterloom_engine::{DebugObserver, Driver, DriverHandle, GridDriver, PrimitiveInputs};
