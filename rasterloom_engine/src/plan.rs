//! The query planner: a pure function from production footprints to the
//! work a query needs.
//!
//! The plan is computed once, when the query reaches the scheduler, and then
//! shared read-only by every actor that touches the query.

use crate::raster::{RasterSpec, TileCoord2};
use anyhow::{Result, ensure};
use itertools::Itertools;
use rasterloom_core::errors::Error;
use rasterloom_core::{BoundaryEffect, Footprint, Interpolation};
use rasterloom_remap::build_sampling_footprint;
use std::collections::HashMap;

/// One resampling pass of one production.
#[derive(Debug, Clone)]
pub struct ResamplePlan {
	/// Destination sub-footprint (a piece of the production footprint).
	pub fp: Footprint,
	/// Source region this piece reads from; `None` for all-nodata pieces.
	pub sample_fp: Option<Footprint>,
}

/// Everything the planner derived for one production footprint.
#[derive(Debug, Clone)]
pub struct ProdPlan {
	pub fp: Footprint,
	pub same_grid: bool,
	pub share_area: bool,
	/// Union of the source pixels this production needs; `None` when the
	/// production lies fully outside the raster.
	pub sample_fp: Option<Footprint>,
	/// Cache tiles overlapping `sample_fp` (cached rasters only).
	pub cache_tiles: Vec<TileCoord2>,
	/// Computation tiles overlapping `sample_fp` (uncached rasters only).
	pub compute_tiles: Vec<TileCoord2>,
	/// At least one entry; several when `max_resampling_size` splits the
	/// production.
	pub resamples: Vec<ResamplePlan>,
}

/// The immutable plan of one query.
#[derive(Debug)]
pub struct QueryPlan {
	pub prods: Vec<ProdPlan>,
	/// Distinct cache tiles needed, earliest-needed first.
	pub cache_list: Vec<TileCoord2>,
	/// Inverse index: cache tile to the productions that wait on it.
	pub cache_to_prods: HashMap<TileCoord2, Vec<usize>>,
	pub channels: Vec<usize>,
	pub dst_nodata: f64,
	pub interpolation: Interpolation,
	pub max_queue_size: usize,
}

impl QueryPlan {
	pub fn build(
		spec: &RasterSpec,
		fps: &[Footprint],
		channels: Vec<usize>,
		dst_nodata: Option<f64>,
		interpolation: Interpolation,
		max_queue_size: usize,
	) -> Result<QueryPlan> {
		ensure!(
			!fps.is_empty(),
			Error::InvalidParameter("a query needs at least one footprint".to_string())
		);
		ensure!(
			!channels.is_empty(),
			Error::InvalidParameter("a query needs at least one channel".to_string())
		);
		for &c in &channels {
			ensure!(
				c < spec.channel_count,
				Error::InvalidParameter(format!(
					"channel {c} out of range (raster has {})",
					spec.channel_count
				))
			);
		}
		let dst_nodata = dst_nodata.or(spec.nodata()).unwrap_or(0.0);

		let mut prods = Vec::with_capacity(fps.len());
		for prod_fp in fps {
			prods.push(plan_one(spec, prod_fp, interpolation)?);
		}

		// distinct cache tiles, in the order the productions need them
		let cache_list: Vec<TileCoord2> = prods
			.iter()
			.flat_map(|p| p.cache_tiles.iter().copied())
			.unique()
			.collect();
		let mut cache_to_prods: HashMap<TileCoord2, Vec<usize>> = HashMap::new();
		for (i, prod) in prods.iter().enumerate() {
			for &tile in &prod.cache_tiles {
				cache_to_prods.entry(tile).or_default().push(i);
			}
		}

		Ok(QueryPlan {
			prods,
			cache_list,
			cache_to_prods,
			channels,
			dst_nodata,
			interpolation,
			max_queue_size: max_queue_size.max(1),
		})
	}

	/// The first production index that needs `tile`; drives job priorities.
	pub fn priority_of_tile(&self, tile: TileCoord2) -> usize {
		self
			.cache_to_prods
			.get(&tile)
			.and_then(|prods| prods.first().copied())
			.unwrap_or(usize::MAX)
	}
}

fn plan_one(spec: &RasterSpec, prod_fp: &Footprint, interpolation: Interpolation) -> Result<ProdPlan> {
	let same_grid = prod_fp.same_grid(&spec.fp)?;
	let share_area = prod_fp.share_area(&spec.fp)?;

	if !share_area {
		// the output will be all nodata; one scheduler-side pass
		return Ok(ProdPlan {
			fp: prod_fp.clone(),
			same_grid,
			share_area,
			sample_fp: None,
			cache_tiles: vec![],
			compute_tiles: vec![],
			resamples: vec![ResamplePlan {
				fp: prod_fp.clone(),
				sample_fp: None,
			}],
		});
	}

	ensure!(
		spec.automatic_remapping || same_grid,
		Error::GridMismatch(format!(
			"raster has `automatic_remapping` disabled and {prod_fp} does not lie on its grid"
		))
	);

	let (sample_fp, resamples) = if same_grid {
		let sample_fp = spec.fp.intersection(prod_fp)?;
		let resamples = vec![ResamplePlan {
			fp: prod_fp.clone(),
			sample_fp: Some(sample_fp.clone()),
		}];
		(sample_fp, resamples)
	} else {
		let sample_fp = build_sampling_footprint(&spec.fp, prod_fp, interpolation, spec.allow_interpolation)?
			.expect("share_area implies a sampling footprint");
		let resamples = match spec.max_resampling_size {
			None => vec![ResamplePlan {
				fp: prod_fp.clone(),
				sample_fp: Some(sample_fp.clone()),
			}],
			Some(limit) => {
				let (pw, ph) = prod_fp.rsize();
				let (sw, sh) = sample_fp.rsize();
				let countx = pw.max(sw).div_ceil(limit);
				let county = ph.max(sh).div_ceil(limit);
				if countx <= 1 && county <= 1 {
					vec![ResamplePlan {
						fp: prod_fp.clone(),
						sample_fp: Some(sample_fp.clone()),
					}]
				} else {
					let tiles = prod_fp.tile_count((countx.max(1), county.max(1)), BoundaryEffect::Shrink)?;
					let mut resamples = Vec::new();
					for sub_fp in tiles.into_iter().flatten() {
						let sub_sample =
							build_sampling_footprint(&spec.fp, &sub_fp, interpolation, spec.allow_interpolation)?;
						resamples.push(ResamplePlan {
							fp: sub_fp,
							sample_fp: sub_sample,
						});
					}
					resamples
				}
			}
		};
		(sample_fp, resamples)
	};

	let (cache_tiles, compute_tiles) = match &spec.cache {
		Some(cache) => (cache.tiles.coords_overlapping(&sample_fp)?, vec![]),
		None => (vec![], spec.computation_tiles.coords_overlapping(&sample_fp)?),
	};

	Ok(ProdPlan {
		fp: prod_fp.clone(),
		same_grid,
		share_area,
		sample_fp: Some(sample_fp),
		cache_tiles,
		compute_tiles,
		resamples,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::observers::DebugManager;
	use crate::raster::{CacheConfig, PoolBinding, PoolKind, TileGrid};
	use ndarray::Array3;
	use rasterloom_core::{ChannelsSchema, PixelDtype};
	use std::sync::Arc;
	use uuid::Uuid;

	fn pool(key: u64) -> PoolBinding {
		PoolBinding {
			key,
			name: format!("pool{key}"),
			kind: PoolKind::Inline,
		}
	}

	fn spec(cached: bool, max_resampling_size: Option<usize>) -> RasterSpec {
		let fp = Footprint::new((0.0, 100.0), (1.0, -1.0), (100, 100)).unwrap();
		let tiles =
			TileGrid::new(fp.tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap()).unwrap();
		RasterSpec {
			uid: Uuid::new_v4(),
			fp: fp.clone(),
			dtype: PixelDtype::F64,
			channel_count: 2,
			schema: ChannelsSchema::with_nodata(2, -99.0),
			wkt: None,
			compute: Arc::new(|_, _| Ok(Array3::zeros((1, 1, 1)))),
			merge: None,
			primitives: vec![],
			computation_tiles: tiles.clone(),
			cache: cached.then(|| CacheConfig {
				dir: std::path::PathBuf::from("/tmp/unused"),
				tiles,
				io_pool: pool(3),
			}),
			computation_pool: pool(0),
			merge_pool: pool(1),
			resample_pool: pool(2),
			max_resampling_size,
			automatic_remapping: true,
			allow_interpolation: true,
			debug: DebugManager::default(),
		}
	}

	#[test]
	fn outside_production_needs_nothing() {
		let spec = spec(true, None);
		let outside = Footprint::new((500.0, 500.0), (1.0, -1.0), (10, 10)).unwrap();
		let plan = QueryPlan::build(&spec, &[outside], vec![0], None, Interpolation::Area, 5).unwrap();
		let prod = &plan.prods[0];
		assert!(!prod.share_area);
		assert!(prod.sample_fp.is_none());
		assert!(prod.cache_tiles.is_empty());
		assert_eq!(prod.resamples.len(), 1);
		assert!(plan.cache_list.is_empty());
		// dst_nodata falls back to the raster's
		assert_eq!(plan.dst_nodata, -99.0);
	}

	#[test]
	fn same_grid_production_lists_its_tiles() {
		let spec = spec(true, None);
		let query = Footprint::new((10.0, 90.0), (1.0, -1.0), (20, 20)).unwrap();
		let plan = QueryPlan::build(&spec, &[query], vec![0, 1], None, Interpolation::Area, 5).unwrap();
		let prod = &plan.prods[0];
		assert!(prod.same_grid);
		// covers x 10..30, y 70..90: tiles (0..=1, 0..=1)
		assert_eq!(prod.cache_tiles.len(), 4);
		assert_eq!(plan.cache_list.len(), 4);
	}

	#[test]
	fn cache_priority_follows_production_order() {
		let spec = spec(true, None);
		let a = Footprint::new((60.0, 40.0), (1.0, -1.0), (10, 10)).unwrap();
		let b = Footprint::new((10.0, 90.0), (1.0, -1.0), (10, 10)).unwrap();
		let plan = QueryPlan::build(&spec, &[a, b], vec![0], None, Interpolation::Area, 5).unwrap();
		// a's tiles first, then b's
		assert_eq!(plan.cache_list.first(), plan.prods[0].cache_tiles.first());
		assert!(plan.cache_to_prods[&plan.prods[0].cache_tiles[0]].contains(&0));
		assert!(plan.cache_to_prods[&plan.prods[1].cache_tiles[0]].contains(&1));
		assert_eq!(plan.priority_of_tile(plan.prods[1].cache_tiles[0]), 1);
	}

	#[test]
	fn shared_tiles_are_deduplicated() {
		let spec = spec(true, None);
		let a = Footprint::new((10.0, 90.0), (1.0, -1.0), (10, 10)).unwrap();
		let b = Footprint::new((12.0, 88.0), (1.0, -1.0), (10, 10)).unwrap();
		let plan = QueryPlan::build(&spec, &[a, b], vec![0], None, Interpolation::Area, 5).unwrap();
		// both productions live in tile (0, 0) plus b touching (0, 1)
		assert!(plan.cache_list.len() < plan.prods[0].cache_tiles.len() + plan.prods[1].cache_tiles.len());
		let first = plan.cache_list[0];
		assert_eq!(plan.cache_to_prods[&first], vec![0, 1]);
	}

	#[test]
	fn resampling_split_respects_the_limit() {
		let spec = spec(true, Some(25));
		// half-pixel shift, 60x60: must split into ceil(60/25) = 3 per axis
		let query = Footprint::new((10.5, 90.5), (1.0, -1.0), (60, 60)).unwrap();
		let plan = QueryPlan::build(&spec, &[query], vec![0], None, Interpolation::Linear, 5).unwrap();
		let prod = &plan.prods[0];
		assert!(!prod.same_grid);
		assert_eq!(prod.resamples.len(), 9);
		for r in &prod.resamples {
			assert!(r.fp.rsizex() <= 25 && r.fp.rsizey() <= 25);
			let sample = r.sample_fp.as_ref().unwrap();
			assert!(sample.same_grid(&spec.fp).unwrap());
			// piece samples stay within the production's sample
			assert!(sample.rsizex() <= prod.sample_fp.as_ref().unwrap().rsizex());
		}
	}

	#[test]
	fn uncached_raster_plans_compute_tiles() {
		let spec = spec(false, None);
		let query = Footprint::new((10.0, 90.0), (1.0, -1.0), (20, 20)).unwrap();
		let plan = QueryPlan::build(&spec, &[query], vec![0], None, Interpolation::Area, 5).unwrap();
		let prod = &plan.prods[0];
		assert!(prod.cache_tiles.is_empty());
		assert_eq!(prod.compute_tiles.len(), 4);
	}

	#[test]
	fn bad_channels_are_rejected() {
		let spec = spec(true, None);
		let query = Footprint::new((10.0, 90.0), (1.0, -1.0), (20, 20)).unwrap();
		assert!(QueryPlan::build(&spec, &[query.clone()], vec![2], None, Interpolation::Area, 5).is_err());
		assert!(QueryPlan::build(&spec, &[query], vec![], None, Interpolation::Area, 5).is_err());
		assert!(QueryPlan::build(&spec, &[], vec![0], None, Interpolation::Area, 5).is_err());
	}

	#[test]
	fn automatic_remapping_disabled_requires_same_grid() {
		let mut spec = spec(false, None);
		spec.automatic_remapping = false;
		let off = Footprint::new((10.5, 90.0), (1.0, -1.0), (10, 10)).unwrap();
		let err = QueryPlan::build(&spec, &[off], vec![0], None, Interpolation::Area, 5).unwrap_err();
		assert!(matches!(Error::of(&err), Some(Error::GridMismatch(_))));
	}
}
