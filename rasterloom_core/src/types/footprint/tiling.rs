//! Deterministic tiling of a footprint into a matrix of sub-footprints.

use super::Footprint;
use crate::errors::Error;
use anyhow::{Result, ensure};

/// What happens at the bottom/right edges when tiles do not fit exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryEffect {
	/// Keep full-size edge tiles, letting them spill past the footprint.
	Extend,
	/// Drop incomplete edge tiles.
	Exclude,
	/// Keep full-size edge tiles flush with the edge, overlapping inward.
	Overlap,
	/// Shrink edge tiles to fit.
	Shrink,
	/// Demand an exact fit.
	Exception,
}

/// Per-axis tiling: `(offset, size)` of each tile along one dimension.
fn axis_parts(
	tile: usize,
	overlap: usize,
	raster: usize,
	effect: BoundaryEffect,
) -> Result<Vec<(i64, usize)>> {
	ensure!(
		tile > 0,
		Error::InvalidParameter("tile size should be > 0".to_string())
	);
	ensure!(
		overlap < tile,
		Error::InvalidParameter(format!("overlap ({overlap}) should be smaller than tile size ({tile})"))
	);
	let increment = tile - overlap;
	let count = if tile > raster {
		0
	} else {
		1 + (raster - tile) / increment
	};
	let full: Vec<i64> = (0..count).map(|k| (k * increment) as i64).collect();
	let end_last = full.last().map_or(0, |&o| o + tile as i64);
	let gap = raster as i64 - end_last;

	let mut parts: Vec<(i64, usize)> = full.iter().map(|&o| (o, tile)).collect();
	match effect {
		BoundaryEffect::Extend => {
			if count == 0 {
				parts.push((0, tile));
			} else if gap != 0 {
				parts.push((raster as i64 - gap - overlap as i64, tile));
			}
		}
		BoundaryEffect::Exclude => {}
		BoundaryEffect::Overlap => {
			ensure!(
				tile <= raster,
				Error::InvalidParameter(format!(
					"cannot apply the overlap boundary effect with a tile ({tile}) bigger than the source ({raster})"
				))
			);
			if gap != 0 {
				parts.push((raster as i64 - tile as i64, tile));
			}
		}
		BoundaryEffect::Shrink => {
			if count == 0 {
				parts.push((0, raster));
			} else if gap > 0 {
				parts.push((end_last - overlap as i64, gap as usize + overlap));
			}
		}
		BoundaryEffect::Exception => {
			ensure!(
				count > 0 && gap == 0,
				Error::Geometry(format!(
					"tile size {tile} with overlap {overlap} does not partition {raster} pixels exactly"
				))
			);
		}
	}
	Ok(parts)
}

impl Footprint {
	/// Tile the footprint into a row-major matrix of sub-footprints of
	/// `size = (sizex, sizey)` pixels, with the given per-axis `overlap`.
	pub fn tile(
		&self,
		size: (usize, usize),
		overlap: (usize, usize),
		effect: BoundaryEffect,
	) -> Result<Vec<Vec<Footprint>>> {
		let xs = axis_parts(size.0, overlap.0, self.rsizex(), effect)?;
		let ys = axis_parts(size.1, overlap.1, self.rsizey(), effect)?;
		let mut rows = Vec::with_capacity(ys.len());
		for &(dy, sy) in &ys {
			let mut row = Vec::with_capacity(xs.len());
			for &(dx, sx) in &xs {
				row.push(self.translated_px(dx as f64, dy as f64, (sx, sy)));
			}
			rows.push(row);
		}
		Ok(rows)
	}

	/// Tile the footprint into (about) `count = (countx, county)` tiles.
	pub fn tile_count(&self, count: (usize, usize), effect: BoundaryEffect) -> Result<Vec<Vec<Footprint>>> {
		ensure!(
			count.0 > 0 && count.1 > 0,
			Error::InvalidParameter(format!("tile count should be > 0, got {count:?}"))
		);
		let sizex = self.rsizex().div_ceil(count.0);
		let sizey = self.rsizey().div_ceil(count.1);
		self.tile((sizex, sizey), (0, 0), effect)
	}

	/// Tile with overlaps such that every interior pixel is covered by
	/// `occurrence` tiles along each axis.
	pub fn tile_occurrence(&self, size: (usize, usize), occurrence: usize) -> Result<Vec<Vec<Footprint>>> {
		ensure!(
			occurrence > 0,
			Error::InvalidParameter("occurrence should be > 0".to_string())
		);
		ensure!(
			size.0 % occurrence == 0 && size.1 % occurrence == 0,
			Error::InvalidParameter(format!(
				"tile size {size:?} should be a multiple of occurrence {occurrence}"
			))
		);
		let overlap = (size.0 - size.0 / occurrence, size.1 - size.1 / occurrence);
		self.tile(size, overlap, BoundaryEffect::Extend)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	fn fp() -> Footprint {
		Footprint::new((0.0, 100.0), (1.0, -1.0), (100, 100)).unwrap()
	}

	#[test]
	fn exact_partition() {
		let tiles = fp().tile((20, 20), (0, 0), BoundaryEffect::Exception).unwrap();
		assert_eq!(tiles.len(), 5);
		assert_eq!(tiles[0].len(), 5);
		assert_eq!(tiles[0][0].tl(), (0.0, 100.0));
		assert_eq!(tiles[4][4].tl(), (80.0, 20.0));
		assert_eq!(tiles[4][4].br(), (100.0, 0.0));
		for row in &tiles {
			for tile in row {
				assert_eq!(tile.rsize(), (20, 20));
				assert!(tile.same_grid(&fp()).unwrap());
			}
		}
	}

	#[test]
	fn exception_rejects_inexact_fit() {
		assert!(fp().tile((30, 30), (0, 0), BoundaryEffect::Exception).is_err());
	}

	#[rstest]
	// 100 px into 30 px tiles: 3 full tiles, gap of 10
	#[case(BoundaryEffect::Extend, 4, 30)]
	#[case(BoundaryEffect::Exclude, 3, 30)]
	#[case(BoundaryEffect::Overlap, 4, 30)]
	#[case(BoundaryEffect::Shrink, 4, 10)]
	fn boundary_effects(
		#[case] effect: BoundaryEffect,
		#[case] expected_cols: usize,
		#[case] last_width: usize,
	) {
		let tiles = fp().tile((30, 30), (0, 0), effect).unwrap();
		assert_eq!(tiles[0].len(), expected_cols);
		let last = &tiles[0][expected_cols - 1];
		assert_eq!(last.rsizex(), last_width);
		match effect {
			BoundaryEffect::Extend => assert_eq!(last.br().0, 120.0),
			BoundaryEffect::Overlap => assert_eq!(last.br().0, 100.0),
			BoundaryEffect::Shrink => assert_eq!(last.br().0, 100.0),
			_ => {}
		}
	}

	#[test]
	fn shrink_covers_every_pixel_once() {
		let tiles = fp().tile((30, 30), (0, 0), BoundaryEffect::Shrink).unwrap();
		let total: usize = tiles.iter().flatten().map(|t| t.rarea()).sum();
		assert_eq!(total, fp().rarea());
	}

	#[test]
	fn tile_bigger_than_raster() {
		let tiles = fp().tile((150, 150), (0, 0), BoundaryEffect::Shrink).unwrap();
		assert_eq!(tiles.len(), 1);
		assert_eq!(tiles[0][0].rsize(), (100, 100));
		let tiles = fp().tile((150, 150), (0, 0), BoundaryEffect::Extend).unwrap();
		assert_eq!(tiles[0][0].rsize(), (150, 150));
	}

	#[test]
	fn tile_count_shrink() {
		// ceil(100/3) = 34: tiles of 34, 34, shrunk 32
		let tiles = fp().tile_count((3, 3), BoundaryEffect::Shrink).unwrap();
		assert_eq!(tiles.len(), 3);
		assert_eq!(tiles[0].len(), 3);
		assert_eq!(tiles[0][0].rsizex(), 34);
		assert_eq!(tiles[0][2].rsizex(), 32);
		let total: usize = tiles.iter().flatten().map(|t| t.rarea()).sum();
		assert_eq!(total, fp().rarea());
	}

	#[test]
	fn occurrence_two_covers_twice() {
		let tiles = fp().tile_occurrence((20, 20), 2).unwrap();
		// increment 10: offsets 0..=80 then the extend rule adds none
		// (gap == 0), 9 tiles per axis
		assert_eq!(tiles.len(), 9);
		assert_eq!(tiles[0].len(), 9);
		assert!(fp().tile_occurrence((21, 20), 2).is_err());
	}
}
