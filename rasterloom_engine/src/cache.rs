//! Content-addressed cache tile files.
//!
//! One ready cache tile is exactly one file named `<key>_<md5hex>.tif`,
//! where `<key>` is a deterministic formatting of the tile footprint and the
//! hex suffix is the MD5 of the file bytes. The naming makes tiles
//! re-discoverable without an index file, and self-validating: hash the
//! bytes, compare with the name.
//!
//! Writes are staged through `<key>.tmp.<uuid>` siblings, fsynced, then
//! atomically renamed into place.

use crate::driver::{RasterMeta, grid_file};
use anyhow::{Context, Result};
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use ndarray::ArrayView3;
use rasterloom_core::Footprint;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

lazy_static! {
	static ref TILE_FILE_RE: Regex = Regex::new(r"^(?P<key>.+)_(?P<md5>[0-9a-f]{32})\.tif$").unwrap();
	static ref TMP_FILE_RE: Regex = Regex::new(r"\.tmp\.[0-9a-f-]{36}$").unwrap();
}

/// Deterministic file-name key of a tile footprint: top-left, scale and
/// pixel counts, each float in shortest round-trip form.
pub fn tile_key(fp: &Footprint) -> String {
	let (tlx, tly) = fp.tl();
	let (sx, sy) = fp.scale();
	format!(
		"tl_{tlx}_{tly}_scl_{sx}_{sy}_rs_{}_{}",
		fp.rsizex(),
		fp.rsizey()
	)
}

/// Final file name of a ready tile.
pub fn tile_file_name(key: &str, checksum_hex: &str) -> String {
	format!("{key}_{checksum_hex}.tif")
}

/// Split a cache file name back into `(key, checksum_hex)`.
pub fn parse_tile_file_name(name: &str) -> Option<(String, String)> {
	let caps = TILE_FILE_RE.captures(name)?;
	Some((caps["key"].to_string(), caps["md5"].to_string()))
}

/// MD5 of a file's bytes, lowercase hex.
pub fn checksum_file(path: &Path) -> Result<String> {
	let bytes = fs::read(path).with_context(|| format!("hashing '{}'", path.display()))?;
	Ok(checksum_bytes(&bytes))
}

pub fn checksum_bytes(bytes: &[u8]) -> String {
	let mut hasher = Md5::new();
	hasher.update(bytes);
	hasher
		.finalize()
		.iter()
		.map(|b| format!("{b:02x}"))
		.collect()
}

/// Scan a cache directory, adopting existing tiles.
///
/// Returns `key -> (path, expected checksum)`. Leftover temp files are
/// removed; when several files claim the same key, the first by directory
/// order is kept and the others are deleted (at most one file per ready tile
/// is the contract).
pub fn scan_cache_dir(dir: &Path) -> Result<HashMap<String, (PathBuf, String)>> {
	let mut found: HashMap<String, (PathBuf, String)> = HashMap::new();
	if !dir.exists() {
		fs::create_dir_all(dir).with_context(|| format!("creating cache dir '{}'", dir.display()))?;
		return Ok(found);
	}
	for entry in fs::read_dir(dir).with_context(|| format!("scanning cache dir '{}'", dir.display()))? {
		let entry = entry?;
		let path = entry.path();
		let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
			continue;
		};
		if TMP_FILE_RE.is_match(name) {
			log::debug!("removing leftover temp file '{}'", path.display());
			fs::remove_file(&path).ok();
			continue;
		}
		let Some((key, hex)) = parse_tile_file_name(name) else {
			continue;
		};
		if found.contains_key(&key) {
			log::warn!("duplicate cache file for one tile, removing '{}'", path.display());
			fs::remove_file(&path).ok();
			continue;
		}
		found.insert(key, (path, hex));
	}
	Ok(found)
}

/// Delete every cache tile file and temp leftover in `dir` (the `ow=true`
/// construction path).
pub fn clear_cache_dir(dir: &Path) -> Result<()> {
	if !dir.exists() {
		fs::create_dir_all(dir)?;
		return Ok(());
	}
	for entry in fs::read_dir(dir)? {
		let path = entry?.path();
		let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
			continue;
		};
		if parse_tile_file_name(name).is_some() || TMP_FILE_RE.is_match(name) {
			fs::remove_file(&path).with_context(|| format!("clearing '{}'", path.display()))?;
		}
	}
	Ok(())
}

/// Write one tile: temp file, fsync, checksum, atomic rename.
///
/// Returns the final path and the checksum hex. On any failure the temp file
/// is removed and nothing shows up under the final name.
pub fn write_tile_atomic(
	dir: &Path,
	key: &str,
	meta: &RasterMeta,
	array: &ArrayView3<'_, f64>,
) -> Result<(PathBuf, String)> {
	fs::create_dir_all(dir)?;
	let tmp = dir.join(format!("{key}.tmp.{}", Uuid::new_v4()));
	let written = (|| {
		grid_file::write_grid_file(&tmp, meta, array)?;
		let hex = checksum_file(&tmp)?;
		let path = dir.join(tile_file_name(key, &hex));
		fs::rename(&tmp, &path).with_context(|| format!("renaming tile into '{}'", path.display()))?;
		Ok::<_, anyhow::Error>((path, hex))
	})();
	match written {
		Ok(done) => {
			// make the rename durable
			if let Ok(d) = fs::File::open(dir) {
				d.sync_all().ok();
			}
			Ok(done)
		}
		Err(err) => {
			fs::remove_file(&tmp).ok();
			Err(err)
		}
	}
}

/// Delete a tile file, ignoring a file already gone.
pub fn delete_tile_file(path: &Path) {
	if let Err(err) = fs::remove_file(path) {
		if err.kind() != std::io::ErrorKind::NotFound {
			log::warn!("could not delete cache file '{}': {err}", path.display());
		}
	}
}
