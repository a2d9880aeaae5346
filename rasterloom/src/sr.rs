//! The spatial-reference seam.
//!
//! True coordinate conversion math is an external collaborator: a
//! [`SpatialReferenceProvider`] turns a pair of spatial-reference strings
//! into an opaque point transform. The built-in provider only knows the
//! identity (equal strings); plug a PROJ-backed provider in for real
//! reprojection.
//!
//! Four modes:
//! 1. no `sr_work` — no conversion ever happens;
//! 2. `sr_work` — sources must carry a stored SR, converted to the work SR;
//! 3. `sr_work` + `sr_fallback` — sources without a stored SR use the
//!    fallback;
//! 4. `sr_work` + `sr_forced` — the stored SR is ignored, the forced one is
//!    used unconditionally (no analysis).

use anyhow::Result;
use rasterloom_core::Footprint;
use rasterloom_core::errors::Error;
use std::sync::Arc;

/// An opaque point transform between two spatial references.
pub type CoordTransform = Arc<dyn Fn((f64, f64)) -> (f64, f64) + Send + Sync>;

/// Factory of coordinate transforms.
pub trait SpatialReferenceProvider: Send + Sync {
	fn transform(&self, from_sr: &str, to_sr: &str) -> Result<CoordTransform>;
}

/// The fallback provider: identity between equal strings, error otherwise.
pub struct IdentityProvider;

impl SpatialReferenceProvider for IdentityProvider {
	fn transform(&self, from_sr: &str, to_sr: &str) -> Result<CoordTransform> {
		if from_sr == to_sr {
			Ok(Arc::new(|xy| xy))
		} else {
			Err(Error::Config(format!(
				"no spatial-reference provider configured to convert '{from_sr}' to '{to_sr}'"
			))
			.into())
		}
	}
}

/// Validated SR configuration of a Dataset.
pub(crate) struct SrConfig {
	pub work: Option<String>,
	pub fallback: Option<String>,
	pub forced: Option<String>,
	pub analyse_transformation: bool,
	pub allow_none_geometry: bool,
	pub provider: Arc<dyn SpatialReferenceProvider>,
}

impl SrConfig {
	pub fn validate(&self) -> Result<()> {
		if self.fallback.is_some() && self.forced.is_some() {
			return Err(Error::Config("`sr_fallback` and `sr_forced` are mutually exclusive".to_string()).into());
		}
		if self.work.is_none() && (self.fallback.is_some() || self.forced.is_some()) {
			return Err(Error::Config("`sr_fallback`/`sr_forced` require `sr_work`".to_string()).into());
		}
		Ok(())
	}

	/// The SR a source's coordinates are interpreted in, given its stored SR.
	fn effective_stored(&self, stored: Option<&str>) -> Result<Option<String>> {
		// a forced SR wins unconditionally, stored or not
		if let Some(forced) = &self.forced {
			return Ok(Some(forced.clone()));
		}
		match (stored, &self.fallback) {
			(Some(stored), _) => Ok(Some(stored.to_string())),
			(None, Some(fallback)) => Ok(Some(fallback.clone())),
			(None, None) => Ok(None),
		}
	}

	/// Convert a stored footprint to the work SR.
	///
	/// The transform moves the three defining corners and the footprint
	/// follows; with `analyse_transformation` the move validates that the
	/// result is still an orthogonal grid within precision.
	pub fn to_work(&self, fp_stored: &Footprint, wkt_stored: Option<&str>) -> Result<Footprint> {
		let Some(work) = &self.work else {
			return Ok(fp_stored.clone()); // mode 1: no conversion
		};
		let Some(stored) = self.effective_stored(wkt_stored)? else {
			if self.allow_none_geometry {
				return Ok(fp_stored.clone());
			}
			return Err(Error::Config(
				"source has no stored spatial reference and no fallback is configured".to_string(),
			)
			.into());
		};
		if stored == *work {
			return Ok(fp_stored.clone());
		}
		let transform = self.provider.transform(&stored, work)?;
		let tl = transform(fp_stored.tl());
		let tr = transform(fp_stored.tr());
		let br = transform(fp_stored.br());
		if self.analyse_transformation {
			fp_stored.move_to(tl, Some(tr), Some(br))
		} else {
			// no analysis: trust the transform, derive the y axis
			fp_stored.move_to(tl, Some(tr), None)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(work: Option<&str>, fallback: Option<&str>, forced: Option<&str>) -> SrConfig {
		SrConfig {
			work: work.map(String::from),
			fallback: fallback.map(String::from),
			forced: forced.map(String::from),
			analyse_transformation: true,
			allow_none_geometry: true,
			provider: Arc::new(IdentityProvider),
		}
	}

	#[test]
	fn mode_constraints() {
		assert!(config(Some("A"), Some("B"), Some("C")).validate().is_err());
		assert!(config(None, Some("B"), None).validate().is_err());
		assert!(config(None, None, Some("C")).validate().is_err());
		config(None, None, None).validate().unwrap();
		config(Some("A"), Some("B"), None).validate().unwrap();
		config(Some("A"), None, Some("C")).validate().unwrap();
	}

	#[test]
	fn identity_paths_do_not_touch_the_footprint() {
		let fp = Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
		// mode 1
		assert!(config(None, None, None).to_work(&fp, Some("A")).unwrap().equals(&fp).unwrap());
		// same SR
		assert!(config(Some("A"), None, None).to_work(&fp, Some("A")).unwrap().equals(&fp).unwrap());
		// forced matching work, source without SR
		assert!(
			config(Some("A"), None, Some("A"))
				.to_work(&fp, None)
				.unwrap()
				.equals(&fp)
				.unwrap()
		);
	}

	#[test]
	fn missing_stored_sr_respects_allow_none_geometry() {
		let fp = Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
		let mut cfg = config(Some("A"), None, None);
		cfg.to_work(&fp, None).unwrap(); // allowed, passes through
		cfg.allow_none_geometry = false;
		assert!(cfg.to_work(&fp, None).is_err());
		// a fallback fills the gap
		let cfg = config(Some("A"), Some("A"), None);
		cfg.to_work(&fp, None).unwrap();
	}

	#[test]
	fn unknown_conversion_fails_without_a_provider() {
		let fp = Footprint::new((0.0, 10.0), (1.0, -1.0), (10, 10)).unwrap();
		let err = config(Some("A"), None, None).to_work(&fp, Some("B")).unwrap_err();
		assert!(matches!(Error::of(&err), Some(Error::Config(_))));
	}
}
