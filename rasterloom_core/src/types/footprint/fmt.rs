//! Display / Debug implementations.

use super::Footprint;
use std::fmt;

impl fmt::Display for Footprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let (tlx, tly) = self.tl();
		let (sx, sy) = self.scale();
		write!(
			f,
			"Footprint(tl=({tlx}, {tly}), scale=({sx}, {sy}), angle={}, rsize=({}, {}))",
			self.angle(),
			self.rsizex(),
			self.rsizey(),
		)
	}
}

impl fmt::Debug for Footprint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Footprint")
			.field("tl", &self.tl())
			.field("scale", &self.scale())
			.field("angle", &self.angle())
			.field("rsize", &self.rsize())
			.finish()
	}
}
