//! Read-only accessors.

use super::Footprint;

impl Footprint {
	/// Affine coefficients `(a, b, c, d, e, f)` mapping raster indices to
	/// spatial coordinates.
	#[inline]
	pub fn affine(&self) -> [f64; 6] {
		self.aff
	}

	/// GDAL-ordered geotransform `(c, a, b, f, d, e)`.
	pub fn gt(&self) -> [f64; 6] {
		let [a, b, c, d, e, f] = self.aff;
		[c, a, b, f, d, e]
	}

	/// Pixel counts `(rsizex, rsizey)`.
	#[inline]
	pub fn rsize(&self) -> (usize, usize) {
		(self.rsize[0], self.rsize[1])
	}

	#[inline]
	pub fn rsizex(&self) -> usize {
		self.rsize[0]
	}

	#[inline]
	pub fn rsizey(&self) -> usize {
		self.rsize[1]
	}

	/// Array shape `(rows, cols)` = `(rsizey, rsizex)`.
	#[inline]
	pub fn shape(&self) -> (usize, usize) {
		(self.rsize[1], self.rsize[0])
	}

	/// Total pixel count.
	pub fn rarea(&self) -> usize {
		self.rsize[0] * self.rsize[1]
	}

	/// Top-left spatial corner.
	#[inline]
	pub fn tl(&self) -> (f64, f64) {
		(self.aff[2], self.aff[5])
	}

	/// Top-right spatial corner.
	pub fn tr(&self) -> (f64, f64) {
		self.raster_to_spatial((self.rsize[0] as f64, 0.0))
	}

	/// Bottom-left spatial corner.
	pub fn bl(&self) -> (f64, f64) {
		self.raster_to_spatial((0.0, self.rsize[1] as f64))
	}

	/// Bottom-right spatial corner.
	pub fn br(&self) -> (f64, f64) {
		self.raster_to_spatial((self.rsize[0] as f64, self.rsize[1] as f64))
	}

	/// The four corners `[tl, bl, br, tr]`.
	pub fn coords(&self) -> [(f64, f64); 4] {
		[self.tl(), self.bl(), self.br(), self.tr()]
	}

	/// Spatial vector from one pixel to the next along a row.
	#[inline]
	pub fn pxlrvec(&self) -> (f64, f64) {
		(self.aff[0], self.aff[3])
	}

	/// Spatial vector from one pixel to the next along a column.
	#[inline]
	pub fn pxtbvec(&self) -> (f64, f64) {
		(self.aff[1], self.aff[4])
	}

	/// Signed pixel scale `(sx, sy)`; `sy` is negative for north-up grids.
	pub fn scale(&self) -> (f64, f64) {
		let [a, b, d, e] = [self.aff[0], self.aff[1], self.aff[3], self.aff[4]];
		let sx = a.hypot(d);
		let sy = b.hypot(e);
		let det = a * e - b * d;
		(sx, if det < 0.0 { -sy } else { sy })
	}

	/// Absolute pixel size `(width, height)`.
	pub fn pxsize(&self) -> (f64, f64) {
		let (sx, sy) = self.scale();
		(sx.abs(), sy.abs())
	}

	#[inline]
	pub fn pxsizex(&self) -> f64 {
		self.pxsize().0
	}

	#[inline]
	pub fn pxsizey(&self) -> f64 {
		self.pxsize().1
	}

	/// Rotation of the pixel rows against the spatial x axis, in degrees.
	pub fn angle(&self) -> f64 {
		self.aff[3].atan2(self.aff[0]).to_degrees()
	}

	/// Spatial size `(width, height)` of the rectangle.
	pub fn size(&self) -> (f64, f64) {
		let (pxw, pxh) = self.pxsize();
		(pxw * self.rsize[0] as f64, pxh * self.rsize[1] as f64)
	}

	/// Axis-aligned bounding extent `(minx, maxx, miny, maxy)`.
	pub fn extent(&self) -> (f64, f64, f64, f64) {
		let coords = self.coords();
		let mut minx = f64::INFINITY;
		let mut maxx = f64::NEG_INFINITY;
		let mut miny = f64::INFINITY;
		let mut maxy = f64::NEG_INFINITY;
		for (x, y) in coords {
			minx = minx.min(x);
			maxx = maxx.max(x);
			miny = miny.min(y);
			maxy = maxy.max(y);
		}
		(minx, maxx, miny, maxy)
	}

	/// Lower bound on usable `significant` values for this footprint.
	pub fn significant_min(&self) -> f64 {
		self.significant_min
	}

	/// Largest absolute corner coordinate.
	pub(super) fn largest_coord(&self) -> f64 {
		self
			.coords()
			.iter()
			.flat_map(|&(x, y)| [x.abs(), y.abs()])
			.fold(0.0_f64, f64::max)
	}

	/// `max(|coords|) * 10^-significant` with the current env.
	pub(crate) fn spatial_precision(&self) -> f64 {
		self.largest_coord() * 10f64.powf(-crate::env::significant())
	}
}
