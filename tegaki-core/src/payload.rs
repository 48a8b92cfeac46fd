//! Layer payloads
//!
//! A layer's content is either a raster buffer or a list of stroke paths.
//! The transform core treats both as opaque except for the [`Bakeable`]
//! capability: bake a matrix into the content, produce a blank of the same
//! shape, and report local bounds.

use crate::config::ResamplePolicy;
use crate::error::{Result, TegakiError};
use crate::matrix::Matrix;
use image::{Rgba, RgbaImage};
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// Content that a transform can be permanently applied to
pub trait Bakeable: Sized {
    /// Return a copy of this content with `matrix` applied
    fn bake(&self, matrix: &Matrix, resample: ResamplePolicy) -> Result<Self>;

    /// Empty content with the same dimensions
    fn blank_like(&self) -> Self;

    /// Extent of the content in its own pixel space
    fn local_bounds(&self) -> Rect;

    fn is_blank(&self) -> bool;
}

/// One sampled pointer position of a stroke
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokePoint {
    pub x: f64,
    pub y: f64,
    /// 0.0 to 1.0
    pub pressure: f64,
}

impl StrokePoint {
    pub fn new(x: f64, y: f64, pressure: f64) -> Self {
        Self { x, y, pressure }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Brush parameters for a stroke
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokeStyle {
    /// Straight-alpha RGBA
    pub color: [u8; 4],
    /// Diameter at full pressure
    pub width: f64,
}

impl Default for StrokeStyle {
    fn default() -> Self {
        Self {
            color: [0, 0, 0, 255],
            width: 3.0,
        }
    }
}

/// A single vector stroke
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrokePath {
    pub points: Vec<StrokePoint>,
    pub style: StrokeStyle,
}

/// Path-based layer content
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathPayload {
    pub width: u32,
    pub height: u32,
    pub paths: Vec<StrokePath>,
}

impl PathPayload {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            paths: Vec::new(),
        }
    }
}

/// Tagged layer content
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Raster(RgbaImage),
    Paths(PathPayload),
}

/// Which payload representation new layers get
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadKind {
    Raster,
    Paths,
}

impl Payload {
    /// Blank content of the given kind and size
    pub fn blank(kind: PayloadKind, width: u32, height: u32) -> Self {
        match kind {
            PayloadKind::Raster => Payload::Raster(RgbaImage::new(width, height)),
            PayloadKind::Paths => Payload::Paths(PathPayload::new(width, height)),
        }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raster(_) => PayloadKind::Raster,
            Payload::Paths(_) => PayloadKind::Paths,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Payload::Raster(img) => img.dimensions(),
            Payload::Paths(p) => (p.width, p.height),
        }
    }
}

impl Bakeable for Payload {
    fn bake(&self, matrix: &Matrix, resample: ResamplePolicy) -> Result<Self> {
        match self {
            Payload::Raster(img) => img.bake(matrix, resample).map(Payload::Raster),
            Payload::Paths(p) => p.bake(matrix, resample).map(Payload::Paths),
        }
    }

    fn blank_like(&self) -> Self {
        match self {
            Payload::Raster(img) => Payload::Raster(img.blank_like()),
            Payload::Paths(p) => Payload::Paths(p.blank_like()),
        }
    }

    fn local_bounds(&self) -> Rect {
        match self {
            Payload::Raster(img) => img.local_bounds(),
            Payload::Paths(p) => p.local_bounds(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Payload::Raster(img) => img.is_blank(),
            Payload::Paths(p) => p.is_blank(),
        }
    }
}

impl Bakeable for RgbaImage {
    fn bake(&self, matrix: &Matrix, resample: ResamplePolicy) -> Result<Self> {
        if matrix.is_identity() {
            return Ok(self.clone());
        }
        let inverse = matrix
            .invert()
            .map_err(|_| TegakiError::BakeFailure("transform is not invertible".to_string()))?;

        let (width, height) = self.dimensions();
        let mut out = RgbaImage::new(width, height);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
            let src = inverse.apply_to_point(center);
            *pixel = sample(self, src, resample);
        }
        Ok(out)
    }

    fn blank_like(&self) -> Self {
        RgbaImage::new(self.width(), self.height())
    }

    fn local_bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width() as f64, self.height() as f64)
    }

    fn is_blank(&self) -> bool {
        self.pixels().all(|p| p[3] == 0)
    }
}

impl Bakeable for PathPayload {
    fn bake(&self, matrix: &Matrix, _resample: ResamplePolicy) -> Result<Self> {
        if !matrix.is_finite() {
            return Err(TegakiError::BakeFailure("transform is not finite".to_string()));
        }
        let width_scale = matrix.mean_scale();
        let paths = self
            .paths
            .iter()
            .map(|path| StrokePath {
                points: path
                    .points
                    .iter()
                    .map(|p| {
                        let moved = matrix.apply_to_point(p.point());
                        StrokePoint::new(moved.x, moved.y, p.pressure)
                    })
                    .collect(),
                style: StrokeStyle {
                    width: path.style.width * width_scale,
                    ..path.style
                },
            })
            .collect();
        Ok(PathPayload {
            width: self.width,
            height: self.height,
            paths,
        })
    }

    fn blank_like(&self) -> Self {
        PathPayload::new(self.width, self.height)
    }

    fn local_bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width as f64, self.height as f64)
    }

    fn is_blank(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Sample `img` at a continuous position, transparent outside its bounds
pub(crate) fn sample(img: &RgbaImage, src: Point, resample: ResamplePolicy) -> Rgba<u8> {
    match resample {
        ResamplePolicy::Nearest => sample_nearest(img, src),
        ResamplePolicy::Bilinear => sample_bilinear(img, src),
    }
}

fn sample_nearest(img: &RgbaImage, src: Point) -> Rgba<u8> {
    let x = src.x.floor();
    let y = src.y.floor();
    if x < 0.0 || y < 0.0 || x >= img.width() as f64 || y >= img.height() as f64 {
        return Rgba([0, 0, 0, 0]);
    }
    *img.get_pixel(x as u32, y as u32)
}

/// Bilinear sample with transparent edges, interpolated in premultiplied space
fn sample_bilinear(img: &RgbaImage, src: Point) -> Rgba<u8> {
    let fx = src.x - 0.5;
    let fy = src.y - 0.5;
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;

    let mut acc = [0.0f64; 4];
    for (dx, dy, weight) in [
        (0.0, 0.0, (1.0 - tx) * (1.0 - ty)),
        (1.0, 0.0, tx * (1.0 - ty)),
        (0.0, 1.0, (1.0 - tx) * ty),
        (1.0, 1.0, tx * ty),
    ] {
        if weight <= 0.0 {
            continue;
        }
        let sx = x0 + dx;
        let sy = y0 + dy;
        if sx < 0.0 || sy < 0.0 || sx >= img.width() as f64 || sy >= img.height() as f64 {
            continue;
        }
        let p = img.get_pixel(sx as u32, sy as u32);
        let alpha = p[3] as f64 / 255.0;
        acc[0] += p[0] as f64 * alpha * weight;
        acc[1] += p[1] as f64 * alpha * weight;
        acc[2] += p[2] as f64 * alpha * weight;
        acc[3] += alpha * weight;
    }

    if acc[3] <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let unpremultiply = |c: f64| (c / acc[3]).round().clamp(0.0, 255.0) as u8;
    Rgba([
        unpremultiply(acc[0]),
        unpremultiply(acc[1]),
        unpremultiply(acc[2]),
        (acc[3] * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}
