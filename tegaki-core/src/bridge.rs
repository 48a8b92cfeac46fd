//! Render bridge
//!
//! The boundary between the transform core and whatever actually produces
//! pixels (Canvas2D, WebGL, a GPU readback). The core only needs three
//! things from it: stamp a stroke into a payload, composite layers for
//! display, and bake a matrix into a staged payload.
//!
//! [`CpuRenderBridge`] is a software implementation on top of the `image`
//! crate. It is the reference the rest of the crate is tested against.

use crate::config::ResamplePolicy;
use crate::error::{Result, TegakiError};
use crate::layer::{BlendMode, Layer, LayerId};
use crate::matrix::Matrix;
use crate::payload::{sample, Bakeable, PathPayload, Payload, StrokePath, StrokePoint, StrokeStyle};
use image::{Rgba, RgbaImage};
use kurbo::{Point, Rect};
use log::debug;
use std::sync::Arc;

/// Identifies the session a bake belongs to
///
/// A result carrying a token from a session that has since been cancelled
/// is discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BakeToken(pub u64);

/// Work handed to [`RenderBridge::bake_transform`]
#[derive(Clone, Debug)]
pub struct BakeJob {
    pub token: BakeToken,
    pub layer_id: LayerId,
    /// Content as it was when the session started
    pub snapshot: Arc<Payload>,
    /// Final matrix, translation already snapped to whole pixels
    pub matrix: Matrix,
    pub resample: ResamplePolicy,
}

/// Answer to a bake request
#[derive(Debug)]
pub enum BakeRequest {
    /// The bake finished synchronously
    Ready(Result<Payload>),
    /// The bridge will report back later through `Editor::resolve_bake`
    Deferred,
}

/// Pixel producer consumed by the core
pub trait RenderBridge {
    /// Draw `points` (layer-local) into `target`
    ///
    /// Called once with the first point of a stroke, then once per segment
    /// `[previous, current]`.
    fn draw_stroke(&mut self, points: &[StrokePoint], style: &StrokeStyle, target: &mut Payload) -> Result<()>;

    /// Composite visible layers into `target` within `dirty` (target pixels)
    ///
    /// `base_transform` maps world space onto the target: identity for
    /// document-sized output, the pipeline's display matrix for the view.
    /// Honors each layer's model matrix, opacity and blend mode. Reads layer
    /// state only.
    fn composite_layers(
        &mut self,
        layers: &[Layer],
        base_transform: Matrix,
        target: &mut RgbaImage,
        dirty: Rect,
    ) -> Result<()>;

    /// Apply `job.matrix` to `job.snapshot`, returning content of the same kind
    fn bake_transform(&mut self, job: BakeJob) -> BakeRequest;
}

/// Software render bridge
#[derive(Debug)]
pub struct CpuRenderBridge {
    /// Sampling used when compositing transformed layers
    pub resample: ResamplePolicy,
    available: bool,
    defer_bakes: bool,
    pending: Vec<BakeJob>,
}

impl Default for CpuRenderBridge {
    fn default() -> Self {
        Self::new(ResamplePolicy::Bilinear)
    }
}

impl CpuRenderBridge {
    pub fn new(resample: ResamplePolicy) -> Self {
        Self {
            resample,
            available: true,
            defer_bakes: false,
            pending: Vec::new(),
        }
    }

    /// Simulate losing (or regaining) the backend
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Queue bakes instead of answering them synchronously
    pub fn set_defer_bakes(&mut self, defer: bool) {
        self.defer_bakes = defer;
    }

    pub fn pending_bakes(&self) -> usize {
        self.pending.len()
    }

    /// Run every queued bake, returning results in request order
    pub fn complete_pending(&mut self) -> Vec<(BakeToken, Result<Payload>)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|job| {
                let token = job.token;
                (token, self.run_bake(&job))
            })
            .collect()
    }

    fn run_bake(&self, job: &BakeJob) -> Result<Payload> {
        if !self.available {
            return Err(TegakiError::BakeFailure("render backend unavailable".to_string()));
        }
        job.snapshot.bake(&job.matrix, job.resample)
    }
}

impl RenderBridge for CpuRenderBridge {
    fn draw_stroke(&mut self, points: &[StrokePoint], style: &StrokeStyle, target: &mut Payload) -> Result<()> {
        if !self.available {
            return Err(TegakiError::Render("render backend unavailable".to_string()));
        }
        match target {
            Payload::Raster(img) => stamp_points(img, points, style),
            Payload::Paths(paths) => append_path(paths, points, style),
        }
        Ok(())
    }

    fn composite_layers(
        &mut self,
        layers: &[Layer],
        base_transform: Matrix,
        target: &mut RgbaImage,
        dirty: Rect,
    ) -> Result<()> {
        if !self.available {
            return Err(TegakiError::Render("render backend unavailable".to_string()));
        }
        let bounds = Rect::new(0.0, 0.0, target.width() as f64, target.height() as f64);
        let clip = dirty.intersect(bounds);
        if clip.width() <= 0.0 || clip.height() <= 0.0 {
            return Ok(());
        }
        let x0 = clip.x0.floor() as u32;
        let y0 = clip.y0.floor() as u32;
        let x1 = (clip.x1.ceil() as u32).min(target.width());
        let y1 = (clip.y1.ceil() as u32).min(target.height());

        for layer in layers.iter().filter(|l| l.visible() && l.opacity() > 0.0) {
            let Ok(inverse) = (base_transform * layer.model_matrix()).invert() else {
                debug!("Skipping layer {} with singular matrix", layer.id());
                continue;
            };
            let rasterized;
            let source: &RgbaImage = match layer.display_payload() {
                Payload::Raster(img) => img,
                Payload::Paths(paths) => {
                    rasterized = rasterize_paths(paths);
                    &rasterized
                }
            };
            for y in y0..y1 {
                for x in x0..x1 {
                    let src = inverse.apply_to_point(Point::new(x as f64 + 0.5, y as f64 + 0.5));
                    let texel = sample(source, src, self.resample);
                    if texel[3] == 0 {
                        continue;
                    }
                    let dst = target.get_pixel_mut(x, y);
                    *dst = blend_pixel(*dst, texel, layer.opacity(), layer.blend_mode());
                }
            }
        }
        Ok(())
    }

    fn bake_transform(&mut self, job: BakeJob) -> BakeRequest {
        if self.defer_bakes {
            debug!("Deferring bake for layer {} ({:?})", job.layer_id, job.token);
            self.pending.push(job);
            return BakeRequest::Deferred;
        }
        BakeRequest::Ready(self.run_bake(&job))
    }
}

/// Source-over with a separable blend function (straight alpha in and out)
pub(crate) fn blend_pixel(dst: Rgba<u8>, src: Rgba<u8>, opacity: f64, mode: BlendMode) -> Rgba<u8> {
    let sa = src[3] as f64 / 255.0 * opacity.clamp(0.0, 1.0);
    if sa <= 0.0 {
        return dst;
    }
    let da = dst[3] as f64 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let mut out = [0u8; 4];
    for i in 0..3 {
        let cs = src[i] as f64 / 255.0;
        let cb = dst[i] as f64 / 255.0;
        let blended = blend_channel(mode, cb, cs);
        // Mixed source color where the backdrop has coverage
        let mixed = (1.0 - da) * cs + da * blended;
        let premul = sa * mixed + da * cb * (1.0 - sa);
        out[i] = ((premul / out_a) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba(out)
}

fn blend_channel(mode: BlendMode, cb: f64, cs: f64) -> f64 {
    match mode {
        BlendMode::Normal => cs,
        BlendMode::Multiply => cb * cs,
        BlendMode::Screen => cb + cs - cb * cs,
        BlendMode::Overlay => {
            if cb <= 0.5 {
                2.0 * cb * cs
            } else {
                1.0 - 2.0 * (1.0 - cb) * (1.0 - cs)
            }
        }
        BlendMode::Darken => cb.min(cs),
        BlendMode::Lighten => cb.max(cs),
        BlendMode::Add => (cb + cs).min(1.0),
    }
}

/// Stamp round dabs along the polyline
fn stamp_points(img: &mut RgbaImage, points: &[StrokePoint], style: &StrokeStyle) {
    match points {
        [] => {}
        [only] => stamp_dab(img, only.point(), dab_radius(style, only.pressure), style.color),
        _ => {
            for pair in points.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                let length = a.point().distance(b.point());
                let spacing = (dab_radius(style, a.pressure.min(b.pressure)) * 0.25).max(0.5);
                let steps = (length / spacing).ceil().max(1.0) as usize;
                // The first dab of the segment was stamped by the previous call
                for step in 1..=steps {
                    let t = step as f64 / steps as f64;
                    let p = a.point().lerp(b.point(), t);
                    let pressure = a.pressure + (b.pressure - a.pressure) * t;
                    stamp_dab(img, p, dab_radius(style, pressure), style.color);
                }
            }
        }
    }
}

fn dab_radius(style: &StrokeStyle, pressure: f64) -> f64 {
    (style.width * 0.5 * pressure.clamp(0.0, 1.0)).max(0.5)
}

fn stamp_dab(img: &mut RgbaImage, center: Point, radius: f64, color: [u8; 4]) {
    let x0 = (center.x - radius - 1.0).floor().max(0.0) as u32;
    let y0 = (center.y - radius - 1.0).floor().max(0.0) as u32;
    let x1 = ((center.x + radius + 1.0).ceil().max(0.0) as u32).min(img.width());
    let y1 = ((center.y + radius + 1.0).ceil().max(0.0) as u32).min(img.height());
    for y in y0..y1 {
        for x in x0..x1 {
            let d = Point::new(x as f64 + 0.5, y as f64 + 0.5).distance(center);
            let coverage = (radius + 0.5 - d).clamp(0.0, 1.0);
            if coverage <= 0.0 {
                continue;
            }
            let dst = img.get_pixel_mut(x, y);
            // Max-alpha within a stroke so overlapping dabs don't build up
            let src_a = (color[3] as f64 * coverage).round() as u8;
            if src_a <= dst[3] && dst.0[0..3] == color[0..3] {
                continue;
            }
            *dst = blend_pixel(*dst, Rgba([color[0], color[1], color[2], src_a]), 1.0, BlendMode::Normal);
        }
    }
}

/// Extend the last path when the segment continues it, otherwise start a new one
fn append_path(payload: &mut PathPayload, points: &[StrokePoint], style: &StrokeStyle) {
    let Some(first) = points.first() else {
        return;
    };
    if let Some(last) = payload.paths.last_mut() {
        let continues = last.style == *style
            && last.points.last().map(|p| p.point() == first.point()).unwrap_or(false);
        if continues {
            last.points.extend_from_slice(&points[1..]);
            return;
        }
    }
    payload.paths.push(StrokePath {
        points: points.to_vec(),
        style: *style,
    });
}

/// Render vector strokes into a raster of the payload's size
pub fn rasterize_paths(paths: &PathPayload) -> RgbaImage {
    let mut img = RgbaImage::new(paths.width, paths.height);
    for path in &paths.paths {
        stamp_points(&mut img, &path.points, &path.style);
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadKind;

    fn red() -> StrokeStyle {
        StrokeStyle { color: [255, 0, 0, 255], width: 2.0 }
    }

    #[test]
    fn test_draw_dot_on_raster() {
        let mut bridge = CpuRenderBridge::default();
        let mut payload = Payload::blank(PayloadKind::Raster, 32, 32);
        bridge
            .draw_stroke(&[StrokePoint::new(10.5, 10.5, 1.0)], &red(), &mut payload)
            .unwrap();
        let Payload::Raster(img) = &payload else { panic!("expected raster") };
        assert_eq!(*img.get_pixel(10, 10), Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(20, 20)[3], 0);
    }

    #[test]
    fn test_segments_extend_vector_path() {
        let mut bridge = CpuRenderBridge::default();
        let mut payload = Payload::blank(PayloadKind::Paths, 32, 32);
        let a = StrokePoint::new(1.0, 1.0, 1.0);
        let b = StrokePoint::new(5.0, 1.0, 1.0);
        let c = StrokePoint::new(5.0, 9.0, 1.0);
        bridge.draw_stroke(&[a], &red(), &mut payload).unwrap();
        bridge.draw_stroke(&[a, b], &red(), &mut payload).unwrap();
        bridge.draw_stroke(&[b, c], &red(), &mut payload).unwrap();
        let Payload::Paths(paths) = &payload else { panic!("expected paths") };
        assert_eq!(paths.paths.len(), 1);
        assert_eq!(paths.paths[0].points, vec![a, b, c]);
    }

    #[test]
    fn test_composite_honors_matrix_and_opacity() {
        let mut bridge = CpuRenderBridge::new(ResamplePolicy::Nearest);
        let mut img = RgbaImage::new(16, 16);
        img.put_pixel(1, 1, Rgba([0, 0, 255, 255]));
        let mut layer = Layer::new(LayerId(1), "L", Payload::Raster(img));
        layer.model_matrix = Matrix::from_translation(4.0, 2.0);
        layer.opacity = 0.5;

        let mut target = RgbaImage::new(16, 16);
        bridge
            .composite_layers(&[layer], Matrix::IDENTITY, &mut target, Rect::new(0.0, 0.0, 16.0, 16.0))
            .unwrap();
        let p = target.get_pixel(5, 3);
        assert_eq!(p[2], 255);
        assert_eq!(p[3], 128);
        assert_eq!(target.get_pixel(1, 1)[3], 0);
    }

    #[test]
    fn test_composite_respects_dirty_rect() {
        let mut bridge = CpuRenderBridge::default();
        let mut img = RgbaImage::new(8, 8);
        for p in img.pixels_mut() {
            *p = Rgba([9, 9, 9, 255]);
        }
        let layer = Layer::new(LayerId(1), "L", Payload::Raster(img));
        let mut target = RgbaImage::new(8, 8);
        bridge
            .composite_layers(&[layer], Matrix::IDENTITY, &mut target, Rect::new(0.0, 0.0, 4.0, 4.0))
            .unwrap();
        assert_eq!(target.get_pixel(3, 3)[3], 255);
        assert_eq!(target.get_pixel(4, 4)[3], 0);
    }

    #[test]
    fn test_blend_modes() {
        let dst = Rgba([128, 128, 128, 255]);
        let src = Rgba([255, 255, 255, 255]);
        assert_eq!(blend_pixel(dst, src, 1.0, BlendMode::Multiply), Rgba([128, 128, 128, 255]));
        assert_eq!(blend_pixel(dst, src, 1.0, BlendMode::Screen), Rgba([255, 255, 255, 255]));
        assert_eq!(blend_pixel(dst, src, 1.0, BlendMode::Darken), Rgba([128, 128, 128, 255]));
        assert_eq!(blend_pixel(Rgba([0, 0, 0, 0]), src, 1.0, BlendMode::Multiply), src);
    }

    #[test]
    fn test_unavailable_bridge_fails_bake() {
        let mut bridge = CpuRenderBridge::default();
        bridge.set_available(false);
        let job = BakeJob {
            token: BakeToken(1),
            layer_id: LayerId(1),
            snapshot: Arc::new(Payload::blank(PayloadKind::Raster, 4, 4)),
            matrix: Matrix::from_translation(1.0, 0.0),
            resample: ResamplePolicy::Nearest,
        };
        match bridge.bake_transform(job) {
            BakeRequest::Ready(Err(TegakiError::BakeFailure(_))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deferred_bakes_complete_later() {
        let mut bridge = CpuRenderBridge::default();
        bridge.set_defer_bakes(true);
        let job = BakeJob {
            token: BakeToken(7),
            layer_id: LayerId(1),
            snapshot: Arc::new(Payload::blank(PayloadKind::Paths, 4, 4)),
            matrix: Matrix::IDENTITY,
            resample: ResamplePolicy::Nearest,
        };
        assert!(matches!(bridge.bake_transform(job), BakeRequest::Deferred));
        assert_eq!(bridge.pending_bakes(), 1);
        let done = bridge.complete_pending();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0, BakeToken(7));
        assert!(done[0].1.is_ok());
        assert_eq!(bridge.pending_bakes(), 0);
    }
}
