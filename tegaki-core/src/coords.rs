//! Coordinate pipeline
//!
//! Pointer input travels screen -> canvas -> world -> layer-local:
//!
//! 1. **screen -> canvas**: client (CSS) pixels to backing-store pixels,
//!    correcting for the ratio between the element's bounding rect and its
//!    pixel size.
//! 2. **view flip**: mirror for a flipped view ("flip canvas", not a layer
//!    flip).
//! 3. **canvas -> world**: undo the camera's pan/zoom/rotation.
//! 4. **world -> layer-local**: apply the inverse of the layer's model matrix.
//!
//! Rendering must use [`CoordinatePipeline::display_matrix`], the exact
//! forward of stages 2-3, or drawn and displayed positions drift apart.

use crate::matrix::Matrix;
use kurbo::{Affine, Point, Rect, Size, Vec2};
use serde::{Deserialize, Serialize};

/// Smallest zoom the camera accepts
pub const MIN_ZOOM: f64 = 1e-3;

/// View mirroring applied to the whole canvas
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewFlip {
    pub horizontal: bool,
    pub vertical: bool,
}

/// Camera mapping world (document) space onto the canvas
///
/// `canvas = T(pan) * R(rotation) * S(zoom) * world`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewTransform {
    pub pan: Vec2,
    pub zoom: f64,
    /// Radians
    pub rotation: f64,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            pan: Vec2::ZERO,
            zoom: 1.0,
            rotation: 0.0,
        }
    }
}

impl ViewTransform {
    pub fn to_matrix(&self) -> Matrix {
        let zoom = self.zoom.abs().max(MIN_ZOOM);
        Matrix::from(
            Affine::translate(self.pan) * Affine::rotate(self.rotation) * Affine::scale(zoom),
        )
    }

    /// Zoom by `factor` keeping `anchor` (canvas space) fixed on screen
    pub fn zoom_about(&mut self, factor: f64, anchor: Point) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let new_zoom = (self.zoom * factor).max(MIN_ZOOM);
        let applied = new_zoom / self.zoom;
        self.pan = anchor.to_vec2() + (self.pan - anchor.to_vec2()) * applied;
        self.zoom = new_zoom;
    }
}

/// A pointer position resolved through the pipeline
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedPointer {
    /// Backing-store pixel position, after the view flip
    pub canvas: Point,
    /// Document position
    pub world: Point,
}

/// Stage 1: client coordinates to backing-store pixels
///
/// Returns `None` when the element has no layout size yet.
pub fn screen_to_canvas(client: Point, bounding_rect: Rect, canvas_size: Size) -> Option<Point> {
    let rect_w = bounding_rect.width();
    let rect_h = bounding_rect.height();
    if !(rect_w > 0.0 && rect_h > 0.0) || !(canvas_size.width > 0.0 && canvas_size.height > 0.0) {
        return None;
    }
    let scale_x = canvas_size.width / rect_w;
    let scale_y = canvas_size.height / rect_h;
    let x = (client.x - bounding_rect.x0) * scale_x;
    let y = (client.y - bounding_rect.y0) * scale_y;
    if x.is_finite() && y.is_finite() {
        Some(Point::new(x, y))
    } else {
        None
    }
}

/// Stage 2: mirror a canvas point for a flipped view
pub fn apply_view_flip(point: Point, flip: ViewFlip, canvas_size: Size) -> Point {
    Point::new(
        if flip.horizontal { canvas_size.width - point.x } else { point.x },
        if flip.vertical { canvas_size.height - point.y } else { point.y },
    )
}

/// Matrix form of [`apply_view_flip`]
pub fn view_flip_matrix(flip: ViewFlip, canvas_size: Size) -> Matrix {
    let (a, e) = if flip.horizontal { (-1.0, canvas_size.width) } else { (1.0, 0.0) };
    let (d, f) = if flip.vertical { (-1.0, canvas_size.height) } else { (1.0, 0.0) };
    Matrix::from_coeffs([a, 0.0, 0.0, d, e, f])
}

/// Stage 4: a canvas/world point into a layer's own pixel space
///
/// `None` if the model matrix cannot be inverted.
pub fn canvas_to_layer_local(point: Point, model: &Matrix) -> Option<Point> {
    model.invert().ok().map(|inv| inv.apply_to_point(point))
}

/// Inverse of [`canvas_to_layer_local`]
pub fn layer_local_to_canvas(point: Point, model: &Matrix) -> Point {
    model.apply_to_point(point)
}

/// Hit test against a layer's local bounds
///
/// `supersample` scales local coordinates up when the payload is stored at a
/// higher resolution than the document.
pub fn is_point_on_layer(world: Point, model: &Matrix, local_bounds: Rect, supersample: f64) -> bool {
    match canvas_to_layer_local(world, model) {
        Some(local) => {
            let scaled = Point::new(local.x * supersample, local.y * supersample);
            scaled.x >= local_bounds.x0
                && scaled.x < local_bounds.x1
                && scaled.y >= local_bounds.y0
                && scaled.y < local_bounds.y1
        }
        None => false,
    }
}

/// The full pointer pipeline for one canvas
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatePipeline {
    /// Backing-store size of the display canvas
    pub viewport: Size,
    /// Size of the drawing document (world bounds)
    pub document: Size,
    pub flip: ViewFlip,
    pub view: ViewTransform,
}

impl CoordinatePipeline {
    /// Pipeline where the viewport shows the document 1:1
    pub fn new(document: Size) -> Self {
        Self {
            viewport: document,
            document,
            flip: ViewFlip::default(),
            view: ViewTransform::default(),
        }
    }

    /// World -> canvas pixels, including the view flip
    pub fn display_matrix(&self) -> Matrix {
        view_flip_matrix(self.flip, self.viewport).compose(&self.view.to_matrix())
    }

    /// Resolve a client-space pointer position
    pub fn resolve(&self, client: Point, bounding_rect: Rect) -> Option<ResolvedPointer> {
        let canvas = screen_to_canvas(client, bounding_rect, self.viewport)?;
        let canvas = apply_view_flip(canvas, self.flip, self.viewport);
        let world = self.view.to_matrix().invert().ok()?.apply_to_point(canvas);
        Some(ResolvedPointer { canvas, world })
    }

    /// World point to canvas pixels (for overlays)
    pub fn world_to_canvas(&self, world: Point) -> Point {
        self.display_matrix().apply_to_point(world)
    }

    pub fn to_layer_local(&self, world: Point, model: &Matrix) -> Option<Point> {
        canvas_to_layer_local(world, model)
    }

    pub fn layer_local_to_world(&self, local: Point, model: &Matrix) -> Point {
        layer_local_to_canvas(local, model)
    }

    /// Hit test a world point against a layer's local bounds
    pub fn is_point_on_layer(&self, world: Point, model: &Matrix, local_bounds: Rect, supersample: f64) -> bool {
        is_point_on_layer(world, model, local_bounds, supersample)
    }

    /// Inside `[0, width) x [0, height)` of the document
    pub fn in_document(&self, world: Point) -> bool {
        world.x >= 0.0
            && world.y >= 0.0
            && world.x < self.document.width
            && world.y < self.document.height
    }

    pub fn document_center(&self) -> Point {
        Point::new(self.document.width / 2.0, self.document.height / 2.0)
    }
}
