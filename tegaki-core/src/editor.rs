//! Editor: wires input intents to the layer store, transform sessions and
//! history
//!
//! The editor owns every collaborator explicitly (no globals): the layer
//! store, the undo history, the transform controller, the coordinate
//! pipeline, a render bridge and the redraw scheduler. Hosts feed it decoded
//! pointer events and keyboard intents and call [`Editor::render_frame`]
//! from their frame callback.
//!
//! Pointer-down with the transform modifier opens a pointer session on the
//! active layer; without it, it starts a stroke. An explicit
//! [`Editor::enter_transform_mode`] opens a toggled session that survives
//! several drags until [`Editor::exit_transform_mode`].

use crate::bridge::{BakeToken, RenderBridge};
use crate::config::EditorConfig;
use crate::coords::{CoordinatePipeline, ResolvedPointer};
use crate::error::{Result, TegakiError};
use crate::history::History;
use crate::layer::{BlendMode, Layer, LayerId};
use crate::layer_store::{LayerDirection, LayerStore};
use crate::matrix::Matrix;
use crate::payload::{Payload, PayloadKind, StrokePoint, StrokeStyle};
use crate::persist::{DocumentRecord, PayloadResolver};
use crate::redraw::RedrawScheduler;
use crate::session::{
    CommitOutcome, FlipAxis, SessionContext, SessionOrigin, SessionPhase, TransformController, TransformMode,
};
use image::RgbaImage;
use kurbo::{Point, Rect, Size};
use log::{debug, info, warn};
use std::collections::HashMap;

/// A pointer event in client coordinates
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointerInput {
    pub client: Point,
    /// 0.0 to 1.0; mice report 0.5
    pub pressure: f64,
    /// Transform modifier held (space/ctrl on the host side)
    pub transform_modifier: bool,
}

impl PointerInput {
    pub fn at(x: f64, y: f64) -> Self {
        Self {
            client: Point::new(x, y),
            pressure: 0.5,
            transform_modifier: false,
        }
    }

    pub fn with_modifier(mut self) -> Self {
        self.transform_modifier = true;
        self
    }
}

#[derive(Debug)]
struct StrokeState {
    layer: LayerId,
    last: Option<StrokePoint>,
    drew: bool,
}

pub struct Editor<B: RenderBridge> {
    store: LayerStore,
    history: History,
    controller: TransformController,
    pipeline: CoordinatePipeline,
    bridge: B,
    redraw: RedrawScheduler,
    config: EditorConfig,
    canvas_rect: Rect,
    style: StrokeStyle,
    stroke: Option<StrokeState>,
}

impl<B: RenderBridge> Editor<B> {
    pub fn new(store: LayerStore, bridge: B, config: EditorConfig) -> Self {
        let document = Size::new(store.width() as f64, store.height() as f64);
        let history = History::new(&store, config.max_undo_depth);
        Self {
            store,
            history,
            controller: TransformController::new(),
            pipeline: CoordinatePipeline::new(document),
            bridge,
            redraw: RedrawScheduler::new(),
            config,
            canvas_rect: Rect::from_origin_size(Point::ORIGIN, document),
            style: StrokeStyle::default(),
            stroke: None,
        }
    }

    /// New document with just a background layer
    pub fn with_document(width: u32, height: u32, kind: PayloadKind, bridge: B, config: EditorConfig) -> Self {
        Self::new(LayerStore::new(width, height, kind), bridge, config)
    }

    pub fn store(&self) -> &LayerStore {
        &self.store
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &CoordinatePipeline {
        &self.pipeline
    }

    /// Camera, viewport size and view flip; the next pointer event and
    /// frame use the new values
    pub fn pipeline_mut(&mut self) -> &mut CoordinatePipeline {
        self.redraw.request(self.store.bounds());
        &mut self.pipeline
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn redraw(&self) -> &RedrawScheduler {
        &self.redraw
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.controller.phase()
    }

    pub fn controller(&self) -> &TransformController {
        &self.controller
    }

    /// Client-space rectangle of the canvas element
    pub fn set_canvas_rect(&mut self, rect: Rect) {
        self.canvas_rect = rect;
    }

    pub fn set_stroke_style(&mut self, style: StrokeStyle) {
        self.style = style;
    }

    pub fn resolve(&self, client: Point) -> Option<ResolvedPointer> {
        self.pipeline.resolve(client, self.canvas_rect)
    }

    /// Topmost visible, non-background layer whose bounds contain the pointer
    pub fn layer_at(&self, client: Point) -> Option<LayerId> {
        let world = self.resolve(client)?.world;
        self.store
            .layers()
            .iter()
            .rev()
            .filter(|l| l.visible() && !l.is_background())
            .find(|l| {
                self.pipeline
                    .is_point_on_layer(world, &l.model_matrix(), l.local_bounds(), self.config.supersample)
            })
            .map(|l| l.id())
    }

    // ==================== Pointer ====================

    pub fn pointer_down(&mut self, input: PointerInput) -> Result<()> {
        let Some(pointer) = self.resolve(input.client) else {
            debug!("Ignoring pointer-down before the canvas has a size");
            return Ok(());
        };
        if self.controller.is_active() {
            return self.with_session(|ctl, ctx| ctl.pointer_down(ctx, pointer.world));
        }
        if input.transform_modifier {
            let layer_id = self.active_layer_id()?;
            return self.with_session(|ctl, ctx| {
                ctl.begin(ctx, layer_id, TransformMode::Move, SessionOrigin::Pointer, Some(pointer.world))
            });
        }
        self.begin_stroke(pointer.world, input.pressure)
    }

    pub fn pointer_move(&mut self, input: PointerInput) -> Result<()> {
        let Some(pointer) = self.resolve(input.client) else {
            return Ok(());
        };
        if self.controller.is_active() {
            self.transform_op(|ctl, ctx| ctl.pointer_move(ctx, pointer.world))?;
            return Ok(());
        }
        if self.stroke.is_some() {
            self.continue_stroke(pointer.world, input.pressure)?;
        }
        Ok(())
    }

    /// Returns the session outcome if this release ended a transform
    ///
    /// A release that can't be resolved (canvas without a size) ends the
    /// gesture where the pointer was last seen.
    pub fn pointer_up(&mut self, input: PointerInput) -> Result<Option<CommitOutcome>> {
        let pointer = self.resolve(input.client);
        if self.controller.is_active() {
            let last_seen = self.controller.session().and_then(|s| s.last_pointer());
            let Some(world) = pointer.map(|p| p.world).or(last_seen) else {
                debug!("Pointer-up without a position and no drag in progress");
                return Ok(None);
            };
            let outcome = self.transform_op(|ctl, ctx| ctl.pointer_up(ctx, world))?;
            return Ok(Some(outcome));
        }
        if let Some(pointer) = pointer {
            if self.stroke.is_some() {
                self.continue_stroke(pointer.world, input.pressure)?;
            }
        }
        self.finish_stroke();
        Ok(None)
    }

    /// Pointer capture or window focus lost: drop any session, keep what
    /// was drawn so far
    pub fn interrupt(&mut self) {
        self.cancel_session();
        self.finish_stroke();
    }

    // ==================== Transform intents ====================

    /// Open a toggled transform session on `layer_id`
    pub fn enter_transform_mode(&mut self, layer_id: LayerId) -> Result<()> {
        self.ensure_no_stroke()?;
        self.with_session(|ctl, ctx| ctl.begin(ctx, layer_id, TransformMode::Move, SessionOrigin::Toggle, None))
    }

    /// Confirm (`commit == true`) or abandon the open session
    pub fn exit_transform_mode(&mut self, commit: bool) -> Result<CommitOutcome> {
        if !commit {
            if !self.cancel_session() {
                return Err(TegakiError::NoActiveSession);
            }
            return Ok(CommitOutcome::NoChange);
        }
        self.transform_op(|ctl, ctx| ctl.commit(ctx))
    }

    pub fn set_transform_mode(&mut self, mode: TransformMode) -> Result<()> {
        self.with_session(|ctl, ctx| ctl.set_mode(ctx, mode))
    }

    pub fn nudge(&mut self, dx: f64, dy: f64) -> Result<()> {
        self.transform_op(|ctl, ctx| ctl.nudge(ctx, dx, dy))
    }

    /// Arrow-key nudge in units of the configured step
    pub fn nudge_steps(&mut self, x_steps: i32, y_steps: i32) -> Result<()> {
        let step = self.config.nudge_step;
        self.nudge(x_steps as f64 * step, y_steps as f64 * step)
    }

    pub fn rotate_step(&mut self, delta_radians: f64) -> Result<()> {
        self.transform_op(|ctl, ctx| ctl.rotate_step(ctx, delta_radians))
    }

    pub fn scale_step(&mut self, factor: f64) -> Result<()> {
        self.transform_op(|ctl, ctx| ctl.scale_step(ctx, factor))
    }

    /// Flip the session layer, or the active layer as one undoable step
    pub fn flip(&mut self, axis: FlipAxis) -> Result<CommitOutcome> {
        self.ensure_no_stroke()?;
        self.transform_op(|ctl, ctx| ctl.flip(ctx, axis))
    }

    /// Wheel during a session: rotate with `rotate`, otherwise scale
    pub fn wheel(&mut self, delta: f64, rotate: bool) -> Result<()> {
        if rotate {
            self.rotate_step(delta * self.config.rotate_sensitivity)
        } else {
            self.scale_step((-delta * self.config.scale_sensitivity).exp())
        }
    }

    /// Deliver a bake the bridge finished asynchronously
    pub fn resolve_bake(&mut self, token: BakeToken, result: Result<Payload>) -> CommitOutcome {
        let target = self.controller.target();
        let before = target.and_then(|id| self.layer_world_bounds(id));
        let outcome = self.with_session(|ctl, ctx| ctl.resolve_bake(ctx, token, result));
        if let Some(id) = target {
            self.request_layer_redraw(id, before);
        }
        outcome
    }

    // ==================== History ====================

    /// Step back one entry; any open session is cancelled first
    pub fn undo(&mut self) -> bool {
        self.cancel_session();
        self.finish_stroke();
        let changed = self.history.undo(&mut self.store);
        if changed {
            self.redraw.request(self.store.bounds());
        }
        changed
    }

    pub fn redo(&mut self) -> bool {
        self.cancel_session();
        self.finish_stroke();
        let changed = self.history.redo(&mut self.store);
        if changed {
            self.redraw.request(self.store.bounds());
        }
        changed
    }

    // ==================== Layers ====================

    pub fn set_active_layer(&mut self, id: LayerId) -> Result<()> {
        self.store.set_active(id)
    }

    pub fn create_layer(&mut self, name: impl Into<String>) -> Result<LayerId> {
        self.ensure_idle()?;
        let id = self.store.create_layer(name);
        self.history.record(&self.store, "New layer");
        Ok(id)
    }

    pub fn duplicate_layer(&mut self, id: LayerId) -> Result<LayerId> {
        self.ensure_idle()?;
        let copy = self.store.duplicate_layer(id)?;
        self.history.record(&self.store, "Duplicate layer");
        self.redraw.request(self.store.bounds());
        Ok(copy)
    }

    pub fn delete_layer(&mut self, id: LayerId) -> Result<()> {
        self.ensure_idle()?;
        self.store.delete_layer(id)?;
        self.history.record(&self.store, "Delete layer");
        self.redraw.request(self.store.bounds());
        Ok(())
    }

    pub fn merge_down(&mut self, id: LayerId) -> Result<LayerId> {
        self.ensure_idle()?;
        let merged = self.store.merge_down(id, &mut self.bridge)?;
        self.history.record(&self.store, "Merge down");
        self.redraw.request(self.store.bounds());
        Ok(merged)
    }

    pub fn move_layer(&mut self, id: LayerId, direction: LayerDirection) -> Result<()> {
        self.ensure_idle()?;
        self.store.move_layer(id, direction)?;
        self.history.record(&self.store, "Move layer");
        self.redraw.request(self.store.bounds());
        Ok(())
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> Result<()> {
        self.ensure_idle()?;
        self.store.rename_layer(id, name)?;
        self.history.record(&self.store, "Rename layer");
        Ok(())
    }

    pub fn set_visibility(&mut self, id: LayerId, visible: bool) -> Result<()> {
        self.ensure_idle()?;
        self.store.set_visibility(id, visible)?;
        self.history.record(&self.store, if visible { "Show layer" } else { "Hide layer" });
        self.request_layer_redraw(id, None);
        Ok(())
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f64) -> Result<()> {
        self.ensure_idle()?;
        self.store.set_opacity(id, opacity)?;
        self.history.record(&self.store, "Change opacity");
        self.request_layer_redraw(id, None);
        Ok(())
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> Result<()> {
        self.ensure_idle()?;
        self.store.set_blend_mode(id, mode)?;
        self.history.record(&self.store, "Change blend mode");
        self.request_layer_redraw(id, None);
        Ok(())
    }

    // ==================== Documents ====================

    pub fn save_document(&self) -> (DocumentRecord, HashMap<String, Payload>) {
        self.store.to_records()
    }

    /// Replace the document; returns the repairs made while loading
    pub fn load_document(&mut self, record: &DocumentRecord, payloads: &dyn PayloadResolver) -> Vec<TegakiError> {
        self.cancel_session();
        self.stroke = None;
        let (store, diagnostics) = LayerStore::from_records(record, payloads);
        self.pipeline.document = Size::new(store.width() as f64, store.height() as f64);
        self.store = store;
        self.history.clear(&self.store);
        self.redraw.request(self.store.bounds());
        info!("Document loaded: {}x{}, {} layers", record.width, record.height, self.store.len());
        diagnostics
    }

    // ==================== Rendering ====================

    /// Composite every visible layer into a document-sized `target` within
    /// `dirty` (world pixels), ignoring the camera
    pub fn composite(&mut self, target: &mut RgbaImage, dirty: Rect) -> Result<()> {
        self.bridge
            .composite_layers(self.store.layers(), Matrix::IDENTITY, target, dirty)
    }

    /// Frame callback: repaint the coalesced dirty region, if any
    ///
    /// `target` is viewport-sized and receives the document through the same
    /// view flip and camera that [`Editor::resolve`] inverts. Returns the
    /// repainted region in viewport pixels.
    pub fn render_frame(&mut self, target: &mut RgbaImage) -> Result<Option<Rect>> {
        let Some(dirty) = self.redraw.take_frame() else {
            return Ok(None);
        };
        let display = self.pipeline.display_matrix();
        let viewport = Rect::new(0.0, 0.0, target.width() as f64, target.height() as f64);
        let dirty = display
            .as_affine()
            .transform_rect_bbox(dirty.intersect(self.store.bounds()))
            .expand()
            .intersect(viewport);
        clear_rect(target, dirty);
        self.bridge
            .composite_layers(self.store.layers(), display, target, dirty)?;
        Ok(Some(dirty))
    }

    // ==================== Internals ====================

    fn active_layer_id(&self) -> Result<LayerId> {
        self.store
            .active_id()
            .ok_or_else(|| TegakiError::InvalidTarget("no active layer".to_string()))
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.controller.is_active() {
            warn!("Layer operation rejected while a transform is open");
            return Err(TegakiError::SessionActive);
        }
        Ok(())
    }

    fn ensure_no_stroke(&self) -> Result<()> {
        if self.stroke.is_some() {
            return Err(TegakiError::InvalidTarget("a stroke is in progress".to_string()));
        }
        Ok(())
    }

    fn with_session<R>(&mut self, f: impl FnOnce(&mut TransformController, &mut SessionContext<'_>) -> R) -> R {
        let mut ctx = SessionContext {
            store: &mut self.store,
            history: &mut self.history,
            bridge: &mut self.bridge,
            config: &self.config,
            document_center: self.pipeline.document_center(),
        };
        f(&mut self.controller, &mut ctx)
    }

    /// Run a session step and repaint wherever the target layer was or is
    fn transform_op<R>(
        &mut self,
        f: impl FnOnce(&mut TransformController, &mut SessionContext<'_>) -> Result<R>,
    ) -> Result<R> {
        let target = self.controller.target().or_else(|| self.store.active_id());
        let before = target.and_then(|id| self.layer_world_bounds(id));
        let result = self.with_session(f);
        if let Some(id) = target {
            self.request_layer_redraw(id, before);
        }
        result
    }

    fn cancel_session(&mut self) -> bool {
        let target = self.controller.target();
        let before = target.and_then(|id| self.layer_world_bounds(id));
        let cancelled = self.controller.cancel(&mut self.store);
        if let Some(id) = target {
            self.request_layer_redraw(id, before);
        }
        cancelled
    }

    fn layer_world_bounds(&self, id: LayerId) -> Option<Rect> {
        self.store.get(id).map(world_bounds)
    }

    fn request_layer_redraw(&mut self, id: LayerId, before: Option<Rect>) {
        let after = self.layer_world_bounds(id);
        let dirty = match (before, after) {
            (Some(a), Some(b)) => a.union(b),
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => return,
        };
        self.redraw.request(dirty);
    }

    fn begin_stroke(&mut self, world: Point, pressure: f64) -> Result<()> {
        let layer_id = self.active_layer_id()?;
        let layer = self
            .store
            .get(layer_id)
            .ok_or(TegakiError::LayerNotFound(layer_id))?;
        if !layer.visible() {
            warn!("Not drawing on hidden layer {}", layer_id);
            return Err(TegakiError::InvalidTarget("hidden layer cannot be drawn on".to_string()));
        }
        self.stroke = Some(StrokeState {
            layer: layer_id,
            last: None,
            drew: false,
        });
        self.continue_stroke(world, pressure)
    }

    fn continue_stroke(&mut self, world: Point, pressure: f64) -> Result<()> {
        let Some(stroke) = self.stroke.as_mut() else {
            return Ok(());
        };
        if self.controller.target() == Some(stroke.layer) {
            return Err(TegakiError::SessionActive);
        }
        if !self.pipeline.in_document(world) {
            // Off the page: break the stroke, never clamp it to the edge
            stroke.last = None;
            return Ok(());
        }
        let layer = self.store.layer_mut(stroke.layer)?;
        let model = layer.model_matrix();
        let Some(local) = self.pipeline.to_layer_local(world, &model) else {
            debug!("Layer {} matrix is singular; not drawing", stroke.layer);
            return Ok(());
        };
        let point = StrokePoint::new(local.x, local.y, pressure.clamp(0.0, 1.0));
        let segment: Vec<StrokePoint> = match stroke.last {
            Some(prev) => vec![prev, point],
            None => vec![point],
        };
        self.bridge.draw_stroke(&segment, &self.style, layer.payload_mut())?;
        stroke.last = Some(point);
        stroke.drew = true;

        let pad = self.style.width;
        let local_rect = segment
            .iter()
            .fold(Rect::from_points(point.point(), point.point()), |r, p| r.union_pt(p.point()))
            .inflate(pad, pad);
        let dirty = model.as_affine().transform_rect_bbox(local_rect);
        self.redraw.request(dirty);
        Ok(())
    }

    fn finish_stroke(&mut self) {
        if let Some(stroke) = self.stroke.take() {
            if stroke.drew {
                self.history.record(&self.store, "Draw stroke");
            }
        }
    }
}

/// Document-space bounding box of a layer as currently displayed
fn world_bounds(layer: &Layer) -> Rect {
    layer
        .model_matrix()
        .as_affine()
        .transform_rect_bbox(layer.local_bounds())
}

fn clear_rect(target: &mut RgbaImage, rect: Rect) {
    let x1 = (rect.x1.max(0.0) as u32).min(target.width());
    let y1 = (rect.y1.max(0.0) as u32).min(target.height());
    for y in (rect.y0.max(0.0) as u32)..y1 {
        for x in (rect.x0.max(0.0) as u32)..x1 {
            target.put_pixel(x, y, image::Rgba([0, 0, 0, 0]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CpuRenderBridge;
    use crate::config::ResamplePolicy;

    fn editor() -> Editor<CpuRenderBridge> {
        let config = EditorConfig {
            resample: ResamplePolicy::Nearest,
            ..EditorConfig::default()
        };
        let bridge = CpuRenderBridge::new(ResamplePolicy::Nearest);
        let mut editor = Editor::with_document(40, 30, PayloadKind::Raster, bridge, config);
        editor.create_layer("Ink").unwrap();
        editor
    }

    fn pen(x: f64, y: f64) -> PointerInput {
        PointerInput {
            pressure: 1.0,
            ..PointerInput::at(x, y)
        }
    }

    fn alpha_at(editor: &Editor<CpuRenderBridge>, x: u32, y: u32) -> u8 {
        match editor.store().get_active_layer().unwrap().payload() {
            Payload::Raster(img) => img.get_pixel(x, y)[3],
            Payload::Paths(_) => 0,
        }
    }

    #[test]
    fn test_stroke_records_one_entry() {
        let mut editor = editor();
        let before = editor.history().len();
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_move(pen(10.0, 5.0)).unwrap();
        editor.pointer_up(pen(15.0, 5.0)).unwrap();
        assert_eq!(editor.history().len(), before + 1);
        assert_eq!(editor.history().undo_description(), Some("Draw stroke"));
        assert!(alpha_at(&editor, 12, 5) > 0);
    }

    #[test]
    fn test_off_document_points_break_stroke() {
        let mut editor = editor();
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_move(pen(-20.0, 5.0)).unwrap();
        editor.pointer_move(pen(5.0, 25.0)).unwrap();
        editor.pointer_up(pen(5.0, 25.0)).unwrap();
        // No segment joins the two dabs across the gap
        assert_eq!(alpha_at(&editor, 5, 15), 0);
        assert!(alpha_at(&editor, 5, 25) > 0);
    }

    #[test]
    fn test_modifier_drag_moves_layer() {
        let mut editor = editor();
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_up(pen(5.0, 5.0)).unwrap();
        let entries = editor.history().len();

        editor.pointer_down(pen(10.0, 10.0).with_modifier()).unwrap();
        editor.pointer_move(pen(13.0, 14.0).with_modifier()).unwrap();
        let outcome = editor.pointer_up(pen(13.0, 14.0).with_modifier()).unwrap();
        assert!(matches!(outcome, Some(CommitOutcome::Committed { .. })));
        assert_eq!(editor.history().len(), entries + 1);
        assert!(alpha_at(&editor, 8, 9) > 0);
        assert_eq!(alpha_at(&editor, 5, 5), 0);
    }

    #[test]
    fn test_drawing_respects_layer_matrix() {
        let mut editor = editor();
        let id = editor.store().active_id().unwrap();
        editor.store.set_model_matrix(id, Matrix::from_translation(20.0, 0.0)).unwrap();
        editor.pointer_down(pen(25.0, 5.0)).unwrap();
        editor.pointer_up(pen(25.0, 5.0)).unwrap();
        assert!(alpha_at(&editor, 5, 5) > 0);
    }

    #[test]
    fn test_layer_at_follows_transform() {
        let mut editor = editor();
        let id = editor.store().active_id().unwrap();
        assert_eq!(editor.layer_at(Point::new(5.0, 5.0)), Some(id));
        editor.store.set_model_matrix(id, Matrix::from_translation(20.0, 0.0)).unwrap();
        assert_eq!(editor.layer_at(Point::new(5.0, 5.0)), None);
        assert_eq!(editor.layer_at(Point::new(25.0, 5.0)), Some(id));
    }

    #[test]
    fn test_layer_ops_rejected_during_session() {
        let mut editor = editor();
        let id = editor.store().active_id().unwrap();
        editor.enter_transform_mode(id).unwrap();
        assert_eq!(editor.create_layer("Nope"), Err(TegakiError::SessionActive));
        assert_eq!(editor.delete_layer(id), Err(TegakiError::SessionActive));
        assert!(editor.exit_transform_mode(false).is_ok());
        assert_eq!(editor.session_phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_undo_cancels_open_session() {
        let mut editor = editor();
        let id = editor.store().active_id().unwrap();
        editor.enter_transform_mode(id).unwrap();
        editor.nudge(4.0, 0.0).unwrap();
        assert!(editor.undo());
        assert_eq!(editor.session_phase(), SessionPhase::Idle);
        // Undid layer creation
        assert_eq!(editor.store().len(), 1);
        assert!(editor.store().check_invariants());
    }

    #[test]
    fn test_wheel_needs_a_session() {
        let mut editor = editor();
        assert_eq!(editor.wheel(3.0, true), Err(TegakiError::NoActiveSession));
    }

    #[test]
    fn test_interrupt_cancels_and_keeps_stroke() {
        let mut editor = editor();
        let entries = editor.history().len();
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.interrupt();
        assert_eq!(editor.history().len(), entries + 1);

        let id = editor.store().active_id().unwrap();
        let before = editor.store().get(id).unwrap().clone();
        editor.pointer_down(pen(10.0, 10.0).with_modifier()).unwrap();
        editor.pointer_move(pen(20.0, 10.0)).unwrap();
        editor.interrupt();
        assert_eq!(editor.store().get(id).unwrap(), &before);
    }

    #[test]
    fn test_render_frame_composites_dirty_region() {
        let mut editor = editor();
        let mut frame = RgbaImage::new(40, 30);
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_up(pen(5.0, 5.0)).unwrap();

        let dirty = editor.render_frame(&mut frame).unwrap();
        assert!(dirty.is_some());
        assert_eq!(frame.get_pixel(5, 5)[0], 0);
        assert_eq!(frame.get_pixel(5, 5)[3], 255);
        assert_eq!(editor.render_frame(&mut frame).unwrap(), None);
    }

    #[test]
    fn test_unresolvable_release_ends_drag_at_last_position() {
        let mut editor = editor();
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_up(pen(5.0, 5.0)).unwrap();
        let entries = editor.history().len();

        editor.pointer_down(pen(10.0, 10.0).with_modifier()).unwrap();
        editor.pointer_move(pen(14.0, 10.0)).unwrap();
        assert_eq!(editor.session_phase(), SessionPhase::Dragging);

        editor.set_canvas_rect(Rect::ZERO);
        let outcome = editor.pointer_up(pen(30.0, 30.0)).unwrap();
        assert!(matches!(outcome, Some(CommitOutcome::Committed { .. })), "got {:?}", outcome);
        assert_eq!(editor.session_phase(), SessionPhase::Idle);
        assert_eq!(editor.history().len(), entries + 1);
        assert!(!editor.store().get_active_layer().unwrap().is_previewing());
        assert_eq!(alpha_at(&editor, 9, 5), 255);
    }

    #[test]
    fn test_render_frame_uses_view_flip() {
        let mut editor = editor();
        editor.pipeline_mut().flip.horizontal = true;
        let mut frame = RgbaImage::new(40, 30);
        editor.pointer_down(pen(5.0, 5.0)).unwrap();
        editor.pointer_up(pen(5.0, 5.0)).unwrap();

        // Stored mirrored in the document...
        assert_eq!(alpha_at(&editor, 35, 5), 255);
        assert_eq!(alpha_at(&editor, 5, 5), 0);

        // ...and shown back under the pointer
        editor.render_frame(&mut frame).unwrap();
        assert_eq!(frame.get_pixel(4, 5)[3], 255);
        assert_eq!(frame.get_pixel(35, 5)[3], 0);
    }
}
