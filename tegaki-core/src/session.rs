//! Transform session controller
//!
//! State machine for non-destructive layer transforms:
//!
//! ```text
//! Idle -> Pending -> Dragging -> Committing -> Idle
//!            |           |            |
//!            +-----------+------------+--> (cancel) Idle
//! ```
//!
//! - **Pending**: the original matrix and a staged copy of the payload are
//!   captured, nothing on the layer has changed yet. Committing from here is
//!   a no-op.
//! - **Dragging**: entered on the first pointer move past the drag epsilon
//!   (or the first keyboard/wheel step). Only now is the live payload swapped
//!   for a blank and the staged copy shown as preview under the live matrix.
//! - **Committing**: a bake was handed to the render bridge and has not come
//!   back yet. A result for a session that was cancelled meanwhile is
//!   discarded by token.
//!
//! Candidate matrix: `gesture * accumulated * original`, where `accumulated`
//! holds finished gestures and discrete steps and `gesture` is the pointer
//! drag in progress. All deltas are in world space; rotation, scale and flip
//! pivot about [`ActiveSession::pivot`], fixed for the whole session so
//! preview and bake agree.

use crate::bridge::{BakeJob, BakeRequest, BakeToken, RenderBridge};
use crate::config::{EditorConfig, PivotPolicy};
use crate::error::{Result, TegakiError};
use crate::history::History;
use crate::layer::LayerId;
use crate::layer_store::LayerStore;
use crate::matrix::Matrix;
use crate::payload::{Bakeable, Payload};
use kurbo::{Point, Vec2};
use log::{debug, info, warn};
use std::sync::Arc;

/// What a pointer drag does
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformMode {
    /// Translate by the drag delta
    Move,
    /// Horizontal drag rotates, vertical drag scales uniformly
    RotateScale,
}

/// How the session was opened, which decides what pointer-up means
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Modifier + pointer-down; pointer-up commits
    Pointer,
    /// Explicit transform mode; stays open until confirmed or cancelled
    Toggle,
    /// Single keyboard action committed in one step
    Discrete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

/// Coarse state, for callers that don't need the session details
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Pending,
    Dragging,
    Committing,
}

/// Result of asking a session to commit
#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    /// Payload rewritten, matrix reset, one history entry pushed
    Committed { layer_id: LayerId, applied: Matrix },
    /// Nothing moved; layer and history untouched
    NoChange,
    /// Waiting for the bridge to call back with this token
    Deferred(BakeToken),
    /// The bake failed and the layer was reverted
    Failed(TegakiError),
    /// A bake result arrived for a session that no longer exists
    Discarded,
}

#[derive(Clone, Copy, Debug)]
struct Gesture {
    anchor: Point,
    current: Point,
}

/// State carried from session start to commit/cancel
#[derive(Clone, Debug)]
pub struct ActiveSession {
    generation: u64,
    layer_id: LayerId,
    original_matrix: Matrix,
    staged: Arc<Payload>,
    mode: TransformMode,
    origin: SessionOrigin,
    pivot: Point,
    accumulated: Matrix,
    gesture: Option<Gesture>,
    description: String,
}

impl ActiveSession {
    pub fn layer_id(&self) -> LayerId {
        self.layer_id
    }

    pub fn original_matrix(&self) -> Matrix {
        self.original_matrix
    }

    pub fn staged_payload(&self) -> &Payload {
        &self.staged
    }

    pub fn mode(&self) -> TransformMode {
        self.mode
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    /// World-space point rotations and flips turn about
    pub fn pivot(&self) -> Point {
        self.pivot
    }

    /// Where the drag in progress last saw the pointer
    pub fn last_pointer(&self) -> Option<Point> {
        self.gesture.map(|g| g.current)
    }

    fn gesture_delta(&self, config: &EditorConfig) -> Matrix {
        let Some(gesture) = self.gesture else {
            return Matrix::IDENTITY;
        };
        let delta: Vec2 = gesture.current - gesture.anchor;
        match self.mode {
            TransformMode::Move => Matrix::from_translation(delta.x, delta.y),
            TransformMode::RotateScale => {
                let angle = delta.x * config.rotate_sensitivity;
                let factor = (-delta.y * config.scale_sensitivity).exp();
                // Floor is relative to what the gesture is applied on, so
                // repeated drags can't compound below the minimum scale
                let base_scale = (self.accumulated * self.original_matrix).mean_scale();
                let floor = if base_scale > 0.0 {
                    (config.min_scale / base_scale).min(1.0)
                } else {
                    1.0
                };
                let factor = factor.max(floor);
                Matrix::IDENTITY
                    .then_scale_about(factor, factor, self.pivot, config.min_scale)
                    .then_rotate_about(angle, self.pivot)
            }
        }
    }

    fn candidate(&self, config: &EditorConfig) -> Matrix {
        self.gesture_delta(config) * self.accumulated * self.original_matrix
    }

    /// Fold the gesture in progress into the accumulated delta
    fn fold_gesture(&mut self, config: &EditorConfig) {
        self.accumulated = self.gesture_delta(config) * self.accumulated;
        self.gesture = None;
    }
}

#[derive(Clone, Debug, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Pending(ActiveSession),
    Dragging(ActiveSession),
    Committing {
        session: ActiveSession,
        token: BakeToken,
        matrix: Matrix,
    },
}

/// Everything a session step may touch
pub struct SessionContext<'a> {
    pub store: &'a mut LayerStore,
    pub history: &'a mut History,
    pub bridge: &'a mut dyn RenderBridge,
    pub config: &'a EditorConfig,
    /// Center of the document in world space
    pub document_center: Point,
}

/// Drives [`SessionState`]
#[derive(Debug, Default)]
pub struct TransformController {
    state: SessionState,
    next_generation: u64,
}

impl TransformController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> SessionPhase {
        match self.state {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Pending(_) => SessionPhase::Pending,
            SessionState::Dragging(_) => SessionPhase::Dragging,
            SessionState::Committing { .. } => SessionPhase::Committing,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, SessionState::Idle)
    }

    pub fn session(&self) -> Option<&ActiveSession> {
        match &self.state {
            SessionState::Idle => None,
            SessionState::Pending(s) | SessionState::Dragging(s) => Some(s),
            SessionState::Committing { session, .. } => Some(session),
        }
    }

    /// Layer the open session targets
    pub fn target(&self) -> Option<LayerId> {
        self.session().map(|s| s.layer_id)
    }

    /// True once the first real movement has happened
    pub fn drag_started(&self) -> bool {
        matches!(self.state, SessionState::Dragging(_) | SessionState::Committing { .. })
    }

    /// Open a session on `layer_id`
    ///
    /// Rejected without any state change if a session is already open, or if
    /// the layer is missing, hidden or the background.
    pub fn begin(
        &mut self,
        ctx: &mut SessionContext<'_>,
        layer_id: LayerId,
        mode: TransformMode,
        origin: SessionOrigin,
        anchor: Option<Point>,
    ) -> Result<()> {
        if self.is_active() {
            warn!("Transform rejected: a session is already active");
            return Err(TegakiError::SessionActive);
        }
        let layer = ctx
            .store
            .get(layer_id)
            .ok_or_else(|| TegakiError::InvalidTarget(format!("layer {layer_id} does not exist")))?;
        if layer.is_background() {
            warn!("Transform rejected: layer {} is the background", layer_id);
            return Err(TegakiError::InvalidTarget("background layer cannot be transformed".to_string()));
        }
        if !layer.visible() {
            warn!("Transform rejected: layer {} is hidden", layer_id);
            return Err(TegakiError::InvalidTarget("hidden layer cannot be transformed".to_string()));
        }

        let original_matrix = layer.model_matrix();
        let pivot = match ctx.config.pivot {
            PivotPolicy::CanvasCenter => ctx.document_center,
            PivotPolicy::LayerCenter => original_matrix.apply_to_point(layer.local_bounds().center()),
        };
        let generation = self.next_generation;
        self.next_generation += 1;

        self.state = SessionState::Pending(ActiveSession {
            generation,
            layer_id,
            original_matrix,
            staged: layer.payload_arc(),
            mode,
            origin,
            pivot,
            accumulated: Matrix::IDENTITY,
            gesture: anchor.map(|p| Gesture { anchor: p, current: p }),
            description: "Transform layer".to_string(),
        });
        debug!("Transform session {} pending on layer {} ({:?}, {:?})", generation, layer_id, mode, origin);
        Ok(())
    }

    /// Start a new drag gesture inside an open session
    pub fn pointer_down(&mut self, ctx: &mut SessionContext<'_>, world: Point) -> Result<()> {
        let config = ctx.config;
        let session = self.open_session_mut()?;
        session.fold_gesture(config);
        session.gesture = Some(Gesture { anchor: world, current: world });
        Ok(())
    }

    /// Track the pointer; returns true if the preview matrix changed
    pub fn pointer_move(&mut self, ctx: &mut SessionContext<'_>, world: Point) -> Result<bool> {
        let past_epsilon = match &mut self.state {
            SessionState::Pending(session) => match session.gesture.as_mut() {
                Some(gesture) => {
                    gesture.current = world;
                    gesture.anchor.distance(world) > ctx.config.drag_epsilon
                }
                None => return Ok(false),
            },
            SessionState::Dragging(session) => match session.gesture.as_mut() {
                Some(gesture) => {
                    gesture.current = world;
                    false
                }
                None => return Ok(false),
            },
            _ => return Ok(false),
        };
        if matches!(self.state, SessionState::Pending(_)) {
            if !past_epsilon {
                return Ok(false);
            }
            self.start_drag(ctx.store)?;
        }
        self.write_preview(ctx)?;
        Ok(true)
    }

    /// Release the pointer
    ///
    /// Pointer sessions commit; toggled sessions keep the gesture and stay open.
    pub fn pointer_up(&mut self, ctx: &mut SessionContext<'_>, world: Point) -> Result<CommitOutcome> {
        self.pointer_move(ctx, world)?;
        let config = ctx.config;
        let keep_open = match &mut self.state {
            SessionState::Idle => return Err(TegakiError::NoActiveSession),
            SessionState::Committing { token, .. } => return Ok(CommitOutcome::Deferred(*token)),
            SessionState::Pending(session) | SessionState::Dragging(session)
                if session.origin != SessionOrigin::Pointer =>
            {
                session.fold_gesture(config);
                true
            }
            _ => false,
        };
        if keep_open {
            Ok(CommitOutcome::NoChange)
        } else {
            self.commit(ctx)
        }
    }

    /// Switch between move and rotate/scale without losing the current drag
    pub fn set_mode(&mut self, ctx: &mut SessionContext<'_>, mode: TransformMode) -> Result<()> {
        let config = ctx.config;
        let session = self.open_session_mut()?;
        if session.mode == mode {
            return Ok(());
        }
        let restart = session.gesture.map(|g| g.current);
        session.fold_gesture(config);
        session.mode = mode;
        session.gesture = restart.map(|p| Gesture { anchor: p, current: p });
        Ok(())
    }

    /// Move by `(dx, dy)` world pixels
    pub fn nudge(&mut self, ctx: &mut SessionContext<'_>, dx: f64, dy: f64) -> Result<()> {
        self.apply_step(ctx, Matrix::from_translation(dx, dy))
    }

    /// Rotate about the session pivot
    pub fn rotate_step(&mut self, ctx: &mut SessionContext<'_>, delta_radians: f64) -> Result<()> {
        let pivot = self.open_session()?.pivot;
        self.apply_step(ctx, Matrix::IDENTITY.then_rotate_about(delta_radians, pivot))
    }

    /// Scale uniformly about the session pivot
    ///
    /// A step that would shrink the layer below the minimum scale is ignored.
    pub fn scale_step(&mut self, ctx: &mut SessionContext<'_>, factor: f64) -> Result<()> {
        let session = self.open_session()?;
        let pivot = session.pivot;
        let step = Matrix::IDENTITY.then_scale_about(factor, factor, pivot, ctx.config.min_scale);
        let candidate = session.gesture_delta(ctx.config) * step * session.accumulated * session.original_matrix;
        let min = ctx.config.min_scale;
        if candidate.determinant().abs() < min * min {
            debug!("Ignoring scale step {} below minimum scale", factor);
            return Ok(());
        }
        self.apply_step(ctx, step)
    }

    /// Mirror about the session pivot
    ///
    /// With no open session this opens one on the active layer; when
    /// `flip_commits_immediately` is set it also commits, so a flip is one
    /// history entry.
    pub fn flip(&mut self, ctx: &mut SessionContext<'_>, axis: FlipAxis) -> Result<CommitOutcome> {
        let label = match axis {
            FlipAxis::Horizontal => "Flip layer horizontally",
            FlipAxis::Vertical => "Flip layer vertically",
        };
        let atomic = !self.is_active();
        if atomic {
            let layer_id = ctx
                .store
                .active_id()
                .ok_or_else(|| TegakiError::InvalidTarget("no active layer".to_string()))?;
            let origin = if ctx.config.flip_commits_immediately {
                SessionOrigin::Discrete
            } else {
                SessionOrigin::Toggle
            };
            self.begin(ctx, layer_id, TransformMode::Move, origin, None)?;
            if let Ok(session) = self.open_session_mut() {
                session.description = label.to_string();
            }
        }

        let pivot = self.open_session()?.pivot;
        let (sx, sy) = match axis {
            FlipAxis::Horizontal => (-1.0, 1.0),
            FlipAxis::Vertical => (1.0, -1.0),
        };
        let step = Matrix::IDENTITY.then_scale_about(sx, sy, pivot, ctx.config.min_scale);
        self.apply_step(ctx, step)?;

        if atomic && ctx.config.flip_commits_immediately {
            self.commit(ctx)
        } else {
            Ok(CommitOutcome::NoChange)
        }
    }

    /// Bake the live transform into the layer
    pub fn commit(&mut self, ctx: &mut SessionContext<'_>) -> Result<CommitOutcome> {
        match std::mem::take(&mut self.state) {
            SessionState::Idle => Err(TegakiError::NoActiveSession),
            state @ SessionState::Committing { .. } => {
                self.state = state;
                Err(TegakiError::SessionActive)
            }
            SessionState::Pending(session) => {
                debug!("Transform session {} closed without a drag", session.generation);
                ctx.store.set_model_matrix(session.layer_id, session.original_matrix)?;
                Ok(CommitOutcome::NoChange)
            }
            SessionState::Dragging(session) => {
                let matrix = session.candidate(ctx.config).round_translation();
                if matrix.approx_eq(&session.original_matrix, 1e-9) {
                    debug!("Transform session {} ended where it started", session.generation);
                    restore(ctx.store, &session);
                    return Ok(CommitOutcome::NoChange);
                }
                let token = BakeToken(session.generation);
                let job = BakeJob {
                    token,
                    layer_id: session.layer_id,
                    snapshot: Arc::clone(&session.staged),
                    matrix,
                    resample: ctx.config.resample,
                };
                // Preview shows exactly what will be baked
                ctx.store.set_model_matrix(session.layer_id, matrix)?;
                match ctx.bridge.bake_transform(job) {
                    BakeRequest::Ready(result) => Ok(finish(ctx, session, matrix, result)),
                    BakeRequest::Deferred => {
                        debug!("Transform session {} waiting for bake", session.generation);
                        self.state = SessionState::Committing { session, token, matrix };
                        Ok(CommitOutcome::Deferred(token))
                    }
                }
            }
        }
    }

    /// Deliver a deferred bake result
    ///
    /// Results for sessions that were cancelled (or already finished) are
    /// dropped.
    pub fn resolve_bake(
        &mut self,
        ctx: &mut SessionContext<'_>,
        token: BakeToken,
        result: Result<Payload>,
    ) -> CommitOutcome {
        match std::mem::take(&mut self.state) {
            SessionState::Committing { session, token: expected, matrix } if expected == token => {
                finish(ctx, session, matrix, result)
            }
            other => {
                debug!("Discarding stale bake result {:?}", token);
                self.state = other;
                CommitOutcome::Discarded
            }
        }
    }

    /// Abandon the session and put the layer back exactly as it was
    ///
    /// Works from any non-idle state, including while a bake is outstanding.
    /// Returns false if there was nothing to cancel.
    pub fn cancel(&mut self, store: &mut LayerStore) -> bool {
        let session = match std::mem::take(&mut self.state) {
            SessionState::Idle => return false,
            SessionState::Pending(s) | SessionState::Dragging(s) => s,
            SessionState::Committing { session, .. } => session,
        };
        restore(store, &session);
        info!("Transform session {} cancelled", session.generation);
        true
    }

    fn open_session(&self) -> Result<&ActiveSession> {
        match &self.state {
            SessionState::Pending(s) | SessionState::Dragging(s) => Ok(s),
            SessionState::Committing { .. } => Err(TegakiError::SessionActive),
            SessionState::Idle => Err(TegakiError::NoActiveSession),
        }
    }

    fn open_session_mut(&mut self) -> Result<&mut ActiveSession> {
        match &mut self.state {
            SessionState::Pending(s) | SessionState::Dragging(s) => Ok(s),
            SessionState::Committing { .. } => Err(TegakiError::SessionActive),
            SessionState::Idle => Err(TegakiError::NoActiveSession),
        }
    }

    /// Compose a world-space step into the accumulated delta
    fn apply_step(&mut self, ctx: &mut SessionContext<'_>, step: Matrix) -> Result<()> {
        {
            let session = self.open_session_mut()?;
            session.accumulated = step * session.accumulated;
        }
        if matches!(self.state, SessionState::Pending(_)) {
            self.start_drag(ctx.store)?;
        }
        self.write_preview(ctx)
    }

    /// Pending -> Dragging: the one place the live payload is swapped out
    fn start_drag(&mut self, store: &mut LayerStore) -> Result<()> {
        let SessionState::Pending(session) = std::mem::take(&mut self.state) else {
            return Ok(());
        };
        let layer = match store.layer_mut(session.layer_id) {
            Ok(layer) => layer,
            Err(e) => {
                self.state = SessionState::Pending(session);
                return Err(e);
            }
        };
        layer.preview = Some(Arc::clone(&session.staged));
        layer.set_payload(Arc::new(session.staged.blank_like()));
        debug!("Transform session {} dragging", session.generation);
        self.state = SessionState::Dragging(session);
        Ok(())
    }

    fn write_preview(&mut self, ctx: &mut SessionContext<'_>) -> Result<()> {
        let SessionState::Dragging(session) = &self.state else {
            return Ok(());
        };
        let candidate = session.candidate(ctx.config);
        ctx.store.set_model_matrix(session.layer_id, candidate)
    }
}

/// Put the committed payload and original matrix back
fn restore(store: &mut LayerStore, session: &ActiveSession) {
    if let Ok(layer) = store.layer_mut(session.layer_id) {
        if layer.preview.take().is_some() {
            layer.set_payload(Arc::clone(&session.staged));
        }
        layer.model_matrix = session.original_matrix;
    }
}

/// Apply a bake result: swap in the payload on success, revert on failure
fn finish(
    ctx: &mut SessionContext<'_>,
    session: ActiveSession,
    matrix: Matrix,
    result: Result<Payload>,
) -> CommitOutcome {
    match result {
        Ok(baked) => {
            let Ok(layer) = ctx.store.layer_mut(session.layer_id) else {
                warn!("Baked layer {} no longer exists", session.layer_id);
                return CommitOutcome::Discarded;
            };
            layer.set_payload(Arc::new(baked));
            layer.preview = None;
            layer.model_matrix = Matrix::IDENTITY;
            ctx.history.record(ctx.store, session.description.as_str());
            info!("Transform session {} committed on layer {}", session.generation, session.layer_id);
            CommitOutcome::Committed {
                layer_id: session.layer_id,
                applied: matrix,
            }
        }
        Err(e) => {
            warn!("Transform could not be applied, reverting: {}", e);
            restore(ctx.store, &session);
            let e = match e {
                e @ TegakiError::BakeFailure(_) => e,
                other => TegakiError::BakeFailure(other.to_string()),
            };
            CommitOutcome::Failed(e)
        }
    }
}
