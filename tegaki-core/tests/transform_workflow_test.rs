//! End-to-end workflows: drawing through a layer transform, moving a layer
//! and committing, no-op clicks, background protection and loading damaged
//! documents.

use image::{Rgba, RgbaImage};
use kurbo::{Point, Rect, Vec2};
use std::collections::HashMap;
use tegaki_core::bridge::CpuRenderBridge;
use tegaki_core::config::{EditorConfig, ResamplePolicy};
use tegaki_core::editor::{Editor, PointerInput};
use tegaki_core::layer::{BlendMode, LayerId};
use tegaki_core::payload::{Payload, PayloadKind};
use tegaki_core::persist::{DocumentRecord, LayerRecord};
use tegaki_core::session::CommitOutcome;
use tegaki_core::TegakiError;

const WIDTH: u32 = 344;
const HEIGHT: u32 = 135;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pen(x: f64, y: f64) -> PointerInput {
    PointerInput {
        pressure: 1.0,
        ..PointerInput::at(x, y)
    }
}

fn layer_record(id: u64, name: &str, matrix: Vec<f64>, is_background: bool) -> LayerRecord {
    LayerRecord {
        id,
        name: name.to_string(),
        visible: true,
        opacity: 1.0,
        blend_mode: BlendMode::Normal,
        payload_ref: format!("p{id}"),
        model_matrix: matrix,
        is_background,
    }
}

fn identity() -> Vec<f64> {
    vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
}

/// Background plus one empty layer with the given persisted matrix
fn setup_editor(layer_matrix: Vec<f64>) -> (Editor<CpuRenderBridge>, LayerId) {
    init_logging();
    let mut editor = Editor::with_document(
        WIDTH,
        HEIGHT,
        PayloadKind::Raster,
        CpuRenderBridge::new(ResamplePolicy::Bilinear),
        EditorConfig::default(),
    );

    let record = DocumentRecord {
        width: WIDTH,
        height: HEIGHT,
        kind: PayloadKind::Raster,
        active_index: 1,
        layers: vec![
            layer_record(1, "Background", identity(), true),
            layer_record(2, "Ink", layer_matrix, false),
        ],
    };
    let mut payloads = HashMap::new();
    payloads.insert(
        "p1".to_string(),
        Payload::Raster(RgbaImage::from_pixel(WIDTH, HEIGHT, Rgba([255, 255, 255, 255]))),
    );
    payloads.insert("p2".to_string(), Payload::blank(PayloadKind::Raster, WIDTH, HEIGHT));

    let diagnostics = editor.load_document(&record, &payloads);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    (editor, LayerId(2))
}

fn ink_alpha(editor: &Editor<CpuRenderBridge>, id: LayerId, x: u32, y: u32) -> u8 {
    match editor.store().get(id).unwrap().payload() {
        Payload::Raster(img) => img.get_pixel(x, y)[3],
        Payload::Paths(_) => panic!("expected raster payload"),
    }
}

#[test]
fn test_identity_layer_resolves_canvas_point() {
    let (editor, id) = setup_editor(identity());
    let pointer = editor.resolve(Point::new(10.0, 10.0)).unwrap();
    let layer = editor.store().get(id).unwrap();
    let local = editor.pipeline().to_layer_local(pointer.world, &layer.model_matrix()).unwrap();
    assert_eq!(local, Point::new(10.0, 10.0));
}

#[test]
fn test_drawing_on_translated_layer() {
    let (mut editor, id) = setup_editor(vec![1.0, 0.0, 50.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    let pointer = editor.resolve(Point::new(60.0, 10.0)).unwrap();
    let model = editor.store().get(id).unwrap().model_matrix();
    let local = editor.pipeline().to_layer_local(pointer.world, &model).unwrap();
    assert_eq!(local, Point::new(10.0, 10.0));

    editor.pointer_down(pen(60.0, 10.0)).unwrap();
    editor.pointer_up(pen(60.0, 10.0)).unwrap();
    assert_eq!(ink_alpha(&editor, id, 10, 10), 255);
    assert_eq!(ink_alpha(&editor, id, 60, 10), 0);

    // Composited, the dot shows up under the pointer
    let mut frame = RgbaImage::new(WIDTH, HEIGHT);
    editor.composite(&mut frame, Rect::new(0.0, 0.0, WIDTH as f64, HEIGHT as f64)).unwrap();
    assert_eq!(*frame.get_pixel(60, 10), Rgba([0, 0, 0, 255]));
    assert_eq!(*frame.get_pixel(10, 10), Rgba([255, 255, 255, 255]));
}

#[test]
fn test_move_drag_commits_rounded_translation() {
    let (mut editor, id) = setup_editor(vec![1.0, 0.0, 50.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
    editor.pointer_down(pen(60.0, 10.0)).unwrap();
    editor.pointer_up(pen(60.0, 10.0)).unwrap();
    let entries = editor.history().len();

    editor.pointer_down(pen(60.0, 10.0).with_modifier()).unwrap();
    editor.pointer_move(pen(65.0, 15.0).with_modifier()).unwrap();
    let outcome = editor.pointer_up(pen(65.0, 15.0).with_modifier()).unwrap();

    let Some(CommitOutcome::Committed { layer_id, applied }) = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(layer_id, id);
    assert_eq!(applied.translation(), Vec2::new(55.0, 5.0));
    assert_eq!(editor.history().len(), entries + 1);

    let layer = editor.store().get(id).unwrap();
    assert!(layer.model_matrix().is_identity());
    assert!(!layer.is_previewing());
    // The dot drawn at local (10, 10) now lives at (65, 15) in the payload
    assert_eq!(ink_alpha(&editor, id, 65, 15), 255);
    assert_eq!(ink_alpha(&editor, id, 10, 10), 0);
}

#[test]
fn test_fractional_drag_is_rounded_before_bake() {
    let (mut editor, id) = setup_editor(identity());
    editor.pointer_down(pen(20.0, 20.0).with_modifier()).unwrap();
    editor.pointer_move(pen(22.6, 21.4).with_modifier()).unwrap();
    let outcome = editor.pointer_up(pen(22.6, 21.4).with_modifier()).unwrap();
    let Some(CommitOutcome::Committed { applied, .. }) = outcome else {
        panic!("expected a commit, got {outcome:?}");
    };
    assert_eq!(applied.translation(), Vec2::new(3.0, 1.0));
    assert!(editor.store().get(id).unwrap().model_matrix().is_identity());
}

#[test]
fn test_zero_movement_is_a_no_op() {
    let (mut editor, id) = setup_editor(identity());
    editor.pointer_down(pen(30.0, 30.0)).unwrap();
    editor.pointer_up(pen(30.0, 30.0)).unwrap();
    let before = editor.store().get(id).unwrap().clone();
    let entries = editor.history().len();

    editor.pointer_down(pen(30.0, 30.0).with_modifier()).unwrap();
    let outcome = editor.pointer_up(pen(30.0, 30.0).with_modifier()).unwrap();

    assert_eq!(outcome, Some(CommitOutcome::NoChange));
    assert_eq!(editor.history().len(), entries);
    assert_eq!(editor.store().get(id).unwrap(), &before);
}

#[test]
fn test_background_cannot_be_deleted() {
    let (mut editor, _) = setup_editor(identity());
    let background = editor.store().background_id();
    let count = editor.store().len();
    assert!(matches!(editor.delete_layer(background), Err(TegakiError::InvalidTarget(_))));
    assert_eq!(editor.store().len(), count);
    assert!(editor.store().check_invariants());
}

#[test]
fn test_short_matrix_loads_as_identity() {
    init_logging();
    let mut editor = Editor::with_document(
        WIDTH,
        HEIGHT,
        PayloadKind::Raster,
        CpuRenderBridge::default(),
        EditorConfig::default(),
    );
    let record = DocumentRecord {
        width: WIDTH,
        height: HEIGHT,
        kind: PayloadKind::Raster,
        active_index: 2,
        layers: vec![
            layer_record(1, "Background", identity(), true),
            layer_record(2, "Broken", vec![1.0, 0.0, 0.0, 1.0, 7.0], false),
            layer_record(3, "Fine", vec![1.0, 0.0, 4.0, 0.0, 1.0, 9.0, 0.0, 0.0, 1.0], false),
        ],
    };
    let mut payloads = HashMap::new();
    for key in ["p1", "p2", "p3"] {
        payloads.insert(key.to_string(), Payload::blank(PayloadKind::Raster, WIDTH, HEIGHT));
    }

    let diagnostics = editor.load_document(&record, &payloads);
    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(diagnostics[0], TegakiError::MalformedPersistedState(_)));

    let store = editor.store();
    assert_eq!(store.len(), 3);
    assert!(store.get(LayerId(2)).unwrap().model_matrix().is_identity());
    assert_eq!(store.get(LayerId(3)).unwrap().model_matrix().translation(), Vec2::new(4.0, 9.0));
    assert_eq!(store.active_id(), Some(LayerId(3)));
}

#[test]
fn test_toggle_session_across_several_drags() {
    let (mut editor, id) = setup_editor(identity());
    editor.pointer_down(pen(30.0, 30.0)).unwrap();
    editor.pointer_up(pen(30.0, 30.0)).unwrap();
    let entries = editor.history().len();

    editor.enter_transform_mode(id).unwrap();
    editor.pointer_down(pen(0.0, 0.0)).unwrap();
    editor.pointer_move(pen(10.0, 0.0)).unwrap();
    editor.pointer_up(pen(10.0, 0.0)).unwrap();
    editor.pointer_down(pen(100.0, 100.0)).unwrap();
    editor.pointer_move(pen(100.0, 5.0 + 100.0)).unwrap();
    editor.pointer_up(pen(100.0, 105.0)).unwrap();
    editor.nudge_steps(1, 0).unwrap();
    assert_eq!(editor.history().len(), entries);

    let outcome = editor.exit_transform_mode(true).unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed { applied, .. } if applied.translation() == Vec2::new(11.0, 5.0)));
    assert_eq!(editor.history().len(), entries + 1);
    assert_eq!(ink_alpha(&editor, id, 41, 35), 255);
}

#[test]
fn test_deferred_bake_and_late_result() {
    let (mut editor, id) = setup_editor(identity());
    editor.bridge_mut().set_defer_bakes(true);

    editor.pointer_down(pen(10.0, 10.0).with_modifier()).unwrap();
    editor.pointer_move(pen(20.0, 10.0).with_modifier()).unwrap();
    let outcome = editor.pointer_up(pen(20.0, 10.0).with_modifier()).unwrap();
    assert!(matches!(outcome, Some(CommitOutcome::Deferred(_))));

    // Escape while the bake is in flight
    editor.exit_transform_mode(false).unwrap();
    let layer = editor.store().get(id).unwrap();
    assert!(layer.model_matrix().is_identity());
    assert!(!layer.is_previewing());

    for (token, result) in editor.bridge_mut().complete_pending() {
        assert_eq!(editor.resolve_bake(token, result), CommitOutcome::Discarded);
    }
    assert_eq!(editor.history().len(), 1);
}

#[test]
fn test_unavailable_bridge_reverts_commit() {
    let (mut editor, id) = setup_editor(vec![1.0, 0.0, 3.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0]);
    let before = editor.store().get(id).unwrap().clone();
    editor.bridge_mut().set_available(false);

    editor.pointer_down(pen(10.0, 10.0).with_modifier()).unwrap();
    editor.pointer_move(pen(20.0, 10.0).with_modifier()).unwrap();
    let outcome = editor.pointer_up(pen(20.0, 10.0).with_modifier()).unwrap();

    assert!(matches!(outcome, Some(CommitOutcome::Failed(TegakiError::BakeFailure(_)))));
    assert_eq!(editor.store().get(id).unwrap(), &before);
    assert_eq!(editor.history().len(), 1);
}
