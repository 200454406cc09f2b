#![allow(clippy::float_cmp)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;

fn counting_machine() -> (EnvironmentMachine, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut machine = EnvironmentMachine::new();
    let counter = Arc::clone(&hits);
    machine.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (machine, hits)
}

// =============================================================
// Defaults
// =============================================================

#[test]
fn starts_in_practical_with_select() {
    let machine = EnvironmentMachine::new();
    assert_eq!(machine.current_environment(), Environment::Practical);
    assert!(!machine.is_whiteboard_active());
    assert_eq!(machine.active_tool(), ActiveTool::Practical(PracticalTool::Select));
    assert_eq!(machine.state().design_tool, DesignTool::Draw);
    assert!(!machine.has_error());
}

// =============================================================
// Environment transitions
// =============================================================

#[test]
fn switch_to_design_activates_whiteboard() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    assert_eq!(machine.current_environment(), Environment::Design);
    assert!(machine.is_whiteboard_active());
    assert!(machine.state().is_whiteboard_active());
}

#[test]
fn switch_back_to_practical_deactivates_whiteboard() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    machine.switch_to_practical();
    assert!(!machine.is_whiteboard_active());
}

// =============================================================
// Tools
// =============================================================

#[test]
fn practical_tool_set_in_design_mode_leaves_design_untouched() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    machine.set_design_tool(DesignTool::Highlighter);

    machine.set_practical_tool(PracticalTool::Select);

    assert_eq!(machine.current_environment(), Environment::Design);
    assert_eq!(machine.state().design_tool, DesignTool::Highlighter);
    assert_eq!(machine.active_tool(), ActiveTool::Design(DesignTool::Highlighter));
}

#[test]
fn switching_back_restores_last_used_tool() {
    let mut machine = EnvironmentMachine::new();
    machine.set_practical_tool(PracticalTool::Connector);
    machine.switch_to_design();
    machine.set_design_tool(DesignTool::Eraser);
    machine.switch_to_practical();
    assert_eq!(machine.active_tool(), ActiveTool::Practical(PracticalTool::Connector));
    machine.switch_to_design();
    assert_eq!(machine.active_tool(), ActiveTool::Design(DesignTool::Eraser));
}

#[test]
fn select_tool_by_name() {
    let mut machine = EnvironmentMachine::new();
    machine.select_tool(Environment::Design, "arrow");
    assert_eq!(machine.state().design_tool, DesignTool::Arrow);
    assert!(!machine.has_error());
}

#[test]
fn unknown_tool_name_raises_error_without_transition() {
    let (mut machine, hits) = counting_machine();
    machine.set_practical_tool(PracticalTool::Metric);

    machine.select_tool(Environment::Practical, "laser");

    assert_eq!(machine.error(), Some("unknown practical tool: laser"));
    assert_eq!(machine.state().practical_tool, PracticalTool::Metric);
    assert_eq!(machine.current_environment(), Environment::Practical);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn tool_used_resets_to_select_unless_kept() {
    let mut machine = EnvironmentMachine::new();
    machine.set_practical_tool(PracticalTool::Driver);
    machine.tool_used();
    assert_eq!(machine.state().practical_tool, PracticalTool::Select);

    machine.toggle_keep_tool_active();
    machine.set_practical_tool(PracticalTool::Driver);
    machine.tool_used();
    assert_eq!(machine.state().practical_tool, PracticalTool::Driver);
}

// =============================================================
// Flags
// =============================================================

#[test]
fn passthrough_flips_without_side_effects() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    machine.enable_passthrough();
    assert!(machine.state().is_passthrough_mode);
    assert_eq!(machine.current_environment(), Environment::Design);
    machine.disable_passthrough();
    assert!(!machine.state().is_passthrough_mode);
}

#[test]
fn keep_tool_active_toggles() {
    let mut machine = EnvironmentMachine::new();
    machine.toggle_keep_tool_active();
    assert!(machine.state().keep_tool_active);
    machine.toggle_keep_tool_active();
    assert!(!machine.state().keep_tool_active);
}

// =============================================================
// Stroke style
// =============================================================

#[test]
fn stroke_style_survives_environment_switches() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    machine.set_stroke_color("#FF0000");
    machine.set_stroke_width(6.0);
    machine.switch_to_practical();
    machine.switch_to_design();
    assert_eq!(machine.state().stroke_color, "#FF0000");
    assert_eq!(machine.state().stroke_width, 6.0);
}

#[test]
fn invalid_stroke_width_is_rejected() {
    let (mut machine, hits) = counting_machine();
    machine.set_stroke_width(-1.0);
    machine.set_stroke_width(f64::NAN);
    assert_eq!(machine.state().stroke_width, DEFAULT_STROKE_WIDTH);
    assert!(machine.has_error());
    // Only the first error is a transition into the error state.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn blank_stroke_color_is_rejected() {
    let mut machine = EnvironmentMachine::new();
    machine.set_stroke_color("  ");
    assert_eq!(machine.state().stroke_color, DEFAULT_STROKE_COLOR);
    assert!(machine.has_error());
}

// =============================================================
// Error flag
// =============================================================

#[test]
fn clear_error_rearms_notification() {
    let (mut machine, hits) = counting_machine();
    machine.raise_error("first");
    machine.clear_error();
    assert!(!machine.has_error());
    machine.raise_error("second");
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(machine.error(), Some("second"));
}

#[test]
fn error_does_not_force_transition() {
    let mut machine = EnvironmentMachine::new();
    machine.switch_to_design();
    machine.raise_error("boom");
    assert_eq!(machine.current_environment(), Environment::Design);
}

// =============================================================
// Collaborators
// =============================================================

#[test]
fn collaborators_upsert_and_remove() {
    let mut machine = EnvironmentMachine::new();
    machine.upsert_collaborator("u1", Environment::Practical);
    machine.upsert_collaborator("u2", Environment::Design);
    machine.upsert_collaborator("u1", Environment::Design);

    assert_eq!(machine.state().collaborators.len(), 2);
    assert_eq!(machine.collaborators_in(Environment::Design).len(), 2);

    machine.remove_collaborator("u2");
    let ids: Vec<_> = machine.state().collaborators.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["u1"]);
}
