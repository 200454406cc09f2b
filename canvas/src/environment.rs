//! Interaction environments: which surface owns the pointer and which tool is armed.
//!
//! The canvas runs in exactly one of two environments at a time. `Practical`
//! is graph editing on the node surface; `Design` is freeform drawing on the
//! whiteboard surface layered above it. Each environment remembers its own
//! tool, so switching away and back restores what the user had armed.
//!
//! DESIGN
//! ======
//! `is_whiteboard_active` is derived from the current environment and is never
//! stored. Flag setters are pure flips with no side effects on environment or
//! tool. Invalid requests set `error` instead of transitioning; the error never
//! forces an environment change and is cleared only by `clear_error`.

#[cfg(test)]
#[path = "environment_test.rs"]
mod environment_test;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_STROKE_COLOR, DEFAULT_STROKE_WIDTH, MAX_STROKE_WIDTH};

/// The two mutually exclusive interaction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Graph editing on the node surface.
    #[default]
    Practical,
    /// Freeform drawing on the whiteboard surface.
    Design,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Practical => f.write_str("practical"),
            Self::Design => f.write_str("design"),
        }
    }
}

/// Tools available while editing the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PracticalTool {
    /// Pointer / selection tool (default).
    #[default]
    Select,
    /// Drag to pan without selecting.
    Hand,
    /// Place a metric node.
    Metric,
    /// Place a driver node.
    Driver,
    /// Draw a causal edge between two nodes.
    Connector,
    /// Lasso nodes into a group.
    Group,
    /// Place an annotation.
    Note,
}

/// Tools available on the whiteboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesignTool {
    /// Select and move strokes.
    #[default]
    Select,
    Hand,
    /// Freehand pen.
    Draw,
    Highlighter,
    Eraser,
    Arrow,
    Text,
}

impl FromStr for PracticalTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" => Ok(Self::Select),
            "hand" => Ok(Self::Hand),
            "metric" => Ok(Self::Metric),
            "driver" => Ok(Self::Driver),
            "connector" => Ok(Self::Connector),
            "group" => Ok(Self::Group),
            "note" => Ok(Self::Note),
            other => Err(format!("unknown practical tool: {other}")),
        }
    }
}

impl FromStr for DesignTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" => Ok(Self::Select),
            "hand" => Ok(Self::Hand),
            "draw" => Ok(Self::Draw),
            "highlighter" => Ok(Self::Highlighter),
            "eraser" => Ok(Self::Eraser),
            "arrow" => Ok(Self::Arrow),
            "text" => Ok(Self::Text),
            other => Err(format!("unknown design tool: {other}")),
        }
    }
}

/// The tool that currently receives pointer input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTool {
    Practical(PracticalTool),
    Design(DesignTool),
}

/// Another user and the environment they are working in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub id: String,
    pub environment: Environment,
}

/// Snapshot of the environment machine, as read by UI chrome.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentState {
    pub current_environment: Environment,
    pub practical_tool: PracticalTool,
    pub design_tool: DesignTool,
    /// Design-mode pointer events fall through to the graph below.
    pub is_passthrough_mode: bool,
    /// The armed tool stays armed after one use.
    pub keep_tool_active: bool,
    pub stroke_color: String,
    pub stroke_width: f64,
    pub collaborators: Vec<Collaborator>,
    pub error: Option<String>,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        Self {
            current_environment: Environment::Practical,
            practical_tool: PracticalTool::Select,
            design_tool: DesignTool::Draw,
            is_passthrough_mode: false,
            keep_tool_active: false,
            stroke_color: DEFAULT_STROKE_COLOR.to_owned(),
            stroke_width: DEFAULT_STROKE_WIDTH,
            collaborators: Vec::new(),
            error: None,
        }
    }
}

impl EnvironmentState {
    /// Derived: the whiteboard surface owns input exactly when in design mode.
    #[must_use]
    pub fn is_whiteboard_active(&self) -> bool {
        self.current_environment == Environment::Design
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

type ErrorListener = Box<dyn Fn(&str) + Send + Sync>;

/// Owner of [`EnvironmentState`]; every mutation goes through here.
#[derive(Default)]
pub struct EnvironmentMachine {
    state: EnvironmentState,
    on_error: Option<ErrorListener>,
}

impl fmt::Debug for EnvironmentMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentMachine")
            .field("state", &self.state)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl EnvironmentMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> &EnvironmentState {
        &self.state
    }

    #[must_use]
    pub fn current_environment(&self) -> Environment {
        self.state.current_environment
    }

    #[must_use]
    pub fn is_whiteboard_active(&self) -> bool {
        self.state.is_whiteboard_active()
    }

    /// The tool of the active environment.
    #[must_use]
    pub fn active_tool(&self) -> ActiveTool {
        match self.state.current_environment {
            Environment::Practical => ActiveTool::Practical(self.state.practical_tool),
            Environment::Design => ActiveTool::Design(self.state.design_tool),
        }
    }

    // --- Environment transitions ---

    pub fn switch_to_practical(&mut self) {
        self.state.current_environment = Environment::Practical;
    }

    pub fn switch_to_design(&mut self) {
        self.state.current_environment = Environment::Design;
    }

    // --- Tools ---

    /// Arm a graph tool. Takes effect whether or not practical mode is active.
    pub fn set_practical_tool(&mut self, tool: PracticalTool) {
        self.state.practical_tool = tool;
    }

    /// Arm a whiteboard tool. Takes effect whether or not design mode is active.
    pub fn set_design_tool(&mut self, tool: DesignTool) {
        self.state.design_tool = tool;
    }

    /// Arm a tool by its UI name for the named environment. Unknown names set
    /// the error flag and leave every tool unchanged.
    pub fn select_tool(&mut self, environment: Environment, name: &str) {
        match environment {
            Environment::Practical => match name.parse::<PracticalTool>() {
                Ok(tool) => self.set_practical_tool(tool),
                Err(message) => self.raise_error(message),
            },
            Environment::Design => match name.parse::<DesignTool>() {
                Ok(tool) => self.set_design_tool(tool),
                Err(message) => self.raise_error(message),
            },
        }
    }

    /// Report that the active tool completed one action. Unless
    /// `keep_tool_active` is set, the active environment falls back to select.
    pub fn tool_used(&mut self) {
        if self.state.keep_tool_active {
            return;
        }
        match self.state.current_environment {
            Environment::Practical => self.state.practical_tool = PracticalTool::Select,
            Environment::Design => self.state.design_tool = DesignTool::Select,
        }
    }

    // --- Flags ---

    pub fn enable_passthrough(&mut self) {
        self.state.is_passthrough_mode = true;
    }

    pub fn disable_passthrough(&mut self) {
        self.state.is_passthrough_mode = false;
    }

    pub fn toggle_keep_tool_active(&mut self) {
        self.state.keep_tool_active = !self.state.keep_tool_active;
    }

    // --- Stroke style ---

    /// Set the design stroke color. Blank colors are rejected.
    pub fn set_stroke_color(&mut self, color: impl Into<String>) {
        let color = color.into();
        if color.trim().is_empty() {
            self.raise_error("stroke color must not be empty");
            return;
        }
        self.state.stroke_color = color;
    }

    /// Set the design stroke width. Widths outside `(0, MAX_STROKE_WIDTH]` are rejected.
    pub fn set_stroke_width(&mut self, width: f64) {
        if !width.is_finite() || width <= 0.0 || width > MAX_STROKE_WIDTH {
            self.raise_error(format!("stroke width out of range: {width}"));
            return;
        }
        self.state.stroke_width = width;
    }

    // --- Collaborators ---

    pub fn upsert_collaborator(&mut self, id: impl Into<String>, environment: Environment) {
        let id = id.into();
        if let Some(existing) = self.state.collaborators.iter_mut().find(|c| c.id == id) {
            existing.environment = environment;
        } else {
            self.state.collaborators.push(Collaborator { id, environment });
        }
    }

    pub fn remove_collaborator(&mut self, id: &str) {
        self.state.collaborators.retain(|c| c.id != id);
    }

    /// Collaborators currently working in `environment`.
    #[must_use]
    pub fn collaborators_in(&self, environment: Environment) -> Vec<&Collaborator> {
        self.state
            .collaborators
            .iter()
            .filter(|c| c.environment == environment)
            .collect()
    }

    // --- Error flag ---

    /// Register the callback fired whenever `has_error` turns true.
    pub fn on_error(&mut self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.on_error = Some(Box::new(listener));
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.state.error.as_deref()
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.state.has_error()
    }

    pub fn clear_error(&mut self) {
        self.state.error = None;
    }

    /// Record an error. Listeners hear about it only on the transition from
    /// no error to error; a second error replaces the message silently.
    pub fn raise_error(&mut self, message: impl Into<String>) {
        let had_error = self.state.has_error();
        let message = message.into();
        if !had_error {
            if let Some(listener) = &self.on_error {
                listener(&message);
            }
        }
        self.state.error = Some(message);
    }
}
