//! Board object model: the unit of shared state on a canvas.
//!
//! Objects form a forest via `parent_id` (frame/group containment) and
//! carry a large set of optional visual fields. Mutations travel as
//! [`ObjectPatch`] values — an all-optional member struct so any subset
//! of known fields can be written in one descriptor. Clearable fields
//! use a double `Option`: the outer level means "this patch touches the
//! field", the inner level is the new value (`None` clears it).
//!
//! Soft-deleted objects carry a `deleted_at` tombstone; any subsequent
//! field write resurrects them (add-wins).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{wall_clock_ms, FIELD_DELETED};

/// Canonical field names, shared by patches, field clocks, and the
/// durable store's merge procedure.
pub mod fields {
    pub const X: &str = "x";
    pub const Y: &str = "y";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
    pub const ROTATION: &str = "rotation";
    pub const FILL: &str = "fill";
    pub const STROKE: &str = "stroke";
    pub const STROKE_WIDTH: &str = "stroke_width";
    pub const TEXT: &str = "text";
    pub const FONT_SIZE: &str = "font_size";
    pub const Z_INDEX: &str = "z_index";
    pub const PARENT_ID: &str = "parent_id";
    pub const X2: &str = "x2";
    pub const Y2: &str = "y2";
    pub const WAYPOINTS: &str = "waypoints";
    pub const TABLE_DATA: &str = "table_data";
    pub const LOCKED_BY: &str = "locked_by";
}

/// Type tag for a board object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Rect,
    Ellipse,
    Line,
    Text,
    Sticky,
    Image,
    Connector,
    Frame,
    Group,
    Table,
}

impl ObjectKind {
    /// Containers may hold child objects.
    pub fn is_container(&self) -> bool {
        matches!(self, ObjectKind::Frame | ObjectKind::Group)
    }
}

/// A shared, uniquely-identified graphical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardObject {
    pub id: Uuid,
    pub board_id: Uuid,
    pub kind: ObjectKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub text: Option<String>,
    pub font_size: Option<f64>,
    pub z_index: i64,
    /// Containment: the frame or group this object belongs to.
    pub parent_id: Option<Uuid>,
    /// Second endpoint, for lines and connectors.
    pub x2: Option<f64>,
    pub y2: Option<f64>,
    /// Route waypoints as a JSON-serialized coordinate list `[[x,y],…]`.
    pub waypoints: Option<String>,
    /// Table payload in its JSON wire representation.
    pub table_data: Option<String>,
    /// Exclusive cooperative edit lock holder.
    pub locked_by: Option<Uuid>,
    /// Soft-delete tombstone (ms since epoch).
    pub deleted_at: Option<u64>,
    pub created_by: Uuid,
    pub updated_at: u64,
}

impl BoardObject {
    /// Build an object with type-specific defaults at (x, y).
    pub fn new(kind: ObjectKind, board_id: Uuid, x: f64, y: f64, created_by: Uuid) -> Self {
        let (width, height) = match kind {
            ObjectKind::Rect => (120.0, 80.0),
            ObjectKind::Ellipse => (100.0, 100.0),
            ObjectKind::Line | ObjectKind::Connector => (0.0, 0.0),
            ObjectKind::Text => (160.0, 24.0),
            ObjectKind::Sticky => (160.0, 160.0),
            ObjectKind::Image => (200.0, 150.0),
            ObjectKind::Frame => (400.0, 300.0),
            ObjectKind::Group => (0.0, 0.0),
            ObjectKind::Table => (240.0, 160.0),
        };
        let fill = match kind {
            ObjectKind::Rect => Some("#ffd166".to_string()),
            ObjectKind::Ellipse => Some("#8ecae6".to_string()),
            ObjectKind::Sticky => Some("#fff9b1".to_string()),
            ObjectKind::Frame => Some("#f5f5f5".to_string()),
            _ => None,
        };
        let (x2, y2) = match kind {
            ObjectKind::Line | ObjectKind::Connector => (Some(x + 120.0), Some(y)),
            _ => (None, None),
        };
        let font_size = match kind {
            ObjectKind::Text | ObjectKind::Sticky => Some(14.0),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            board_id,
            kind,
            x,
            y,
            width,
            height,
            rotation: 0.0,
            fill,
            stroke: None,
            stroke_width: None,
            text: None,
            font_size,
            z_index: 0,
            parent_id: None,
            x2,
            y2,
            waypoints: None,
            table_data: None,
            locked_by: None,
            deleted_at: None,
            created_by,
            updated_at: wall_clock_ms(),
        }
    }

    /// Names of every field the object currently populates.
    ///
    /// Used by create stamping: every populated field gets a clock.
    pub fn populated_fields(&self) -> Vec<&'static str> {
        let mut names = vec![
            fields::X,
            fields::Y,
            fields::WIDTH,
            fields::HEIGHT,
            fields::ROTATION,
            fields::Z_INDEX,
        ];
        if self.fill.is_some() {
            names.push(fields::FILL);
        }
        if self.stroke.is_some() {
            names.push(fields::STROKE);
        }
        if self.stroke_width.is_some() {
            names.push(fields::STROKE_WIDTH);
        }
        if self.text.is_some() {
            names.push(fields::TEXT);
        }
        if self.font_size.is_some() {
            names.push(fields::FONT_SIZE);
        }
        if self.parent_id.is_some() {
            names.push(fields::PARENT_ID);
        }
        if self.x2.is_some() {
            names.push(fields::X2);
        }
        if self.y2.is_some() {
            names.push(fields::Y2);
        }
        if self.waypoints.is_some() {
            names.push(fields::WAYPOINTS);
        }
        if self.table_data.is_some() {
            names.push(fields::TABLE_DATA);
        }
        if self.locked_by.is_some() {
            names.push(fields::LOCKED_BY);
        }
        names
    }

    /// Parse the table payload, treating malformed data as absent.
    pub fn table_value(&self) -> Option<serde_json::Value> {
        self.table_data
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// A partial mutation of a board object.
///
/// Outer `Option` means "touched by this patch"; for clearable fields
/// the inner `Option` is the new value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub rotation: Option<f64>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub text: Option<Option<String>>,
    pub font_size: Option<f64>,
    pub z_index: Option<i64>,
    pub parent_id: Option<Option<Uuid>>,
    pub x2: Option<f64>,
    pub y2: Option<f64>,
    pub waypoints: Option<Option<String>>,
    pub table_data: Option<Option<String>>,
    pub locked_by: Option<Option<Uuid>>,
    pub deleted_at: Option<Option<u64>>,
}

impl ObjectPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common position patch.
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.field_names().is_empty()
    }

    /// Names of the fields this patch touches. Deletion maps to the
    /// synthetic tombstone field so it shares the clock namespace.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.x.is_some() {
            names.push(fields::X);
        }
        if self.y.is_some() {
            names.push(fields::Y);
        }
        if self.width.is_some() {
            names.push(fields::WIDTH);
        }
        if self.height.is_some() {
            names.push(fields::HEIGHT);
        }
        if self.rotation.is_some() {
            names.push(fields::ROTATION);
        }
        if self.fill.is_some() {
            names.push(fields::FILL);
        }
        if self.stroke.is_some() {
            names.push(fields::STROKE);
        }
        if self.stroke_width.is_some() {
            names.push(fields::STROKE_WIDTH);
        }
        if self.text.is_some() {
            names.push(fields::TEXT);
        }
        if self.font_size.is_some() {
            names.push(fields::FONT_SIZE);
        }
        if self.z_index.is_some() {
            names.push(fields::Z_INDEX);
        }
        if self.parent_id.is_some() {
            names.push(fields::PARENT_ID);
        }
        if self.x2.is_some() {
            names.push(fields::X2);
        }
        if self.y2.is_some() {
            names.push(fields::Y2);
        }
        if self.waypoints.is_some() {
            names.push(fields::WAYPOINTS);
        }
        if self.table_data.is_some() {
            names.push(fields::TABLE_DATA);
        }
        if self.locked_by.is_some() {
            names.push(fields::LOCKED_BY);
        }
        if self.deleted_at.is_some() {
            names.push(FIELD_DELETED);
        }
        names
    }

    /// True when the only field touched is `locked_by` — the lock
    /// escape hatch: a lock can always be set or released even on an
    /// otherwise locked object.
    pub fn is_lock_only(&self) -> bool {
        self.locked_by.is_some() && self.field_names().len() == 1
    }

    /// Overlay `later` onto `self`: every field the later patch touches
    /// replaces ours.
    pub fn merge(&mut self, later: &ObjectPatch) {
        macro_rules! take {
            ($field:ident) => {
                if later.$field.is_some() {
                    self.$field = later.$field.clone();
                }
            };
        }
        take!(x);
        take!(y);
        take!(width);
        take!(height);
        take!(rotation);
        take!(fill);
        take!(stroke);
        take!(stroke_width);
        take!(text);
        take!(font_size);
        take!(z_index);
        take!(parent_id);
        take!(x2);
        take!(y2);
        take!(waypoints);
        take!(table_data);
        take!(locked_by);
        take!(deleted_at);
    }

    /// Keep only the named fields, dropping the rest.
    pub fn project(&self, names: &[&str]) -> ObjectPatch {
        let mut out = ObjectPatch::new();
        for name in names {
            match *name {
                fields::X => out.x = self.x,
                fields::Y => out.y = self.y,
                fields::WIDTH => out.width = self.width,
                fields::HEIGHT => out.height = self.height,
                fields::ROTATION => out.rotation = self.rotation,
                fields::FILL => out.fill = self.fill.clone(),
                fields::STROKE => out.stroke = self.stroke.clone(),
                fields::STROKE_WIDTH => out.stroke_width = self.stroke_width,
                fields::TEXT => out.text = self.text.clone(),
                fields::FONT_SIZE => out.font_size = self.font_size,
                fields::Z_INDEX => out.z_index = self.z_index,
                fields::PARENT_ID => out.parent_id = self.parent_id,
                fields::X2 => out.x2 = self.x2,
                fields::Y2 => out.y2 = self.y2,
                fields::WAYPOINTS => out.waypoints = self.waypoints.clone(),
                fields::TABLE_DATA => out.table_data = self.table_data.clone(),
                fields::LOCKED_BY => out.locked_by = self.locked_by,
                FIELD_DELETED => out.deleted_at = self.deleted_at,
                _ => {}
            }
        }
        out
    }

    /// Project the named fields out of an object's current values
    /// (reconciliation push path).
    pub fn from_object(object: &BoardObject, names: &[&str]) -> ObjectPatch {
        let mut out = ObjectPatch::new();
        for name in names {
            match *name {
                fields::X => out.x = Some(object.x),
                fields::Y => out.y = Some(object.y),
                fields::WIDTH => out.width = Some(object.width),
                fields::HEIGHT => out.height = Some(object.height),
                fields::ROTATION => out.rotation = Some(object.rotation),
                fields::FILL => out.fill = object.fill.clone(),
                fields::STROKE => out.stroke = object.stroke.clone(),
                fields::STROKE_WIDTH => out.stroke_width = object.stroke_width,
                fields::TEXT => out.text = Some(object.text.clone()),
                fields::FONT_SIZE => out.font_size = object.font_size,
                fields::Z_INDEX => out.z_index = Some(object.z_index),
                fields::PARENT_ID => out.parent_id = Some(object.parent_id),
                fields::X2 => out.x2 = object.x2,
                fields::Y2 => out.y2 = object.y2,
                fields::WAYPOINTS => out.waypoints = Some(object.waypoints.clone()),
                fields::TABLE_DATA => out.table_data = Some(object.table_data.clone()),
                fields::LOCKED_BY => out.locked_by = Some(object.locked_by),
                FIELD_DELETED => out.deleted_at = Some(object.deleted_at),
                _ => {}
            }
        }
        out
    }

    /// All visual fields of an object, for duplication.
    pub fn visual_copy(object: &BoardObject) -> ObjectPatch {
        ObjectPatch {
            width: Some(object.width),
            height: Some(object.height),
            rotation: Some(object.rotation),
            fill: object.fill.clone(),
            stroke: object.stroke.clone(),
            stroke_width: object.stroke_width,
            text: object.text.clone().map(Some),
            font_size: object.font_size,
            z_index: Some(object.z_index),
            x2: object.x2,
            y2: object.y2,
            waypoints: object.waypoints.clone().map(Some),
            table_data: object.table_data.clone().map(Some),
            ..ObjectPatch::default()
        }
    }

    /// Apply the patch to an object.
    ///
    /// Any write other than a pure tombstone write clears an existing
    /// tombstone (add-wins resurrection).
    pub fn apply_to(&self, object: &mut BoardObject) {
        let touches_live_field = self
            .field_names()
            .iter()
            .any(|name| *name != FIELD_DELETED);
        if touches_live_field && object.deleted_at.is_some() {
            object.deleted_at = None;
        }

        if let Some(v) = self.x {
            object.x = v;
        }
        if let Some(v) = self.y {
            object.y = v;
        }
        if let Some(v) = self.width {
            object.width = v;
        }
        if let Some(v) = self.height {
            object.height = v;
        }
        if let Some(v) = self.rotation {
            object.rotation = v;
        }
        if let Some(v) = &self.fill {
            object.fill = Some(v.clone());
        }
        if let Some(v) = &self.stroke {
            object.stroke = Some(v.clone());
        }
        if let Some(v) = self.stroke_width {
            object.stroke_width = Some(v);
        }
        if let Some(v) = &self.text {
            object.text = v.clone();
        }
        if let Some(v) = self.font_size {
            object.font_size = Some(v);
        }
        if let Some(v) = self.z_index {
            object.z_index = v;
        }
        if let Some(v) = self.parent_id {
            object.parent_id = v;
        }
        if let Some(v) = self.x2 {
            object.x2 = Some(v);
        }
        if let Some(v) = self.y2 {
            object.y2 = Some(v);
        }
        if let Some(v) = &self.waypoints {
            object.waypoints = v.clone();
        }
        if let Some(v) = &self.table_data {
            object.table_data = v.clone();
        }
        if let Some(v) = self.locked_by {
            object.locked_by = v;
        }
        if let Some(v) = self.deleted_at {
            object.deleted_at = v;
        }
        object.updated_at = wall_clock_ms();
    }
}

/// Parse a waypoint list from its JSON wire representation.
///
/// Malformed input yields `None` — one corrupt field never blocks an
/// otherwise-valid mutation.
pub fn parse_waypoints(raw: &str) -> Option<Vec<(f64, f64)>> {
    serde_json::from_str::<Vec<(f64, f64)>>(raw).ok()
}

/// Translate a serialized waypoint list by (dx, dy).
///
/// Unparseable input is discarded entirely: the caller stores `None`
/// rather than a stale coordinate string.
pub fn translate_waypoints(raw: &str, dx: f64, dy: f64) -> Option<String> {
    let points = parse_waypoints(raw)?;
    let moved: Vec<(f64, f64)> = points.into_iter().map(|(x, y)| (x + dx, y + dy)).collect();
    serde_json::to_string(&moved).ok()
}
