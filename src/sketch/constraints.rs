use crate::id::EntityId;
use serde::{Deserialize, Serialize};

/// Priority tier of a constraint kind. Tiers are fixed per kind and not
/// user-configurable: a backend claiming priority enforcement must never
/// sacrifice a Critical constraint for a lower one when a feasible
/// alternative exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 4] = [
        PriorityTier::Critical,
        PriorityTier::High,
        PriorityTier::Medium,
        PriorityTier::Low,
    ];
}

/// The closed constraint catalog. Dispatch is a total match everywhere so a
/// new kind cannot be silently unhandled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    // --- Critical (topological) ---
    /// Pin a point to an exact position.
    Fixed { point: EntityId, position: [f64; 2] },
    /// Two points occupy the same position.
    Coincident { points: [EntityId; 2] },
    /// Point lies on the infinite line through a Line entity.
    PointOnLine { point: EntityId, line: EntityId },
    /// Point lies on the perimeter of a circle or arc.
    PointOnCircle { point: EntityId, circle: EntityId },
    /// Point is the midpoint of a line segment.
    Midpoint { point: EntityId, line: EntityId },
    /// Two lines lie on the same infinite line.
    Collinear { lines: [EntityId; 2] },
    /// Two circles/arcs share a center.
    Concentric { entities: [EntityId; 2] },

    // --- High (relational) ---
    Parallel { lines: [EntityId; 2] },
    Perpendicular { lines: [EntityId; 2] },
    /// Line tangent to a circle or arc.
    Tangent { line: EntityId, circle: EntityId },
    EqualLength { lines: [EntityId; 2] },
    EqualRadius { entities: [EntityId; 2] },
    /// `points[1]` is the reflection of `points[0]` across the axis line.
    Symmetric { points: [EntityId; 2], axis: EntityId },

    // --- Medium (orientation) ---
    Horizontal { line: EntityId },
    Vertical { line: EntityId },

    // --- Low (dimensional) ---
    Distance { points: [EntityId; 2], value: f64 },
    Length { line: EntityId, value: f64 },
    /// Signed angle from the first line's direction to the second's, radians.
    Angle { lines: [EntityId; 2], value: f64 },
    Radius { entity: EntityId, value: f64 },
    Diameter { entity: EntityId, value: f64 },
}

impl Constraint {
    pub fn tier(&self) -> PriorityTier {
        match self {
            Constraint::Fixed { .. }
            | Constraint::Coincident { .. }
            | Constraint::PointOnLine { .. }
            | Constraint::PointOnCircle { .. }
            | Constraint::Midpoint { .. }
            | Constraint::Collinear { .. }
            | Constraint::Concentric { .. } => PriorityTier::Critical,

            Constraint::Parallel { .. }
            | Constraint::Perpendicular { .. }
            | Constraint::Tangent { .. }
            | Constraint::EqualLength { .. }
            | Constraint::EqualRadius { .. }
            | Constraint::Symmetric { .. } => PriorityTier::High,

            Constraint::Horizontal { .. } | Constraint::Vertical { .. } => PriorityTier::Medium,

            Constraint::Distance { .. }
            | Constraint::Length { .. }
            | Constraint::Angle { .. }
            | Constraint::Radius { .. }
            | Constraint::Diameter { .. } => PriorityTier::Low,
        }
    }

    /// Number of scalar residual rows this constraint produces.
    pub fn residual_dim(&self) -> usize {
        match self {
            Constraint::Fixed { .. }
            | Constraint::Coincident { .. }
            | Constraint::Midpoint { .. }
            | Constraint::Collinear { .. }
            | Constraint::Concentric { .. }
            | Constraint::Symmetric { .. } => 2,

            Constraint::PointOnLine { .. }
            | Constraint::PointOnCircle { .. }
            | Constraint::Parallel { .. }
            | Constraint::Perpendicular { .. }
            | Constraint::Tangent { .. }
            | Constraint::EqualLength { .. }
            | Constraint::EqualRadius { .. }
            | Constraint::Horizontal { .. }
            | Constraint::Vertical { .. }
            | Constraint::Distance { .. }
            | Constraint::Length { .. }
            | Constraint::Angle { .. }
            | Constraint::Radius { .. }
            | Constraint::Diameter { .. } => 1,
        }
    }

    /// Entity ids referenced directly by this constraint.
    pub fn references(&self) -> Vec<EntityId> {
        match self {
            Constraint::Fixed { point, .. } => vec![*point],
            Constraint::Coincident { points } => vec![points[0], points[1]],
            Constraint::PointOnLine { point, line } => vec![*point, *line],
            Constraint::PointOnCircle { point, circle } => vec![*point, *circle],
            Constraint::Midpoint { point, line } => vec![*point, *line],
            Constraint::Collinear { lines } => vec![lines[0], lines[1]],
            Constraint::Concentric { entities } => vec![entities[0], entities[1]],
            Constraint::Parallel { lines } => vec![lines[0], lines[1]],
            Constraint::Perpendicular { lines } => vec![lines[0], lines[1]],
            Constraint::Tangent { line, circle } => vec![*line, *circle],
            Constraint::EqualLength { lines } => vec![lines[0], lines[1]],
            Constraint::EqualRadius { entities } => vec![entities[0], entities[1]],
            Constraint::Symmetric { points, axis } => vec![points[0], points[1], *axis],
            Constraint::Horizontal { line } => vec![*line],
            Constraint::Vertical { line } => vec![*line],
            Constraint::Distance { points, .. } => vec![points[0], points[1]],
            Constraint::Length { line, .. } => vec![*line],
            Constraint::Angle { lines, .. } => vec![lines[0], lines[1]],
            Constraint::Radius { entity, .. } => vec![*entity],
            Constraint::Diameter { entity, .. } => vec![*entity],
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Constraint::Fixed { .. } => "Fixed",
            Constraint::Coincident { .. } => "Coincident",
            Constraint::PointOnLine { .. } => "PointOnLine",
            Constraint::PointOnCircle { .. } => "PointOnCircle",
            Constraint::Midpoint { .. } => "Midpoint",
            Constraint::Collinear { .. } => "Collinear",
            Constraint::Concentric { .. } => "Concentric",
            Constraint::Parallel { .. } => "Parallel",
            Constraint::Perpendicular { .. } => "Perpendicular",
            Constraint::Tangent { .. } => "Tangent",
            Constraint::EqualLength { .. } => "EqualLength",
            Constraint::EqualRadius { .. } => "EqualRadius",
            Constraint::Symmetric { .. } => "Symmetric",
            Constraint::Horizontal { .. } => "Horizontal",
            Constraint::Vertical { .. } => "Vertical",
            Constraint::Distance { .. } => "Distance",
            Constraint::Length { .. } => "Length",
            Constraint::Angle { .. } => "Angle",
            Constraint::Radius { .. } => "Radius",
            Constraint::Diameter { .. } => "Diameter",
        }
    }
}
