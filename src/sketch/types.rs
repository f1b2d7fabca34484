use crate::id::{ConstraintId, EntityId};
use serde::{Deserialize, Serialize};

use super::constraints::Constraint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SketchGeometry {
    /// Free point. A `fixed` point contributes no solver variables; the
    /// stored position is authoritative.
    Point { pos: [f64; 2], fixed: bool },
    /// Segment between two Point entities. Owns no variables of its own.
    Line { start: EntityId, end: EntityId },
    /// Circle around a Point entity. The radius is the circle's only variable.
    Circle { center: EntityId, radius: f64 },
    /// Arc around a Point entity. Endpoints are derived from the angles.
    Arc {
        center: EntityId,
        radius: f64,
        start_angle: f64,
        end_angle: f64,
    },
}

impl SketchGeometry {
    pub fn kind_name(&self) -> &'static str {
        match self {
            SketchGeometry::Point { .. } => "Point",
            SketchGeometry::Line { .. } => "Line",
            SketchGeometry::Circle { .. } => "Circle",
            SketchGeometry::Arc { .. } => "Arc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SketchEntity {
    pub id: EntityId,
    pub geometry: SketchGeometry,
    #[serde(default)]
    pub is_construction: bool,
}

/// Wrapper for constraints with a stable id and suppression state.
/// Suppressed constraints are ignored by assembly, DOF accounting and
/// diagnostics but stay in the collection for the host to re-enable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintEntry {
    pub id: ConstraintId,
    pub constraint: Constraint,
    #[serde(default)]
    pub suppressed: bool,
}

impl ConstraintEntry {
    pub fn new(constraint: Constraint) -> Self {
        Self {
            id: ConstraintId::new(),
            constraint,
            suppressed: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Sketch {
    pub entities: Vec<SketchEntity>,
    pub constraints: Vec<ConstraintEntry>,
}

impl Sketch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&mut self, pos: [f64; 2]) -> EntityId {
        self.add_geometry(SketchGeometry::Point { pos, fixed: false })
    }

    pub fn add_fixed_point(&mut self, pos: [f64; 2]) -> EntityId {
        self.add_geometry(SketchGeometry::Point { pos, fixed: true })
    }

    pub fn add_line(&mut self, start: EntityId, end: EntityId) -> EntityId {
        self.add_geometry(SketchGeometry::Line { start, end })
    }

    pub fn add_circle(&mut self, center: EntityId, radius: f64) -> EntityId {
        self.add_geometry(SketchGeometry::Circle { center, radius })
    }

    pub fn add_arc(
        &mut self,
        center: EntityId,
        radius: f64,
        start_angle: f64,
        end_angle: f64,
    ) -> EntityId {
        self.add_geometry(SketchGeometry::Arc {
            center,
            radius,
            start_angle,
            end_angle,
        })
    }

    pub fn add_geometry(&mut self, geometry: SketchGeometry) -> EntityId {
        let id = EntityId::new();
        self.entities.push(SketchEntity {
            id,
            geometry,
            is_construction: false,
        });
        id
    }

    pub fn add_constraint(&mut self, constraint: Constraint) -> ConstraintId {
        let entry = ConstraintEntry::new(constraint);
        let id = entry.id;
        self.constraints.push(entry);
        id
    }

    pub fn entity(&self, id: EntityId) -> Option<&SketchEntity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Active (non-suppressed) constraints with their ids.
    pub fn active_constraints(&self) -> impl Iterator<Item = (ConstraintId, &Constraint)> {
        self.constraints
            .iter()
            .filter(|e| !e.suppressed)
            .map(|e| (e.id, &e.constraint))
    }

    pub fn set_constraint_suppression(&mut self, id: ConstraintId, suppressed: bool) {
        if let Some(entry) = self.constraints.iter_mut().find(|e| e.id == id) {
            entry.suppressed = suppressed;
        }
    }

    pub fn toggle_constraint_suppression(&mut self, id: ConstraintId) -> bool {
        if let Some(entry) = self.constraints.iter_mut().find(|e| e.id == id) {
            entry.suppressed = !entry.suppressed;
            entry.suppressed
        } else {
            false
        }
    }
}
