use std::collections::HashMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::id::EntityId;

use super::types::{Sketch, SketchGeometry};

/// Role of a single scalar within the packed variable vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarRole {
    X,
    Y,
    Radius,
    StartAngle,
    EndAngle,
}

/// Variable offsets owned by one entity. Lines and fixed points own none.
#[derive(Debug, Clone, Copy)]
pub enum EntitySlots {
    Point {
        x: usize,
        y: usize,
    },
    Circle {
        radius: usize,
    },
    Arc {
        radius: usize,
        start_angle: usize,
        end_angle: usize,
    },
}

impl EntitySlots {
    pub fn offsets(&self) -> Vec<(usize, VarRole)> {
        match *self {
            EntitySlots::Point { x, y } => vec![(x, VarRole::X), (y, VarRole::Y)],
            EntitySlots::Circle { radius } => vec![(radius, VarRole::Radius)],
            EntitySlots::Arc {
                radius,
                start_angle,
                end_angle,
            } => vec![
                (radius, VarRole::Radius),
                (start_angle, VarRole::StartAngle),
                (end_angle, VarRole::EndAngle),
            ],
        }
    }
}

/// Maps each non-fixed entity field onto an offset in the packed variable
/// vector, and back. Rebuilt fresh for every solve call.
#[derive(Debug, Clone, Default)]
pub struct VariableIndex {
    slots: HashMap<EntityId, EntitySlots>,
    owners: Vec<(EntityId, VarRole)>,
}

impl VariableIndex {
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn slot(&self, id: EntityId) -> Option<EntitySlots> {
        self.slots.get(&id).copied()
    }

    /// Entity and role owning a given vector offset.
    pub fn owner(&self, offset: usize) -> Option<(EntityId, VarRole)> {
        self.owners.get(offset).copied()
    }
}

/// Flattens the sketch into a scalar variable vector plus the index that
/// describes it. Pure transformation; fixed points contribute nothing.
pub fn collect_variables(sketch: &Sketch) -> (DVector<f64>, VariableIndex) {
    let mut values: Vec<f64> = Vec::new();
    let mut index = VariableIndex::default();

    for entity in &sketch.entities {
        match &entity.geometry {
            SketchGeometry::Point { pos, fixed } => {
                if *fixed {
                    continue;
                }
                let x = values.len();
                values.push(pos[0]);
                values.push(pos[1]);
                index.slots.insert(entity.id, EntitySlots::Point { x, y: x + 1 });
                index.owners.push((entity.id, VarRole::X));
                index.owners.push((entity.id, VarRole::Y));
            }
            SketchGeometry::Line { .. } => {}
            SketchGeometry::Circle { radius, .. } => {
                let r = values.len();
                values.push(*radius);
                index.slots.insert(entity.id, EntitySlots::Circle { radius: r });
                index.owners.push((entity.id, VarRole::Radius));
            }
            SketchGeometry::Arc {
                radius,
                start_angle,
                end_angle,
                ..
            } => {
                let r = values.len();
                values.push(*radius);
                values.push(*start_angle);
                values.push(*end_angle);
                index.slots.insert(
                    entity.id,
                    EntitySlots::Arc {
                        radius: r,
                        start_angle: r + 1,
                        end_angle: r + 2,
                    },
                );
                index.owners.push((entity.id, VarRole::Radius));
                index.owners.push((entity.id, VarRole::StartAngle));
                index.owners.push((entity.id, VarRole::EndAngle));
            }
        }
    }

    (DVector::from_vec(values), index)
}

/// Writes solved values back into the sketch. Called exactly once, from the
/// orchestrator, only after the backend confirms success.
pub fn apply(values: &DVector<f64>, index: &VariableIndex, sketch: &mut Sketch) {
    for entity in &mut sketch.entities {
        let Some(slot) = index.slot(entity.id) else {
            continue;
        };
        match (&mut entity.geometry, slot) {
            (SketchGeometry::Point { pos, .. }, EntitySlots::Point { x, y }) => {
                pos[0] = values[x];
                pos[1] = values[y];
            }
            (SketchGeometry::Circle { radius, .. }, EntitySlots::Circle { radius: r }) => {
                *radius = values[r];
            }
            (
                SketchGeometry::Arc {
                    radius,
                    start_angle,
                    end_angle,
                    ..
                },
                EntitySlots::Arc {
                    radius: r,
                    start_angle: sa,
                    end_angle: ea,
                },
            ) => {
                *radius = values[r];
                *start_angle = values[sa];
                *end_angle = values[ea];
            }
            _ => {}
        }
    }
}
