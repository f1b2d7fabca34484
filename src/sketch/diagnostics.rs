use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::id::{ConstraintId, EntityId};

use super::constraints::Constraint;
use super::residual::{wrap_angle, AssemblyConfig, ModelError, Problem};
use super::solver::{IterativeLeastSquares, SolverBackend, SolverOptions};
use super::types::{Sketch, SketchGeometry};
use super::variables::{self, EntitySlots, VarRole, VariableIndex};

/// Upper bound on feasibility probes during conflict isolation. Keeps
/// `find_conflicts` interactive on large sketches.
const MAX_PROBES: usize = 20;

/// Free variables minus effective constraint equations. Duplicate
/// constraints count once, so stacking the same dimension twice does not
/// push a solvable sketch into apparent over-constraint.
pub fn degrees_of_freedom(sketch: &Sketch) -> i32 {
    let (_, index) = variables::collect_variables(sketch);
    effective_dof(sketch, &index).0
}

/// DOF plus the redundant duplicate ids found while deduplicating.
pub(crate) fn effective_dof(sketch: &Sketch, index: &VariableIndex) -> (i32, Vec<ConstraintId>) {
    let mut seen: HashMap<String, ConstraintId> = HashMap::new();
    let mut duplicates = Vec::new();
    let mut equations = 0i32;
    for (cid, constraint) in sketch.active_constraints() {
        let sig = signature(constraint);
        if seen.contains_key(&sig) {
            duplicates.push(cid);
        } else {
            seen.insert(sig, cid);
            equations += constraint.residual_dim() as i32;
        }
    }
    (index.len() as i32 - equations, duplicates)
}

/// Pairs of (kept, duplicate) active constraints with identical meaning.
pub fn duplicate_constraints(sketch: &Sketch) -> Vec<(ConstraintId, ConstraintId)> {
    let mut seen: HashMap<String, ConstraintId> = HashMap::new();
    let mut pairs = Vec::new();
    for (cid, constraint) in sketch.active_constraints() {
        let sig = signature(constraint);
        match seen.get(&sig) {
            Some(first) => pairs.push((*first, cid)),
            None => {
                seen.insert(sig, cid);
            }
        }
    }
    pairs
}

/// Normalized textual identity of a constraint: symmetric kinds sort their
/// entity pair so `Coincident(a, b)` and `Coincident(b, a)` collide.
fn signature(constraint: &Constraint) -> String {
    fn pair(a: EntityId, b: EntityId) -> (EntityId, EntityId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
    match constraint {
        Constraint::Fixed { point, position } => {
            format!("fixed:{point}:{:.9}:{:.9}", position[0], position[1])
        }
        Constraint::Coincident { points } => {
            let (a, b) = pair(points[0], points[1]);
            format!("coincident:{a}:{b}")
        }
        Constraint::PointOnLine { point, line } => format!("point_on_line:{point}:{line}"),
        Constraint::PointOnCircle { point, circle } => {
            format!("point_on_circle:{point}:{circle}")
        }
        Constraint::Midpoint { point, line } => format!("midpoint:{point}:{line}"),
        Constraint::Collinear { lines } => {
            let (a, b) = pair(lines[0], lines[1]);
            format!("collinear:{a}:{b}")
        }
        Constraint::Concentric { entities } => {
            let (a, b) = pair(entities[0], entities[1]);
            format!("concentric:{a}:{b}")
        }
        Constraint::Parallel { lines } => {
            let (a, b) = pair(lines[0], lines[1]);
            format!("parallel:{a}:{b}")
        }
        Constraint::Perpendicular { lines } => {
            let (a, b) = pair(lines[0], lines[1]);
            format!("perpendicular:{a}:{b}")
        }
        Constraint::Tangent { line, circle } => format!("tangent:{line}:{circle}"),
        Constraint::EqualLength { lines } => {
            let (a, b) = pair(lines[0], lines[1]);
            format!("equal_length:{a}:{b}")
        }
        Constraint::EqualRadius { entities } => {
            let (a, b) = pair(entities[0], entities[1]);
            format!("equal_radius:{a}:{b}")
        }
        Constraint::Symmetric { points, axis } => {
            let (a, b) = pair(points[0], points[1]);
            format!("symmetric:{a}:{b}:{axis}")
        }
        Constraint::Horizontal { line } => format!("horizontal:{line}"),
        Constraint::Vertical { line } => format!("vertical:{line}"),
        Constraint::Distance { points, value } => {
            let (a, b) = pair(points[0], points[1]);
            format!("distance:{a}:{b}:{value:.9}")
        }
        Constraint::Length { line, value } => format!("length:{line}:{value:.9}"),
        Constraint::Angle { lines, value } => {
            format!("angle:{}:{}:{value:.9}", lines[0], lines[1])
        }
        Constraint::Radius { entity, value } => format!("radius:{entity}:{value:.9}"),
        Constraint::Diameter { entity, value } => format!("diameter:{entity}:{value:.9}"),
    }
}

/// Cheap structural contradiction scan, no iteration involved. Each returned
/// group is a set of constraints that cannot hold together.
pub(crate) fn prevalidate(sketch: &Sketch) -> Vec<Vec<ConstraintId>> {
    let active: Vec<(ConstraintId, &Constraint)> = sketch.active_constraints().collect();
    let mut groups: Vec<Vec<ConstraintId>> = Vec::new();

    for (i, (id_a, a)) in active.iter().enumerate() {
        for (id_b, b) in active.iter().skip(i + 1) {
            if contradicts(a, b) {
                groups.push(vec![*id_a, *id_b]);
            }
        }
    }
    groups
}

fn contradicts(a: &Constraint, b: &Constraint) -> bool {
    fn same_pair(p: &[EntityId; 2], q: &[EntityId; 2]) -> bool {
        (p[0] == q[0] && p[1] == q[1]) || (p[0] == q[1] && p[1] == q[0])
    }
    const VALUE_TOL: f64 = 1e-9;

    match (a, b) {
        (
            Constraint::Fixed { point: p1, position: t1 },
            Constraint::Fixed { point: p2, position: t2 },
        ) => {
            p1 == p2
                && ((t1[0] - t2[0]).abs() > VALUE_TOL || (t1[1] - t2[1]).abs() > VALUE_TOL)
        }
        (
            Constraint::Distance { points: p1, value: v1 },
            Constraint::Distance { points: p2, value: v2 },
        ) => same_pair(p1, p2) && (v1 - v2).abs() > VALUE_TOL,
        (
            Constraint::Length { line: l1, value: v1 },
            Constraint::Length { line: l2, value: v2 },
        ) => l1 == l2 && (v1 - v2).abs() > VALUE_TOL,
        (
            Constraint::Radius { entity: e1, value: v1 },
            Constraint::Radius { entity: e2, value: v2 },
        ) => e1 == e2 && (v1 - v2).abs() > VALUE_TOL,
        (
            Constraint::Diameter { entity: e1, value: v1 },
            Constraint::Diameter { entity: e2, value: v2 },
        ) => e1 == e2 && (v1 - v2).abs() > VALUE_TOL,
        (
            Constraint::Radius { entity: e1, value: r },
            Constraint::Diameter { entity: e2, value: d },
        )
        | (
            Constraint::Diameter { entity: e2, value: d },
            Constraint::Radius { entity: e1, value: r },
        ) => e1 == e2 && (2.0 * r - d).abs() > VALUE_TOL,
        (
            Constraint::Angle { lines: l1, value: v1 },
            Constraint::Angle { lines: l2, value: v2 },
        ) => l1 == l2 && wrap_angle(v1 - v2).abs() > VALUE_TOL,
        (Constraint::Horizontal { line: l1 }, Constraint::Vertical { line: l2 })
        | (Constraint::Vertical { line: l2 }, Constraint::Horizontal { line: l1 }) => l1 == l2,
        _ => false,
    }
}

/// Isolates groups of mutually contradictory constraints: structural pairs
/// from pre-validation plus, when the sketch is numerically infeasible, a
/// minimal unsatisfiable subset narrowed by deletion probes. Read-only; the
/// sketch is cloned for probing.
pub fn find_conflicts(
    sketch: &Sketch,
    options: &SolverOptions,
) -> Result<Vec<Vec<ConstraintId>>, ModelError> {
    let mut groups = prevalidate(sketch);
    let structural: HashSet<ConstraintId> = groups.iter().flatten().copied().collect();

    let excluded: Vec<ConstraintId> = structural.iter().copied().collect();
    let (feasible, errors) = probe(sketch, options, &excluded)?;
    if feasible {
        return Ok(groups);
    }

    // Deletion-based narrowing over the worst offenders. Dropping a
    // constraint that leaves the rest infeasible means it was not needed
    // for the contradiction; one whose removal restores feasibility is.
    let mut candidates: Vec<(ConstraintId, f64)> = errors
        .into_iter()
        .filter(|(id, err)| *err > 1e-2 && !structural.contains(id))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut removed: Vec<ConstraintId> = excluded;
    let mut mus: Vec<ConstraintId> = Vec::new();
    let mut probes = 1;
    for (cid, _) in candidates {
        if probes >= MAX_PROBES {
            debug!("probe budget exhausted during conflict isolation");
            mus.push(cid);
            continue;
        }
        removed.push(cid);
        let (still_ok, _) = probe(sketch, options, &removed)?;
        probes += 1;
        if still_ok {
            // Removing it fixed the sketch, so it belongs to the conflict.
            removed.pop();
            mus.push(cid);
        }
    }

    if !mus.is_empty() {
        groups.push(mus);
    }
    Ok(groups)
}

/// Feasibility probe: can the sketch be solved with `excluded` suppressed?
/// Also returns per-constraint errors at the probe's final values.
fn probe(
    sketch: &Sketch,
    options: &SolverOptions,
    excluded: &[ConstraintId],
) -> Result<(bool, Vec<(ConstraintId, f64)>), ModelError> {
    let mut trial = sketch.clone();
    for id in excluded {
        trial.set_constraint_suppression(*id, true);
    }
    let (initial, index) = variables::collect_variables(&trial);
    let outcome = IterativeLeastSquares.solve(&trial, &index, &initial, options)?;

    let problem = Problem::build(
        &trial,
        &index,
        initial,
        &AssemblyConfig::standard(0.0, options.smooth_penalties),
    )?;
    let raw = problem.eval_raw(&outcome.values);
    let errors = problem
        .per_constraint_error(&raw)
        .into_iter()
        .map(|(id, _, err)| (id, err))
        .collect();
    Ok((outcome.converged, errors))
}

/// What kind of constraint an under-constrained entity is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingCategory {
    /// Translational freedom: position not determined.
    Position,
    /// A size is free: radius, length.
    Dimension,
    /// A direction is free: the entity can rotate.
    Orientation,
}

/// Per-entity report of remaining freedoms. Entities that are fully
/// determined do not appear.
pub fn find_under_constrained(
    sketch: &Sketch,
) -> Result<HashMap<EntityId, Vec<MissingCategory>>, ModelError> {
    let (initial, index) = variables::collect_variables(sketch);
    let problem = Problem::build(sketch, &index, initial, &AssemblyConfig::standard(0.0, true))?;
    let touched = problem.touched_counts();
    let row_counts = problem.entity_row_counts(&index);

    let mut report: HashMap<EntityId, Vec<MissingCategory>> = HashMap::new();
    for entity in &sketch.entities {
        let Some(slots) = index.slot(entity.id) else {
            continue;
        };
        let mut missing = Vec::new();
        for (offset, role) in slots.offsets() {
            if touched[offset] > 0 {
                continue;
            }
            let category = match role {
                VarRole::X | VarRole::Y => MissingCategory::Position,
                VarRole::Radius | VarRole::StartAngle | VarRole::EndAngle => {
                    MissingCategory::Dimension
                }
            };
            if !missing.contains(&category) {
                missing.push(category);
            }
        }
        // Touched but not pinned down: fewer equations than freedoms.
        if missing.is_empty() {
            let free = match slots {
                EntitySlots::Point { .. } => 2,
                EntitySlots::Circle { .. } => 1,
                EntitySlots::Arc { .. } => 3,
            };
            let rows = row_counts.get(&entity.id).copied().unwrap_or(0);
            if rows < free {
                missing.push(match slots {
                    EntitySlots::Point { .. } => MissingCategory::Position,
                    _ => MissingCategory::Dimension,
                });
            }
        }
        if !missing.is_empty() {
            report.insert(entity.id, missing);
        }
    }

    // Lines own no variables, so direction freedom is judged by whether any
    // orientation-bearing constraint references the line.
    for entity in &sketch.entities {
        if !matches!(entity.geometry, SketchGeometry::Line { .. }) {
            continue;
        }
        let oriented = sketch.active_constraints().any(|(_, c)| {
            matches!(
                c,
                Constraint::Horizontal { .. }
                    | Constraint::Vertical { .. }
                    | Constraint::Parallel { .. }
                    | Constraint::Perpendicular { .. }
                    | Constraint::Angle { .. }
                    | Constraint::Collinear { .. }
                    | Constraint::Tangent { .. }
            ) && c.references().contains(&entity.id)
        });
        if !oriented {
            report
                .entry(entity.id)
                .or_default()
                .push(MissingCategory::Orientation);
        }
    }

    Ok(report)
}
