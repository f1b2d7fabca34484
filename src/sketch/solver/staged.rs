use std::collections::HashMap;

use nalgebra::DVector;
use tracing::debug;

use crate::id::{ConstraintId, EntityId};

use super::super::constraints::{Constraint, PriorityTier};
use super::super::residual::{AssemblyConfig, ModelError, Problem, TierSet, WeightProfile};
use super::super::types::{Sketch, SketchGeometry};
use super::super::variables::{EntitySlots, VariableIndex};
use super::least_squares::minimize;
use super::{
    BackendOutcome, SolvePhase, SolverBackend, SolverOptions, MAX_RESIDUAL_TOL, RESIDUAL_NORM_TOL,
};

/// Acceptance bound for Critical rows after their dedicated phase. Much
/// tighter than the overall success bound: topology is exact or the sketch
/// is inconsistent.
const PHASE_CRITICAL_TOL: f64 = 1e-6;
const PHASE_HIGH_TOL: f64 = 1e-2;
/// Pins closer than this count as the same position.
const PIN_TOL: f64 = 1e-9;

/// Three-phase backend: Critical constraints are established first (closed
/// form where possible), then High, then the rest. Later phases regularize
/// toward the committed earlier result so they can only refine it, never
/// undo it.
pub struct PriorityStaged;

impl SolverBackend for PriorityStaged {
    fn solve(
        &self,
        sketch: &Sketch,
        index: &VariableIndex,
        initial: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<BackendOutcome, ModelError> {
        let phase_budget = (options.max_evaluations / 3).max(50);
        let mut values = initial.clone();
        let mut iterations = 0usize;

        // Phase 1: Critical. Closed-form placement first, then a cleanup
        // pass for the kinds with no closed form (PointOnLine, Tangent...).
        if let Some(conflict) = place_pinned_groups(sketch, index, &mut values) {
            let report = self.report_problem(sketch, index, initial, options)?;
            let raw = report.eval_raw(initial);
            return Ok(BackendOutcome {
                values: initial.clone(),
                iterations: 0,
                residual_norm: report.weighted_norm(&raw),
                max_residual: report.max_abs(&raw),
                converged: false,
                failing_phase: Some(SolvePhase::Critical),
                inconsistent: Some(conflict),
            });
        }

        let critical = Problem::build(
            sketch,
            index,
            values.clone(),
            &AssemblyConfig {
                tiers: TierSet::of(&[PriorityTier::Critical]),
                weights: WeightProfile::uniform(1.0),
                regularization: 1e-6,
                smooth_penalties: options.smooth_penalties,
            },
        )?;
        let min = minimize(
            &critical,
            values,
            options.convergence_tolerances,
            phase_budget,
        );
        values = min.values;
        iterations += min.iterations;

        let raw = critical.eval_raw(&values);
        let violated: Vec<ConstraintId> = critical
            .per_constraint_error(&raw)
            .into_iter()
            .filter(|(_, _, err)| *err > PHASE_CRITICAL_TOL)
            .map(|(id, _, _)| id)
            .collect();
        if !violated.is_empty() {
            debug!(violated = violated.len(), "critical phase infeasible");
            let report = self.report_problem(sketch, index, initial, options)?;
            let raw = report.eval_raw(initial);
            return Ok(BackendOutcome {
                values: initial.clone(),
                iterations,
                residual_norm: report.weighted_norm(&raw),
                max_residual: report.max_abs(&raw),
                converged: false,
                failing_phase: Some(SolvePhase::Critical),
                inconsistent: Some(violated),
            });
        }
        let committed_critical = values.clone();

        // Phase 2: High, with Critical dominating and a pull toward the
        // phase-1 result so topology cannot drift.
        let high = Problem::build(
            sketch,
            index,
            committed_critical.clone(),
            &AssemblyConfig {
                tiers: TierSet::of(&[PriorityTier::Critical, PriorityTier::High]),
                weights: WeightProfile {
                    critical: 1e4,
                    high: 1.0,
                    medium: 1.0,
                    low: 1.0,
                },
                regularization: 1e-3,
                smooth_penalties: options.smooth_penalties,
            },
        )?;
        let min = minimize(&high, values, options.convergence_tolerances, phase_budget);
        iterations += min.iterations;

        let raw = high.eval_raw(&min.values);
        let high_ok = high.per_constraint_error(&raw).iter().all(|(_, tier, err)| {
            match tier {
                PriorityTier::Critical => *err <= PHASE_CRITICAL_TOL,
                _ => *err <= PHASE_HIGH_TOL,
            }
        });
        if !high_ok {
            debug!("high phase could not be satisfied, keeping critical result");
            return self.partial(
                sketch,
                index,
                committed_critical,
                iterations,
                SolvePhase::High,
                options,
            );
        }
        values = min.values;
        let committed_high = values.clone();

        // Phase 3: everything, dominated by the tiers already satisfied.
        let low = Problem::build(
            sketch,
            index,
            committed_high.clone(),
            &AssemblyConfig {
                tiers: TierSet::all(),
                weights: WeightProfile {
                    critical: 1e4,
                    high: 1e2,
                    medium: 10.0,
                    low: 1.0,
                },
                regularization: 1e-3,
                smooth_penalties: options.smooth_penalties,
            },
        )?;
        let min = minimize(&low, values, options.convergence_tolerances, phase_budget);
        iterations += min.iterations;

        // Final verdict is judged by the standard-weight assembly so the
        // reported numbers mean the same thing across backends.
        let report = self.report_problem(sketch, index, &min.values, options)?;
        let raw = report.eval_raw(&min.values);
        let residual_norm = report.weighted_norm(&raw);
        let max_residual = report.max_abs(&raw);
        let critical_ok = report
            .per_constraint_error(&raw)
            .iter()
            .all(|(_, tier, err)| *tier != PriorityTier::Critical || *err <= PHASE_CRITICAL_TOL);

        if critical_ok && residual_norm < RESIDUAL_NORM_TOL && max_residual < MAX_RESIDUAL_TOL {
            Ok(BackendOutcome {
                values: min.values,
                iterations,
                residual_norm,
                max_residual,
                converged: true,
                failing_phase: None,
                inconsistent: None,
            })
        } else {
            self.partial(
                sketch,
                index,
                committed_high,
                iterations,
                SolvePhase::Low,
                options,
            )
        }
    }
}

impl PriorityStaged {
    fn report_problem(
        &self,
        sketch: &Sketch,
        index: &VariableIndex,
        baseline: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<Problem, ModelError> {
        Problem::build(
            sketch,
            index,
            baseline.clone(),
            &AssemblyConfig::standard(options.regularization_weight, options.smooth_penalties),
        )
    }

    /// A phase failed its acceptance check: hand back the last committed
    /// values as a non-converged outcome tagged with the failing phase.
    fn partial(
        &self,
        sketch: &Sketch,
        index: &VariableIndex,
        committed: DVector<f64>,
        iterations: usize,
        phase: SolvePhase,
        options: &SolverOptions,
    ) -> Result<BackendOutcome, ModelError> {
        let report = self.report_problem(sketch, index, &committed, options)?;
        let raw = report.eval_raw(&committed);
        Ok(BackendOutcome {
            residual_norm: report.weighted_norm(&raw),
            max_residual: report.max_abs(&raw),
            values: committed,
            iterations,
            converged: false,
            failing_phase: Some(phase),
            inconsistent: None,
        })
    }
}

/// Closed-form part of the Critical phase: merge Coincident groups with
/// union-find and place every group at its pinned position (from Fixed
/// constraints or fixed-flag members) or at the member average. Returns the
/// conflicting constraint ids if two pins on one group disagree.
fn place_pinned_groups(
    sketch: &Sketch,
    index: &VariableIndex,
    values: &mut DVector<f64>,
) -> Option<Vec<ConstraintId>> {
    let mut uf = UnionFind::default();
    for (_, constraint) in sketch.active_constraints() {
        if let Constraint::Coincident { points } = constraint {
            uf.union(points[0], points[1]);
        }
    }
    for (_, constraint) in sketch.active_constraints() {
        if let Constraint::Fixed { point, .. } = constraint {
            uf.ensure(*point);
        }
    }

    // Pins per group: Fixed targets plus fixed-flag member positions.
    let mut pins: HashMap<EntityId, Vec<([f64; 2], Option<ConstraintId>)>> = HashMap::new();
    for (cid, constraint) in sketch.active_constraints() {
        if let Constraint::Fixed { point, position } = constraint {
            pins.entry(uf.find(*point))
                .or_default()
                .push((*position, Some(cid)));
        }
    }
    let mut members: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
    for point in uf.keys() {
        members.entry(uf.find(point)).or_default().push(point);
    }
    // Sorted members keep the group averages reproducible run to run.
    for group in members.values_mut() {
        group.sort();
    }
    for (root, group) in &members {
        for member in group {
            if let Some(SketchGeometry::Point { pos, fixed: true }) =
                sketch.entity(*member).map(|e| &e.geometry)
            {
                pins.entry(*root).or_default().push((*pos, None));
            }
        }
    }

    for (root, group_pins) in &pins {
        let first = group_pins[0].0;
        let disagreement = group_pins
            .iter()
            .any(|(pos, _)| (pos[0] - first[0]).abs() > PIN_TOL || (pos[1] - first[1]).abs() > PIN_TOL);
        if disagreement {
            let mut ids: Vec<ConstraintId> =
                group_pins.iter().filter_map(|(_, cid)| *cid).collect();
            for (cid, constraint) in sketch.active_constraints() {
                if let Constraint::Coincident { points } = constraint {
                    if uf.find(points[0]) == *root {
                        ids.push(cid);
                    }
                }
            }
            ids.sort();
            ids.dedup();
            return Some(ids);
        }
    }

    // Place each group's free members at the group target.
    for (root, group) in &members {
        let target = match pins.get(root) {
            Some(group_pins) => group_pins[0].0,
            None => {
                let mut sum = [0.0, 0.0];
                let mut count = 0.0;
                for member in group {
                    if let Some(pos) = point_position(sketch, index, values, *member) {
                        sum[0] += pos[0];
                        sum[1] += pos[1];
                        count += 1.0;
                    }
                }
                if count == 0.0 {
                    continue;
                }
                [sum[0] / count, sum[1] / count]
            }
        };
        for member in group {
            if let Some(EntitySlots::Point { x, y }) = index.slot(*member) {
                values[x] = target[0];
                values[y] = target[1];
            }
        }
    }

    None
}

fn point_position(
    sketch: &Sketch,
    index: &VariableIndex,
    values: &DVector<f64>,
    id: EntityId,
) -> Option<[f64; 2]> {
    if let Some(EntitySlots::Point { x, y }) = index.slot(id) {
        return Some([values[x], values[y]]);
    }
    match sketch.entity(id).map(|e| &e.geometry) {
        Some(SketchGeometry::Point { pos, .. }) => Some(*pos),
        _ => None,
    }
}

#[derive(Default)]
struct UnionFind {
    parent: HashMap<EntityId, EntityId>,
}

impl UnionFind {
    fn ensure(&mut self, id: EntityId) {
        self.parent.entry(id).or_insert(id);
    }

    fn find(&self, id: EntityId) -> EntityId {
        let mut current = id;
        while let Some(&parent) = self.parent.get(&current) {
            if parent == current {
                return current;
            }
            current = parent;
        }
        current
    }

    fn union(&mut self, a: EntityId, b: EntityId) {
        self.ensure(a);
        self.ensure(b);
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Deterministic root choice keeps solves reproducible.
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(merge, keep);
        }
    }

    fn keys(&self) -> Vec<EntityId> {
        self.parent.keys().copied().collect()
    }
}
