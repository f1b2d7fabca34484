pub mod least_squares;
pub mod staged;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::id::ConstraintId;

use super::diagnostics;
use super::residual::{AssemblyConfig, ModelError, Problem};
use super::types::Sketch;
use super::variables::{self, VariableIndex};

pub use least_squares::IterativeLeastSquares;
pub use staged::PriorityStaged;

/// Weighted residual norm below which a solve counts as converged.
pub const RESIDUAL_NORM_TOL: f64 = 1e-3;
/// No single unweighted residual may exceed this in a converged solve.
pub const MAX_RESIDUAL_TOL: f64 = 1e-2;

/// Inner iteration stopping tolerances. All three default to 1e-8.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Relative cost decrease below which iteration stops.
    pub function: f64,
    /// Relative step size below which iteration stops.
    pub parameter: f64,
    /// Gradient infinity-norm below which iteration stops.
    pub gradient: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            function: 1e-8,
            parameter: 1e-8,
            gradient: 1e-8,
        }
    }
}

impl Tolerances {
    fn loosened(self, factor: f64) -> Self {
        Self {
            function: self.function * factor,
            parameter: self.parameter * factor,
            gradient: self.gradient * factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Damped least squares over all tiers at once. The default.
    DefaultIterative,
    /// Three-phase solve, strictly highest tiers first.
    PriorityStaged,
    /// Default backend, then a loosened retry, then the staged backend.
    PermissiveFallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    pub backend: BackendKind,
    /// Run cheap structural contradiction checks before any iteration.
    pub pre_validation: bool,
    /// Replace hard in-range branches with smooth penalty ramps.
    pub smooth_penalties: bool,
    /// Pull strength toward pre-solve positions. Zero disables spring-back.
    pub regularization_weight: f64,
    pub convergence_tolerances: Tolerances,
    /// Residual evaluation budget for the whole solve.
    pub max_evaluations: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::DefaultIterative,
            pre_validation: true,
            smooth_penalties: true,
            regularization_weight: 1e-4,
            convergence_tolerances: Tolerances::default(),
            max_evaluations: 1000,
        }
    }
}

/// Lifecycle of a solve call. Entry is always `Unsolved`; the terminal states
/// are `Solved`, `Inconsistent` and `NotConverged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Unsolved,
    Validating,
    Solving,
    Solved,
    Inconsistent,
    NotConverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DofClassification {
    WellConstrained,
    UnderConstrained,
    OverConstrained,
}

/// Phase of the staged backend that failed its acceptance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolvePhase {
    Critical,
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverResult {
    pub status: SolveStatus,
    pub final_residual_norm: f64,
    pub max_single_residual: f64,
    pub iterations: usize,
    /// Free variables minus effective constraint equations. Negative means
    /// over-constrained.
    pub degrees_of_freedom: i32,
    pub classification: DofClassification,
    /// On `Inconsistent`: the contradicting group. On `Solved` with an
    /// over-constrained sketch: the redundant duplicates.
    pub conflicting_constraint_ids: Vec<ConstraintId>,
    pub failing_phase: Option<SolvePhase>,
}

impl SolverResult {
    pub fn is_solved(&self) -> bool {
        self.status == SolveStatus::Solved
    }

    pub fn is_inconsistent(&self) -> bool {
        self.status == SolveStatus::Inconsistent
    }

    pub fn is_over_constrained(&self) -> bool {
        self.classification == DofClassification::OverConstrained
    }

    pub fn is_under_constrained(&self) -> bool {
        self.classification == DofClassification::UnderConstrained
    }
}

/// What a backend hands back to the orchestrator. `values` are candidate
/// variable values; nothing is written into the sketch here.
#[derive(Debug, Clone)]
pub struct BackendOutcome {
    pub values: DVector<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    pub max_residual: f64,
    pub converged: bool,
    pub failing_phase: Option<SolvePhase>,
    /// A structural contradiction was proven; iteration cannot fix it.
    pub inconsistent: Option<Vec<ConstraintId>>,
}

pub trait SolverBackend {
    fn solve(
        &self,
        sketch: &Sketch,
        index: &VariableIndex,
        initial: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<BackendOutcome, ModelError>;
}

/// Solves the sketch in place. Geometry is only mutated on success; every
/// failure path leaves the sketch exactly as it was passed in.
pub fn solve(sketch: &mut Sketch, options: &SolverOptions) -> Result<SolverResult, ModelError> {
    debug!(
        entities = sketch.entities.len(),
        constraints = sketch.constraints.len(),
        backend = ?options.backend,
        "starting sketch solve"
    );

    let (initial, index) = variables::collect_variables(sketch);

    // Assemble once up front so reference errors surface before any
    // iteration, and so failure reporting has residuals to quote.
    let full = Problem::build(
        sketch,
        &index,
        initial.clone(),
        &AssemblyConfig::standard(options.regularization_weight, options.smooth_penalties),
    )?;

    let (dof, duplicates) = diagnostics::effective_dof(sketch, &index);
    let classification = if dof > 0 {
        DofClassification::UnderConstrained
    } else if dof < 0 {
        DofClassification::OverConstrained
    } else {
        DofClassification::WellConstrained
    };

    if options.pre_validation {
        let groups = diagnostics::prevalidate(sketch);
        if !groups.is_empty() {
            let raw = full.eval_raw(&initial);
            debug!(groups = groups.len(), "pre-validation found contradictions");
            return Ok(SolverResult {
                status: SolveStatus::Inconsistent,
                final_residual_norm: full.weighted_norm(&raw),
                max_single_residual: full.max_abs(&raw),
                iterations: 0,
                degrees_of_freedom: dof,
                classification,
                conflicting_constraint_ids: groups.into_iter().flatten().collect(),
                failing_phase: None,
            });
        }
    }

    let plan: Vec<(Box<dyn SolverBackend>, SolverOptions)> = match options.backend {
        BackendKind::DefaultIterative => {
            vec![(Box::new(IterativeLeastSquares), options.clone())]
        }
        BackendKind::PriorityStaged => vec![(Box::new(PriorityStaged), options.clone())],
        BackendKind::PermissiveFallback => {
            let mut loosened = options.clone();
            loosened.convergence_tolerances = options.convergence_tolerances.loosened(1e3);
            loosened.max_evaluations = options.max_evaluations * 4;
            vec![
                (Box::new(IterativeLeastSquares), options.clone()),
                (Box::new(IterativeLeastSquares), loosened),
                (Box::new(PriorityStaged), options.clone()),
            ]
        }
    };

    let mut last: Option<BackendOutcome> = None;
    let mut total_iterations = 0;
    for (backend, backend_options) in plan {
        let mut outcome = backend.solve(sketch, &index, &initial, &backend_options)?;
        total_iterations += outcome.iterations;

        if let Some(ids) = outcome.inconsistent.take() {
            return Ok(SolverResult {
                status: SolveStatus::Inconsistent,
                final_residual_norm: outcome.residual_norm,
                max_single_residual: outcome.max_residual,
                iterations: total_iterations,
                degrees_of_freedom: dof,
                classification,
                conflicting_constraint_ids: ids,
                failing_phase: outcome.failing_phase,
            });
        }

        if outcome.converged {
            variables::apply(&outcome.values, &index, sketch);
            debug!(
                iterations = total_iterations,
                residual_norm = outcome.residual_norm,
                "solve converged"
            );
            return Ok(SolverResult {
                status: SolveStatus::Solved,
                final_residual_norm: outcome.residual_norm,
                max_single_residual: outcome.max_residual,
                iterations: total_iterations,
                degrees_of_freedom: dof,
                classification,
                conflicting_constraint_ids: duplicates,
                failing_phase: None,
            });
        }

        last = Some(outcome);
    }

    // All backends exhausted. Entities are untouched.
    let (norm, max_res, phase) = match &last {
        Some(outcome) => (
            outcome.residual_norm,
            outcome.max_residual,
            outcome.failing_phase,
        ),
        None => {
            let raw = full.eval_raw(&initial);
            (full.weighted_norm(&raw), full.max_abs(&raw), None)
        }
    };
    debug!(residual_norm = norm, "solve did not converge");
    Ok(SolverResult {
        status: SolveStatus::NotConverged,
        final_residual_norm: norm,
        max_single_residual: max_res,
        iterations: total_iterations,
        degrees_of_freedom: dof,
        classification,
        conflicting_constraint_ids: Vec::new(),
        failing_phase: phase,
    })
}
