use nalgebra::{DMatrix, DVector};
use tracing::trace;

use super::super::residual::{AssemblyConfig, ModelError, Problem};
use super::super::types::Sketch;
use super::super::variables::VariableIndex;
use super::{
    BackendOutcome, SolverBackend, SolverOptions, Tolerances, MAX_RESIDUAL_TOL, RESIDUAL_NORM_TOL,
};

const FD_STEP: f64 = 1e-7;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

/// Damped least squares over the full weighted system, all tiers at once.
/// Derivatives come from forward differences so residual expressions only
/// need to be evaluable, not differentiable in code.
pub struct IterativeLeastSquares;

impl SolverBackend for IterativeLeastSquares {
    fn solve(
        &self,
        sketch: &Sketch,
        index: &VariableIndex,
        initial: &DVector<f64>,
        options: &SolverOptions,
    ) -> Result<BackendOutcome, ModelError> {
        let problem = Problem::build(
            sketch,
            index,
            initial.clone(),
            &AssemblyConfig::standard(options.regularization_weight, options.smooth_penalties),
        )?;

        let min = minimize(
            &problem,
            initial.clone(),
            options.convergence_tolerances,
            options.max_evaluations,
        );

        let raw = problem.eval_raw(&min.values);
        let residual_norm = problem.weighted_norm(&raw);
        let max_residual = problem.max_abs(&raw);
        let converged = residual_norm < RESIDUAL_NORM_TOL && max_residual < MAX_RESIDUAL_TOL;

        Ok(BackendOutcome {
            values: min.values,
            iterations: min.iterations,
            residual_norm,
            max_residual,
            converged,
            failing_phase: None,
            inconsistent: None,
        })
    }
}

pub(crate) struct Minimization {
    pub values: DVector<f64>,
    /// Residual evaluations consumed, Jacobian columns included.
    pub iterations: usize,
}

/// Levenberg-Marquardt with a forward-difference Jacobian. The evaluation
/// budget counts every residual evaluation, so a Jacobian costs n of them.
pub(crate) fn minimize(
    problem: &Problem,
    mut x: DVector<f64>,
    tol: Tolerances,
    max_evaluations: usize,
) -> Minimization {
    let n = x.len();
    let m = problem.total_len();
    if n == 0 || m == 0 {
        return Minimization {
            values: x,
            iterations: 0,
        };
    }

    let mut evaluations = 0usize;
    let mut residual = problem.residuals(&x);
    evaluations += 1;
    let mut cost = residual.norm_squared();
    let mut lambda = LAMBDA_INIT;

    while evaluations + n < max_evaluations {
        // Forward-difference Jacobian, one evaluation per column.
        let mut jacobian = DMatrix::zeros(m, n);
        for j in 0..n {
            let h = FD_STEP * (1.0 + x[j].abs());
            let saved = x[j];
            x[j] = saved + h;
            let shifted = problem.residuals(&x);
            x[j] = saved;
            evaluations += 1;
            for i in 0..m {
                jacobian[(i, j)] = (shifted[i] - residual[i]) / h;
            }
        }

        let gradient = jacobian.transpose() * &residual;
        if gradient.amax() < tol.gradient {
            break;
        }
        let jtj = jacobian.transpose() * &jacobian;

        let mut stepped = false;
        while evaluations < max_evaluations {
            // Marquardt scaling: damp along diag(JtJ) so badly scaled
            // variables are not crushed by a single lambda.
            let mut damped = jtj.clone();
            for j in 0..n {
                let d = jtj[(j, j)].max(1e-12);
                damped[(j, j)] += lambda * d;
            }
            let Some(chol) = damped.cholesky() else {
                lambda = (lambda * 10.0).min(LAMBDA_MAX);
                if lambda >= LAMBDA_MAX {
                    break;
                }
                continue;
            };
            let step = chol.solve(&(-&gradient));

            let candidate = &x + &step;
            let candidate_residual = problem.residuals(&candidate);
            evaluations += 1;
            let candidate_cost = candidate_residual.norm_squared();

            if candidate_cost < cost {
                let step_norm = step.norm();
                let relative_decrease = (cost - candidate_cost) / cost.max(1e-300);
                x = candidate;
                residual = candidate_residual;
                cost = candidate_cost;
                lambda = (lambda * 0.3).max(LAMBDA_MIN);
                stepped = true;
                trace!(cost, lambda, "step accepted");
                if relative_decrease < tol.function {
                    return Minimization {
                        values: x,
                        iterations: evaluations,
                    };
                }
                if step_norm < tol.parameter * (x.norm() + tol.parameter) {
                    return Minimization {
                        values: x,
                        iterations: evaluations,
                    };
                }
                break;
            }

            lambda *= 4.0;
            if lambda > LAMBDA_MAX {
                break;
            }
        }

        if !stepped {
            break;
        }
    }

    Minimization {
        values: x,
        iterations: evaluations,
    }
}
