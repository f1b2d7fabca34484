use crate::sketch::constraints::{Constraint, PriorityTier};
use crate::sketch::residual::{AssemblyConfig, Problem, TierSet, WeightProfile};
use crate::sketch::types::Sketch;
use crate::sketch::variables::collect_variables;

fn assemble(sketch: &Sketch, cfg: &AssemblyConfig) -> Problem {
    let (initial, index) = collect_variables(sketch);
    Problem::build(sketch, &index, initial, cfg).unwrap()
}

fn raw_at_initial(sketch: &Sketch) -> nalgebra::DVector<f64> {
    let (initial, index) = collect_variables(sketch);
    let problem = Problem::build(
        sketch,
        &index,
        initial.clone(),
        &AssemblyConfig::standard(0.0, true),
    )
    .unwrap();
    problem.eval_raw(&initial)
}

#[test]
fn test_satisfied_constraints_evaluate_to_zero() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([10.0, 0.0]);
    let c = sketch.add_point([5.0, 0.0]);
    let l1 = sketch.add_line(a, b);

    let d = sketch.add_point([0.0, 3.0]);
    let e = sketch.add_point([10.0, 3.0]);
    let l2 = sketch.add_line(d, e);

    sketch.add_constraint(Constraint::Fixed { point: a, position: [0.0, 0.0] });
    sketch.add_constraint(Constraint::Midpoint { point: c, line: l1 });
    sketch.add_constraint(Constraint::PointOnLine { point: c, line: l1 });
    sketch.add_constraint(Constraint::Parallel { lines: [l1, l2] });
    sketch.add_constraint(Constraint::Horizontal { line: l1 });
    sketch.add_constraint(Constraint::Distance { points: [a, b], value: 10.0 });
    sketch.add_constraint(Constraint::Length { line: l2, value: 10.0 });
    sketch.add_constraint(Constraint::EqualLength { lines: [l1, l2] });

    let raw = raw_at_initial(&sketch);
    for i in 0..raw.len() {
        assert!(raw[i].abs() < 1e-9, "row {} is {}", i, raw[i]);
    }
}

#[test]
fn test_circle_constraints_evaluate_to_zero_when_satisfied() {
    let mut sketch = Sketch::new();
    let center = sketch.add_point([0.0, 0.0]);
    let c1 = sketch.add_circle(center, 5.0);
    let c2 = sketch.add_circle(center, 5.0);
    let rim = sketch.add_point([3.0, 4.0]);

    sketch.add_constraint(Constraint::PointOnCircle { point: rim, circle: c1 });
    sketch.add_constraint(Constraint::Concentric { entities: [c1, c2] });
    sketch.add_constraint(Constraint::EqualRadius { entities: [c1, c2] });
    sketch.add_constraint(Constraint::Radius { entity: c1, value: 5.0 });
    sketch.add_constraint(Constraint::Diameter { entity: c2, value: 10.0 });

    let raw = raw_at_initial(&sketch);
    for i in 0..raw.len() {
        assert!(raw[i].abs() < 1e-9, "row {} is {}", i, raw[i]);
    }
}

#[test]
fn test_perpendicular_and_angle_residuals() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([4.0, 0.0]);
    let c = sketch.add_point([0.0, 7.0]);
    let l1 = sketch.add_line(a, b);
    let l2 = sketch.add_line(a, c);

    sketch.add_constraint(Constraint::Perpendicular { lines: [l1, l2] });
    sketch.add_constraint(Constraint::Angle {
        lines: [l1, l2],
        value: std::f64::consts::FRAC_PI_2,
    });

    let raw = raw_at_initial(&sketch);
    assert!(raw[0].abs() < 1e-12, "perpendicular should be satisfied");
    assert!(raw[1].abs() < 1e-12, "quarter turn should match the target");
}

#[test]
fn test_angle_residual_wraps_across_pi() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 0.0]);
    let c = sketch.add_point([-1.0, -1e-6]);
    let l1 = sketch.add_line(a, b);
    let l2 = sketch.add_line(a, c);

    // Actual angle is just below -pi of the target; the wrapped error must
    // be tiny, not ~2*pi.
    sketch.add_constraint(Constraint::Angle {
        lines: [l1, l2],
        value: std::f64::consts::PI,
    });

    let raw = raw_at_initial(&sketch);
    assert!(raw[0].abs() < 1e-5, "wrapped error should be near zero, got {}", raw[0]);
}

#[test]
fn test_symmetric_residual_measures_reflection() {
    let mut sketch = Sketch::new();
    let axis_a = sketch.add_point([0.0, -10.0]);
    let axis_b = sketch.add_point([0.0, 10.0]);
    let axis = sketch.add_line(axis_a, axis_b);
    let p = sketch.add_point([3.0, 2.0]);
    let q = sketch.add_point([-3.0, 2.0]);

    sketch.add_constraint(Constraint::Symmetric { points: [p, q], axis });

    let raw = raw_at_initial(&sketch);
    assert!(raw[0].abs() < 1e-12 && raw[1].abs() < 1e-12);
}

#[test]
fn test_tangent_residual_zero_on_touching_line() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([-10.0, 5.0]);
    let b = sketch.add_point([10.0, 5.0]);
    let line = sketch.add_line(a, b);
    let center = sketch.add_point([0.0, 0.0]);
    let circle = sketch.add_circle(center, 5.0);

    sketch.add_constraint(Constraint::Tangent { line, circle });

    // The perpendicular foot lands mid-segment, so the barrier contributes
    // almost nothing and the distance term is exactly radius.
    let raw = raw_at_initial(&sketch);
    assert!(raw[0].abs() < 1e-4, "tangent residual {}", raw[0]);
}

#[test]
fn test_tangent_barrier_penalizes_foot_outside_segment() {
    let mut sketch = Sketch::new();
    // Segment far to the right; the circle center projects well before the
    // segment start.
    let a = sketch.add_point([100.0, 5.0]);
    let b = sketch.add_point([110.0, 5.0]);
    let line = sketch.add_line(a, b);
    let center = sketch.add_point([0.0, 0.0]);
    let circle = sketch.add_circle(center, 5.0);

    sketch.add_constraint(Constraint::Tangent { line, circle });

    let (initial, index) = collect_variables(&sketch);
    let smooth = Problem::build(
        &sketch,
        &index,
        initial.clone(),
        &AssemblyConfig::standard(0.0, true),
    )
    .unwrap();
    let hard = Problem::build(
        &sketch,
        &index,
        initial.clone(),
        &AssemblyConfig::standard(0.0, false),
    )
    .unwrap();

    let with_barrier = smooth.eval_raw(&initial)[0];
    let without = hard.eval_raw(&initial)[0];
    assert!(
        with_barrier > without + 1.0,
        "barrier should add a large penalty: {} vs {}",
        with_barrier,
        without
    );
}

#[test]
fn test_collinear_produces_two_rows() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([5.0, 0.0]);
    let c = sketch.add_point([8.0, 0.0]);
    let d = sketch.add_point([12.0, 0.0]);
    let l1 = sketch.add_line(a, b);
    let l2 = sketch.add_line(c, d);

    sketch.add_constraint(Constraint::Collinear { lines: [l1, l2] });

    let raw = raw_at_initial(&sketch);
    assert_eq!(raw.len(), 2);
    assert!(raw[0].abs() < 1e-12 && raw[1].abs() < 1e-12);

    // Offset the second line: the direction row stays zero, the offset row
    // picks up the gap.
    let mut shifted = sketch.clone();
    if let Some(entry) = shifted.entities.iter_mut().find(|e| e.id == c) {
        entry.geometry = crate::sketch::types::SketchGeometry::Point {
            pos: [8.0, 2.0],
            fixed: false,
        };
    }
    if let Some(entry) = shifted.entities.iter_mut().find(|e| e.id == d) {
        entry.geometry = crate::sketch::types::SketchGeometry::Point {
            pos: [12.0, 2.0],
            fixed: false,
        };
    }
    let raw = raw_at_initial(&shifted);
    assert!(raw[0].abs() < 1e-12, "directions still parallel");
    assert!(raw[1].abs() > 1.0, "offset row should see the gap");
}

#[test]
fn test_batched_rows_match_scalar_formulas() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 1.0]);
    let b = sketch.add_point([3.0, 5.0]);
    let c = sketch.add_point([4.0, 2.0]);
    let d = sketch.add_point([9.0, 2.0]);
    let l1 = sketch.add_line(a, b);
    let l2 = sketch.add_line(c, d);
    let center = sketch.add_fixed_point([0.0, 0.0]);
    let circle = sketch.add_circle(center, 2.0);

    sketch.add_constraint(Constraint::Coincident { points: [a, c] });
    sketch.add_constraint(Constraint::Horizontal { line: l1 });
    sketch.add_constraint(Constraint::Vertical { line: l1 });
    sketch.add_constraint(Constraint::Length { line: l1, value: 4.0 });
    sketch.add_constraint(Constraint::EqualLength { lines: [l1, l2] });
    sketch.add_constraint(Constraint::Radius { entity: circle, value: 3.5 });

    let raw = raw_at_initial(&sketch);
    // Coincident: a - c
    assert!((raw[0] - (0.0 - 4.0)).abs() < 1e-12);
    assert!((raw[1] - (1.0 - 2.0)).abs() < 1e-12);
    // Horizontal: dy, Vertical: dx
    assert!((raw[2] - (1.0 - 5.0)).abs() < 1e-12);
    assert!((raw[3] - (0.0 - 3.0)).abs() < 1e-12);
    // Length: |l1| - 4 = 5 - 4
    assert!((raw[4] - 1.0).abs() < 1e-12);
    // EqualLength: |l1| - |l2| = 5 - 5
    assert!(raw[5].abs() < 1e-12);
    // Radius: 2 - 3.5
    assert!((raw[6] + 1.5).abs() < 1e-12);
}

#[test]
fn test_tier_weights_scale_residual_rows() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 0.0]);
    sketch.add_constraint(Constraint::Coincident { points: [a, b] });
    sketch.add_constraint(Constraint::Distance { points: [a, b], value: 3.0 });

    let (initial, index) = collect_variables(&sketch);
    let cfg = AssemblyConfig {
        tiers: TierSet::all(),
        weights: WeightProfile::default(),
        regularization: 0.0,
        smooth_penalties: true,
    };
    let problem = Problem::build(&sketch, &index, initial.clone(), &cfg).unwrap();

    let raw = problem.eval_raw(&initial);
    let weighted = problem.residuals(&initial);
    // Coincident is Critical (1e3), Distance is Low (1.0).
    assert!((weighted[0] - 1e3 * raw[0]).abs() < 1e-9);
    assert!((weighted[2] - raw[2]).abs() < 1e-12);
}

#[test]
fn test_regularization_rows_pull_toward_baseline() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([1.0, 2.0]);
    let b = sketch.add_point([4.0, 6.0]);
    sketch.add_constraint(Constraint::Distance { points: [a, b], value: 5.0 });

    let (initial, index) = collect_variables(&sketch);
    let cfg = AssemblyConfig {
        tiers: TierSet::all(),
        weights: WeightProfile::default(),
        regularization: 0.5,
        smooth_penalties: true,
    };
    let problem = Problem::build(&sketch, &index, initial.clone(), &cfg).unwrap();

    assert_eq!(problem.total_len(), 1 + 4);

    // At the baseline the pull rows are zero.
    let at_baseline = problem.residuals(&initial);
    for i in 1..5 {
        assert!(at_baseline[i].abs() < 1e-12);
    }

    let mut moved = initial.clone();
    moved[0] += 2.0;
    let shifted = problem.residuals(&moved);
    assert!((shifted[1] - 0.5 * 2.0).abs() < 1e-12);
}

#[test]
fn test_tier_filter_skips_rows_but_still_validates_references() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 1.0]);
    sketch.add_constraint(Constraint::Coincident { points: [a, b] });
    sketch.add_constraint(Constraint::Distance { points: [a, b], value: 2.0 });

    let (initial, index) = collect_variables(&sketch);
    let cfg = AssemblyConfig {
        tiers: TierSet::of(&[PriorityTier::Critical]),
        weights: WeightProfile::uniform(1.0),
        regularization: 0.0,
        smooth_penalties: true,
    };
    let problem = Problem::build(&sketch, &index, initial, &cfg).unwrap();
    assert_eq!(problem.residual_len(), 2, "only the coincident rows remain");

    // A dangling reference in a filtered-out tier still fails assembly.
    let mut broken = Sketch::new();
    let p = broken.add_point([0.0, 0.0]);
    let ghost = crate::id::EntityId::new();
    broken.add_constraint(Constraint::Distance { points: [p, ghost], value: 1.0 });
    let (initial, index) = collect_variables(&broken);
    let result = Problem::build(&broken, &index, initial, &cfg);
    assert!(result.is_err());
}

#[test]
fn test_per_constraint_error_reports_worst_row() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([3.0, 1.0]);
    let id = sketch.add_constraint(Constraint::Coincident { points: [a, b] });

    let (initial, index) = collect_variables(&sketch);
    let problem = Problem::build(
        &sketch,
        &index,
        initial.clone(),
        &AssemblyConfig::standard(0.0, true),
    )
    .unwrap();
    let raw = problem.eval_raw(&initial);
    let errors = problem.per_constraint_error(&raw);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, id);
    assert_eq!(errors[0].1, PriorityTier::Critical);
    assert!((errors[0].2 - 3.0).abs() < 1e-12);
}

#[test]
fn test_suppressed_constraints_are_not_assembled() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 1.0]);
    let id = sketch.add_constraint(Constraint::Coincident { points: [a, b] });
    sketch.set_constraint_suppression(id, true);

    let (initial, index) = collect_variables(&sketch);
    let problem = Problem::build(
        &sketch,
        &index,
        initial,
        &AssemblyConfig::standard(0.0, true),
    )
    .unwrap();
    assert_eq!(problem.residual_len(), 0);
}

#[test]
fn test_wrong_geometry_is_a_typed_error() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 0.0]);
    let line = sketch.add_line(a, b);
    // A line where a point is required.
    sketch.add_constraint(Constraint::Fixed { point: line, position: [0.0, 0.0] });

    let (initial, index) = collect_variables(&sketch);
    let result = Problem::build(
        &sketch,
        &index,
        initial,
        &AssemblyConfig::standard(0.0, true),
    );
    assert!(result.is_err());
}

#[test]
fn test_assembly_config_standard_includes_all_tiers() {
    let mut sketch = Sketch::new();
    let a = sketch.add_point([0.0, 0.0]);
    let b = sketch.add_point([1.0, 1.0]);
    let l = sketch.add_line(a, b);
    sketch.add_constraint(Constraint::Coincident { points: [a, b] });
    sketch.add_constraint(Constraint::Horizontal { line: l });
    sketch.add_constraint(Constraint::Parallel { lines: [l, l] });
    sketch.add_constraint(Constraint::Length { line: l, value: 1.0 });

    let problem = assemble(&sketch, &AssemblyConfig::standard(0.0, true));
    assert_eq!(problem.residual_len(), 2 + 1 + 1 + 1);
}
