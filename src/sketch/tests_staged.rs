use crate::sketch::constraints::Constraint;
use crate::sketch::solver::{
    solve, BackendKind, PriorityStaged, SolvePhase, SolveStatus, SolverBackend, SolverOptions,
};
use crate::sketch::types::{Sketch, SketchGeometry};
use crate::sketch::variables::{collect_variables, EntitySlots};

fn staged_options() -> SolverOptions {
    SolverOptions {
        backend: BackendKind::PriorityStaged,
        ..SolverOptions::default()
    }
}

#[test]
fn test_staged_solves_consistent_sketch() {
    let mut sketch = Sketch::new();
    let a = sketch.add_fixed_point([0.0, 0.0]);
    let b = sketch.add_point([3.0, 1.0]);
    let c = sketch.add_point([3.2, 0.9]);
    let line = sketch.add_line(a, b);
    sketch.add_constraint(Constraint::Coincident { points: [b, c] });
    sketch.add_constraint(Constraint::Horizontal { line });
    sketch.add_constraint(Constraint::Length { line, value: 8.0 });

    let result = solve(&mut sketch, &staged_options()).unwrap();
    assert_eq!(result.status, SolveStatus::Solved);
    assert_eq!(result.failing_phase, None);

    let b_pos = match &sketch.entity(b).unwrap().geometry {
        SketchGeometry::Point { pos, .. } => *pos,
        _ => panic!("expected point"),
    };
    assert!(b_pos[1].abs() < 1e-2, "line ends up horizontal");
    assert!((b_pos[0].abs() - 8.0).abs() < 1e-2, "line ends up 8 long");
}

#[test]
fn test_contradictory_relations_fail_in_high_phase() {
    let mut sketch = Sketch::new();
    let a = sketch.add_fixed_point([0.0, 0.0]);
    let b = sketch.add_point([10.0, 0.0]);
    let c = sketch.add_point([0.0, 10.0]);
    let d = sketch.add_point([10.0, 10.0]);
    let l1 = sketch.add_line(a, b);
    let l2 = sketch.add_line(c, d);
    sketch.add_constraint(Constraint::Fixed { point: b, position: [10.0, 0.0] });
    // No line pair can be both parallel and perpendicular.
    sketch.add_constraint(Constraint::Parallel { lines: [l1, l2] });
    sketch.add_constraint(Constraint::Perpendicular { lines: [l1, l2] });

    let before = sketch.entities.clone();
    let result = solve(&mut sketch, &staged_options()).unwrap();

    assert_eq!(result.status, SolveStatus::NotConverged);
    assert_eq!(result.failing_phase, Some(SolvePhase::High));
    assert_eq!(sketch.entities, before, "partial results are not written back");
}

#[test]
fn test_critical_wins_over_dimensional_pull() {
    let mut sketch = Sketch::new();
    let a = sketch.add_fixed_point([0.0, 0.0]);
    let b = sketch.add_fixed_point([10.0, 0.0]);
    let p = sketch.add_point([4.0, 1.0]);
    // Coincident with a pinned point at the origin, but a distance pulling
    // p five units away from b: only the coincidence can hold.
    sketch.add_constraint(Constraint::Coincident { points: [p, a] });
    sketch.add_constraint(Constraint::Distance { points: [p, b], value: 5.0 });

    let (initial, index) = collect_variables(&sketch);
    let outcome = PriorityStaged
        .solve(&sketch, &index, &initial, &SolverOptions::default())
        .unwrap();

    assert!(!outcome.converged, "the distance cannot be met");
    assert_eq!(outcome.failing_phase, Some(SolvePhase::Low));
    assert!(outcome.inconsistent.is_none(), "topology itself is feasible");

    // The committed values hold the coincidence exactly.
    let Some(EntitySlots::Point { x, y }) = index.slot(p) else {
        panic!("p should be free");
    };
    assert!(outcome.values[x].abs() < 1e-6);
    assert!(outcome.values[y].abs() < 1e-6);
}

#[test]
fn test_conflicting_pins_are_inconsistent_with_ids() {
    let mut sketch = Sketch::new();
    let p = sketch.add_point([1.0, 1.0]);
    let q = sketch.add_point([2.0, 2.0]);
    let pin_a = sketch.add_constraint(Constraint::Fixed { point: p, position: [0.0, 0.0] });
    let pin_b = sketch.add_constraint(Constraint::Fixed { point: q, position: [5.0, 0.0] });
    let tie = sketch.add_constraint(Constraint::Coincident { points: [p, q] });

    // Bypass pre-validation so the staged backend proves it structurally.
    let options = SolverOptions {
        backend: BackendKind::PriorityStaged,
        pre_validation: false,
        ..SolverOptions::default()
    };
    let before = sketch.entities.clone();
    let result = solve(&mut sketch, &options).unwrap();

    assert_eq!(result.status, SolveStatus::Inconsistent);
    assert_eq!(result.failing_phase, Some(SolvePhase::Critical));
    assert!(result.conflicting_constraint_ids.contains(&pin_a));
    assert!(result.conflicting_constraint_ids.contains(&pin_b));
    assert!(result.conflicting_constraint_ids.contains(&tie));
    assert_eq!(sketch.entities, before);
}

#[test]
fn test_coincident_group_collapses_to_average_without_pin() {
    let mut sketch = Sketch::new();
    let p = sketch.add_point([0.0, 0.0]);
    let q = sketch.add_point([4.0, 2.0]);
    sketch.add_constraint(Constraint::Coincident { points: [p, q] });

    let (initial, index) = collect_variables(&sketch);
    let outcome = PriorityStaged
        .solve(&sketch, &index, &initial, &SolverOptions::default())
        .unwrap();
    assert!(outcome.converged);

    let Some(EntitySlots::Point { x, y }) = index.slot(p) else {
        panic!("p should be free");
    };
    assert!((outcome.values[x] - 2.0).abs() < 1e-6, "meets at the midpoint");
    assert!((outcome.values[y] - 1.0).abs() < 1e-6);
}

#[test]
fn test_staged_solve_is_deterministic() {
    let build = || {
        let mut sketch = Sketch::new();
        let a = sketch.add_point([0.0, 0.1]);
        let b = sketch.add_point([9.7, -0.2]);
        let c = sketch.add_point([9.9, 0.3]);
        let d = sketch.add_point([10.2, 5.0]);
        let l1 = sketch.add_line(a, b);
        let l2 = sketch.add_line(c, d);
        sketch.add_constraint(Constraint::Fixed { point: a, position: [0.0, 0.0] });
        sketch.add_constraint(Constraint::Coincident { points: [b, c] });
        sketch.add_constraint(Constraint::Perpendicular { lines: [l1, l2] });
        sketch.add_constraint(Constraint::Length { line: l1, value: 10.0 });
        sketch
    };

    // Same geometry under fresh ids both times; the numeric trajectory must
    // not depend on id values or map iteration order.
    let run = |sketch: Sketch| {
        let (initial, index) = collect_variables(&sketch);
        let outcome = PriorityStaged
            .solve(&sketch, &index, &initial, &SolverOptions::default())
            .unwrap();
        (outcome.converged, outcome.values)
    };

    let (ok1, v1) = run(build());
    let (ok2, v2) = run(build());
    assert_eq!(ok1, ok2);
    assert_eq!(v1.len(), v2.len());
    for i in 0..v1.len() {
        assert!(
            v1[i].to_bits() == v2[i].to_bits(),
            "value {} differs: {} vs {}",
            i,
            v1[i],
            v2[i]
        );
    }
}
