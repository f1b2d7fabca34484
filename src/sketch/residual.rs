use nalgebra::DVector;
use std::collections::HashMap;
use thiserror::Error;

use crate::id::{ConstraintId, EntityId};

use super::constraints::{Constraint, PriorityTier};
use super::types::{Sketch, SketchGeometry};
use super::variables::{EntitySlots, VariableIndex};

/// Contract violations. These signal a caller bug and are the only hard
/// failures in the crate; every expected solve outcome is a typed result.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("constraint {constraint} references unknown entity {entity}")]
    UnknownEntity {
        constraint: ConstraintId,
        entity: EntityId,
    },
    #[error("constraint {constraint} expects {expected} for entity {entity}, got {actual}")]
    WrongGeometry {
        constraint: ConstraintId,
        entity: EntityId,
        expected: &'static str,
        actual: &'static str,
    },
}

const LEN_GUARD: f64 = 1e-12;
/// Sharpness of the softplus barrier on the tangency foot parameter.
const BARRIER_SHARPNESS: f64 = 0.05;

/// Tier weights applied to residual rows. Critical ≫ High ≫ Medium ≫ Low so
/// least-squares minimization favors higher tiers when the system is
/// inconsistent.
#[derive(Debug, Clone, Copy)]
pub struct WeightProfile {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for WeightProfile {
    fn default() -> Self {
        Self {
            critical: 1e3,
            high: 1e2,
            medium: 1e1,
            low: 1.0,
        }
    }
}

impl WeightProfile {
    pub fn uniform(w: f64) -> Self {
        Self {
            critical: w,
            high: w,
            medium: w,
            low: w,
        }
    }

    pub fn weight(&self, tier: PriorityTier) -> f64 {
        match tier {
            PriorityTier::Critical => self.critical,
            PriorityTier::High => self.high,
            PriorityTier::Medium => self.medium,
            PriorityTier::Low => self.low,
        }
    }
}

/// Subset of priority tiers included in an assembly, one bit per tier.
#[derive(Debug, Clone, Copy)]
pub struct TierSet(u8);

impl TierSet {
    pub fn all() -> Self {
        Self::of(&PriorityTier::ALL)
    }

    pub fn of(tiers: &[PriorityTier]) -> Self {
        let mut bits = 0u8;
        for tier in tiers {
            bits |= 1 << Self::bit(*tier);
        }
        Self(bits)
    }

    pub fn contains(self, tier: PriorityTier) -> bool {
        self.0 & (1 << Self::bit(tier)) != 0
    }

    fn bit(tier: PriorityTier) -> u8 {
        match tier {
            PriorityTier::Critical => 0,
            PriorityTier::High => 1,
            PriorityTier::Medium => 2,
            PriorityTier::Low => 3,
        }
    }
}

/// How a `Problem` is assembled from a sketch. Backends restrict tiers and
/// override weights per solve phase; the orchestrator assembles with defaults.
#[derive(Debug, Clone, Copy)]
pub struct AssemblyConfig {
    pub tiers: TierSet,
    pub weights: WeightProfile,
    /// Pull strength of each free variable toward its baseline value. This is
    /// the spring-back knob; it is never hard-coded by backends.
    pub regularization: f64,
    pub smooth_penalties: bool,
}

impl AssemblyConfig {
    pub fn standard(regularization: f64, smooth_penalties: bool) -> Self {
        Self {
            tiers: TierSet::all(),
            weights: WeightProfile::default(),
            regularization,
            smooth_penalties,
        }
    }
}

/// A point reference resolved against the variable index: either two offsets
/// into the variable vector or the pinned coordinates of a fixed point.
#[derive(Debug, Clone, Copy)]
pub enum Anchor {
    Free { x: usize, y: usize },
    Pinned { pos: [f64; 2] },
}

impl Anchor {
    #[inline]
    pub fn eval(&self, v: &DVector<f64>) -> [f64; 2] {
        match *self {
            Anchor::Free { x, y } => [v[x], v[y]],
            Anchor::Pinned { pos } => pos,
        }
    }

    fn collect(&self, out: &mut Vec<usize>) {
        if let Anchor::Free { x, y } = *self {
            out.push(x);
            out.push(y);
        }
    }
}

/// One constraint compiled against the variable index. Evaluation is
/// infallible; all reference errors are caught at assembly time.
#[derive(Debug, Clone)]
pub enum ResidualExpr {
    Fixed { point: Anchor, target: [f64; 2] },
    Coincident { a: Anchor, b: Anchor },
    PointOnLine { p: Anchor, a: Anchor, b: Anchor },
    PointOnCircle { p: Anchor, center: Anchor, radius: usize },
    Midpoint { p: Anchor, a: Anchor, b: Anchor },
    Collinear { a1: Anchor, b1: Anchor, a2: Anchor, b2: Anchor },
    Concentric { c1: Anchor, c2: Anchor },
    Parallel { a1: Anchor, b1: Anchor, a2: Anchor, b2: Anchor },
    Perpendicular { a1: Anchor, b1: Anchor, a2: Anchor, b2: Anchor },
    Tangent { a: Anchor, b: Anchor, center: Anchor, radius: usize },
    EqualLength { a1: Anchor, b1: Anchor, a2: Anchor, b2: Anchor },
    EqualRadius { r1: usize, r2: usize },
    Symmetric { p: Anchor, q: Anchor, a: Anchor, b: Anchor },
    Horizontal { a: Anchor, b: Anchor },
    Vertical { a: Anchor, b: Anchor },
    Distance { a: Anchor, b: Anchor, value: f64 },
    Length { a: Anchor, b: Anchor, value: f64 },
    Angle { a1: Anchor, b1: Anchor, a2: Anchor, b2: Anchor, value: f64 },
    Radius { radius: usize, value: f64 },
    Diameter { radius: usize, value: f64 },
}

impl ResidualExpr {
    /// Writes this expression's residual rows into `out`. Every formulation is
    /// smooth in the variables; hard in-range branches are replaced by the
    /// softplus barrier so gradients stay usable for unrelated constraints.
    fn eval(&self, v: &DVector<f64>, out: &mut [f64], smooth: bool) {
        match *self {
            ResidualExpr::Fixed { point, target } => {
                let p = point.eval(v);
                out[0] = p[0] - target[0];
                out[1] = p[1] - target[1];
            }
            ResidualExpr::Coincident { a, b } => {
                let pa = a.eval(v);
                let pb = b.eval(v);
                out[0] = pa[0] - pb[0];
                out[1] = pa[1] - pb[1];
            }
            ResidualExpr::PointOnLine { p, a, b } => {
                let pp = p.eval(v);
                let pa = a.eval(v);
                let pb = b.eval(v);
                let d = [pb[0] - pa[0], pb[1] - pa[1]];
                let len = hypot(d).max(LEN_GUARD);
                out[0] = cross(d, [pp[0] - pa[0], pp[1] - pa[1]]) / len;
            }
            ResidualExpr::PointOnCircle { p, center, radius } => {
                let pp = p.eval(v);
                let c = center.eval(v);
                out[0] = hypot([pp[0] - c[0], pp[1] - c[1]]) - v[radius];
            }
            ResidualExpr::Midpoint { p, a, b } => {
                let pp = p.eval(v);
                let pa = a.eval(v);
                let pb = b.eval(v);
                out[0] = pp[0] - 0.5 * (pa[0] + pb[0]);
                out[1] = pp[1] - 0.5 * (pa[1] + pb[1]);
            }
            ResidualExpr::Collinear { a1, b1, a2, b2 } => {
                let pa1 = a1.eval(v);
                let pb1 = b1.eval(v);
                let pa2 = a2.eval(v);
                let d1 = [pb1[0] - pa1[0], pb1[1] - pa1[1]];
                let d2 = {
                    let pb2 = b2.eval(v);
                    [pb2[0] - pa2[0], pb2[1] - pa2[1]]
                };
                let l1 = hypot(d1).max(LEN_GUARD);
                let l2 = hypot(d2).max(LEN_GUARD);
                out[0] = cross(d1, d2) / (l1 * l2);
                out[1] = cross(d1, [pa2[0] - pa1[0], pa2[1] - pa1[1]]) / l1;
            }
            ResidualExpr::Concentric { c1, c2 } => {
                let p1 = c1.eval(v);
                let p2 = c2.eval(v);
                out[0] = p1[0] - p2[0];
                out[1] = p1[1] - p2[1];
            }
            ResidualExpr::Parallel { a1, b1, a2, b2 } => {
                let (d1, d2) = directions(v, a1, b1, a2, b2);
                let l1 = hypot(d1).max(LEN_GUARD);
                let l2 = hypot(d2).max(LEN_GUARD);
                out[0] = cross(d1, d2) / (l1 * l2);
            }
            ResidualExpr::Perpendicular { a1, b1, a2, b2 } => {
                let (d1, d2) = directions(v, a1, b1, a2, b2);
                let l1 = hypot(d1).max(LEN_GUARD);
                let l2 = hypot(d2).max(LEN_GUARD);
                out[0] = dot(d1, d2) / (l1 * l2);
            }
            ResidualExpr::Tangent { a, b, center, radius } => {
                let pa = a.eval(v);
                let pb = b.eval(v);
                let c = center.eval(v);
                let d = [pb[0] - pa[0], pb[1] - pa[1]];
                let len = hypot(d).max(LEN_GUARD);
                let to_c = [c[0] - pa[0], c[1] - pa[1]];
                let signed = cross(d, to_c) / len;
                let mut r = smooth_abs(signed) - v[radius];
                if smooth {
                    // Keep the foot of the perpendicular inside the segment
                    // via a smooth ramp instead of a hard in-range branch.
                    let t = dot(to_c, d) / (len * len);
                    r += softplus(-t) + softplus(t - 1.0);
                }
                out[0] = r;
            }
            ResidualExpr::EqualLength { a1, b1, a2, b2 } => {
                let (d1, d2) = directions(v, a1, b1, a2, b2);
                out[0] = hypot(d1) - hypot(d2);
            }
            ResidualExpr::EqualRadius { r1, r2 } => {
                out[0] = v[r1] - v[r2];
            }
            ResidualExpr::Symmetric { p, q, a, b } => {
                let pp = p.eval(v);
                let pq = q.eval(v);
                let pa = a.eval(v);
                let pb = b.eval(v);
                let d = [pb[0] - pa[0], pb[1] - pa[1]];
                let len_sq = dot(d, d).max(LEN_GUARD);
                let t = dot([pp[0] - pa[0], pp[1] - pa[1]], d) / len_sq;
                let foot = [pa[0] + t * d[0], pa[1] + t * d[1]];
                let refl = [2.0 * foot[0] - pp[0], 2.0 * foot[1] - pp[1]];
                out[0] = refl[0] - pq[0];
                out[1] = refl[1] - pq[1];
            }
            ResidualExpr::Horizontal { a, b } => {
                out[0] = a.eval(v)[1] - b.eval(v)[1];
            }
            ResidualExpr::Vertical { a, b } => {
                out[0] = a.eval(v)[0] - b.eval(v)[0];
            }
            ResidualExpr::Distance { a, b, value } => {
                let pa = a.eval(v);
                let pb = b.eval(v);
                out[0] = hypot([pb[0] - pa[0], pb[1] - pa[1]]) - value;
            }
            ResidualExpr::Length { a, b, value } => {
                let pa = a.eval(v);
                let pb = b.eval(v);
                out[0] = hypot([pb[0] - pa[0], pb[1] - pa[1]]) - value;
            }
            ResidualExpr::Angle { a1, b1, a2, b2, value } => {
                let (d1, d2) = directions(v, a1, b1, a2, b2);
                let angle = cross(d1, d2).atan2(dot(d1, d2));
                out[0] = wrap_angle(angle - value);
            }
            ResidualExpr::Radius { radius, value } => {
                out[0] = v[radius] - value;
            }
            ResidualExpr::Diameter { radius, value } => {
                out[0] = 2.0 * v[radius] - value;
            }
        }
    }

    /// Free variable offsets this expression reads.
    fn variables(&self, out: &mut Vec<usize>) {
        match *self {
            ResidualExpr::Fixed { point, .. } => point.collect(out),
            ResidualExpr::Coincident { a, b }
            | ResidualExpr::Concentric { c1: a, c2: b }
            | ResidualExpr::Horizontal { a, b }
            | ResidualExpr::Vertical { a, b } => {
                a.collect(out);
                b.collect(out);
            }
            ResidualExpr::PointOnLine { p, a, b } | ResidualExpr::Midpoint { p, a, b } => {
                p.collect(out);
                a.collect(out);
                b.collect(out);
            }
            ResidualExpr::PointOnCircle { p, center, radius } => {
                p.collect(out);
                center.collect(out);
                out.push(radius);
            }
            ResidualExpr::Collinear { a1, b1, a2, b2 }
            | ResidualExpr::Parallel { a1, b1, a2, b2 }
            | ResidualExpr::Perpendicular { a1, b1, a2, b2 }
            | ResidualExpr::EqualLength { a1, b1, a2, b2 }
            | ResidualExpr::Angle { a1, b1, a2, b2, .. } => {
                a1.collect(out);
                b1.collect(out);
                a2.collect(out);
                b2.collect(out);
            }
            ResidualExpr::Tangent { a, b, center, radius } => {
                a.collect(out);
                b.collect(out);
                center.collect(out);
                out.push(radius);
            }
            ResidualExpr::EqualRadius { r1, r2 } => {
                out.push(r1);
                out.push(r2);
            }
            ResidualExpr::Symmetric { p, q, a, b } => {
                p.collect(out);
                q.collect(out);
                a.collect(out);
                b.collect(out);
            }
            ResidualExpr::Distance { a, b, .. } | ResidualExpr::Length { a, b, .. } => {
                a.collect(out);
                b.collect(out);
            }
            ResidualExpr::Radius { radius, .. } | ResidualExpr::Diameter { radius, .. } => {
                out.push(radius);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Row {
    offset: usize,
    dim: usize,
    constraint: ConstraintId,
    tier: PriorityTier,
    weight: f64,
    expr: ResidualExpr,
    batched: bool,
}

/// Vectorized fast paths for the common kinds: one gather pass per kind,
/// important once sketches carry hundreds of constraints.
#[derive(Debug, Clone, Default)]
struct Batches {
    coincident: Vec<(usize, Anchor, Anchor)>,
    horizontal: Vec<(usize, Anchor, Anchor)>,
    vertical: Vec<(usize, Anchor, Anchor)>,
    length: Vec<(usize, Anchor, Anchor, f64)>,
    equal_length: Vec<(usize, [Anchor; 4])>,
    radius: Vec<(usize, usize, f64)>,
}

/// The assembled minimization problem: weighted residual rows over a local
/// variable vector plus optional regularization rows pulling free variables
/// toward the pre-solve baseline.
#[derive(Debug, Clone)]
pub struct Problem {
    rows: Vec<Row>,
    batches: Batches,
    var_len: usize,
    residual_len: usize,
    regularization: f64,
    baseline: DVector<f64>,
    smooth_penalties: bool,
}

impl Problem {
    pub fn build(
        sketch: &Sketch,
        index: &VariableIndex,
        baseline: DVector<f64>,
        cfg: &AssemblyConfig,
    ) -> Result<Problem, ModelError> {
        let mut problem = Problem {
            rows: Vec::new(),
            batches: Batches::default(),
            var_len: index.len(),
            residual_len: 0,
            regularization: cfg.regularization,
            baseline,
            smooth_penalties: cfg.smooth_penalties,
        };

        for (cid, constraint) in sketch.active_constraints() {
            // Resolve before tier filtering so contract violations surface no
            // matter which phase is being assembled.
            let expr = compile(sketch, index, cid, constraint)?;
            let tier = constraint.tier();
            if !cfg.tiers.contains(tier) {
                continue;
            }
            problem.push(cid, tier, cfg.weights.weight(tier), constraint.residual_dim(), expr);
        }

        Ok(problem)
    }

    fn push(
        &mut self,
        constraint: ConstraintId,
        tier: PriorityTier,
        weight: f64,
        dim: usize,
        expr: ResidualExpr,
    ) {
        let offset = self.residual_len;
        self.residual_len += dim;
        let batched = match &expr {
            ResidualExpr::Coincident { a, b } => {
                self.batches.coincident.push((offset, *a, *b));
                true
            }
            ResidualExpr::Horizontal { a, b } => {
                self.batches.horizontal.push((offset, *a, *b));
                true
            }
            ResidualExpr::Vertical { a, b } => {
                self.batches.vertical.push((offset, *a, *b));
                true
            }
            ResidualExpr::Length { a, b, value } => {
                self.batches.length.push((offset, *a, *b, *value));
                true
            }
            ResidualExpr::EqualLength { a1, b1, a2, b2 } => {
                self.batches.equal_length.push((offset, [*a1, *b1, *a2, *b2]));
                true
            }
            ResidualExpr::Radius { radius, value } => {
                self.batches.radius.push((offset, *radius, *value));
                true
            }
            _ => false,
        };
        self.rows.push(Row {
            offset,
            dim,
            constraint,
            tier,
            weight,
            expr,
            batched,
        });
    }

    pub fn var_len(&self) -> usize {
        self.var_len
    }

    pub fn residual_len(&self) -> usize {
        self.residual_len
    }

    fn reg_len(&self) -> usize {
        if self.regularization > 0.0 {
            self.var_len
        } else {
            0
        }
    }

    pub fn total_len(&self) -> usize {
        self.residual_len + self.reg_len()
    }

    pub fn baseline(&self) -> &DVector<f64> {
        &self.baseline
    }

    /// Unweighted constraint residuals: zero exactly when satisfied.
    pub fn eval_raw(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = DVector::zeros(self.residual_len);
        let buf = out.as_mut_slice();

        for &(offset, a, b) in &self.batches.coincident {
            let pa = a.eval(v);
            let pb = b.eval(v);
            buf[offset] = pa[0] - pb[0];
            buf[offset + 1] = pa[1] - pb[1];
        }
        for &(offset, a, b) in &self.batches.horizontal {
            buf[offset] = a.eval(v)[1] - b.eval(v)[1];
        }
        for &(offset, a, b) in &self.batches.vertical {
            buf[offset] = a.eval(v)[0] - b.eval(v)[0];
        }
        for &(offset, a, b, value) in &self.batches.length {
            let pa = a.eval(v);
            let pb = b.eval(v);
            buf[offset] = hypot([pb[0] - pa[0], pb[1] - pa[1]]) - value;
        }
        for &(offset, [a1, b1, a2, b2]) in &self.batches.equal_length {
            let (d1, d2) = directions(v, a1, b1, a2, b2);
            buf[offset] = hypot(d1) - hypot(d2);
        }
        for &(offset, radius, value) in &self.batches.radius {
            buf[offset] = v[radius] - value;
        }

        for row in &self.rows {
            if row.batched {
                continue;
            }
            row.expr
                .eval(v, &mut buf[row.offset..row.offset + row.dim], self.smooth_penalties);
        }

        out
    }

    /// What backends minimize: tier-weighted constraint residuals followed by
    /// regularization rows toward the baseline.
    pub fn residuals(&self, v: &DVector<f64>) -> DVector<f64> {
        let raw = self.eval_raw(v);
        let mut out = DVector::zeros(self.total_len());
        for row in &self.rows {
            for k in 0..row.dim {
                out[row.offset + k] = row.weight * raw[row.offset + k];
            }
        }
        if self.regularization > 0.0 {
            for j in 0..self.var_len {
                out[self.residual_len + j] = self.regularization * (v[j] - self.baseline[j]);
            }
        }
        out
    }

    /// Weighted norm over constraint rows only (regularization excluded);
    /// this is the quantity the success criterion bounds.
    pub fn weighted_norm(&self, raw: &DVector<f64>) -> f64 {
        let mut sum = 0.0;
        for row in &self.rows {
            for k in 0..row.dim {
                let r = row.weight * raw[row.offset + k];
                sum += r * r;
            }
        }
        sum.sqrt()
    }

    /// Largest single unweighted residual magnitude.
    pub fn max_abs(&self, raw: &DVector<f64>) -> f64 {
        if raw.is_empty() {
            0.0
        } else {
            raw.amax()
        }
    }

    /// Per-constraint maximum residual magnitude, in assembly order.
    pub fn per_constraint_error(&self, raw: &DVector<f64>) -> Vec<(ConstraintId, PriorityTier, f64)> {
        self.rows
            .iter()
            .map(|row| {
                let mut worst = 0.0f64;
                for k in 0..row.dim {
                    worst = worst.max(raw[row.offset + k].abs());
                }
                (row.constraint, row.tier, worst)
            })
            .collect()
    }

    /// Number of constraint rows touching each free variable.
    pub fn touched_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.var_len];
        let mut vars = Vec::new();
        for row in &self.rows {
            vars.clear();
            row.expr.variables(&mut vars);
            vars.sort_unstable();
            vars.dedup();
            for &offset in &vars {
                counts[offset] += row.dim;
            }
        }
        counts
    }

    /// Number of residual rows touching any variable of each entity.
    pub fn entity_row_counts(&self, index: &VariableIndex) -> HashMap<EntityId, usize> {
        let mut counts: HashMap<EntityId, usize> = HashMap::new();
        let mut vars = Vec::new();
        for row in &self.rows {
            vars.clear();
            row.expr.variables(&mut vars);
            let mut seen: Vec<EntityId> = Vec::new();
            for &offset in &vars {
                if let Some((entity, _)) = index.owner(offset) {
                    if !seen.contains(&entity) {
                        seen.push(entity);
                        *counts.entry(entity).or_insert(0) += row.dim;
                    }
                }
            }
        }
        counts
    }
}

// --- compilation ---------------------------------------------------------

fn compile(
    sketch: &Sketch,
    index: &VariableIndex,
    cid: ConstraintId,
    constraint: &Constraint,
) -> Result<ResidualExpr, ModelError> {
    Ok(match constraint {
        Constraint::Fixed { point, position } => ResidualExpr::Fixed {
            point: resolve_point(sketch, index, cid, *point)?,
            target: *position,
        },
        Constraint::Coincident { points } => ResidualExpr::Coincident {
            a: resolve_point(sketch, index, cid, points[0])?,
            b: resolve_point(sketch, index, cid, points[1])?,
        },
        Constraint::PointOnLine { point, line } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            ResidualExpr::PointOnLine {
                p: resolve_point(sketch, index, cid, *point)?,
                a,
                b,
            }
        }
        Constraint::PointOnCircle { point, circle } => {
            let (center, radius) = resolve_round(sketch, index, cid, *circle)?;
            ResidualExpr::PointOnCircle {
                p: resolve_point(sketch, index, cid, *point)?,
                center,
                radius,
            }
        }
        Constraint::Midpoint { point, line } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            ResidualExpr::Midpoint {
                p: resolve_point(sketch, index, cid, *point)?,
                a,
                b,
            }
        }
        Constraint::Collinear { lines } => {
            let (a1, b1) = resolve_line(sketch, index, cid, lines[0])?;
            let (a2, b2) = resolve_line(sketch, index, cid, lines[1])?;
            ResidualExpr::Collinear { a1, b1, a2, b2 }
        }
        Constraint::Concentric { entities } => {
            let (c1, _) = resolve_round(sketch, index, cid, entities[0])?;
            let (c2, _) = resolve_round(sketch, index, cid, entities[1])?;
            ResidualExpr::Concentric { c1, c2 }
        }
        Constraint::Parallel { lines } => {
            let (a1, b1) = resolve_line(sketch, index, cid, lines[0])?;
            let (a2, b2) = resolve_line(sketch, index, cid, lines[1])?;
            ResidualExpr::Parallel { a1, b1, a2, b2 }
        }
        Constraint::Perpendicular { lines } => {
            let (a1, b1) = resolve_line(sketch, index, cid, lines[0])?;
            let (a2, b2) = resolve_line(sketch, index, cid, lines[1])?;
            ResidualExpr::Perpendicular { a1, b1, a2, b2 }
        }
        Constraint::Tangent { line, circle } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            let (center, radius) = resolve_round(sketch, index, cid, *circle)?;
            ResidualExpr::Tangent { a, b, center, radius }
        }
        Constraint::EqualLength { lines } => {
            let (a1, b1) = resolve_line(sketch, index, cid, lines[0])?;
            let (a2, b2) = resolve_line(sketch, index, cid, lines[1])?;
            ResidualExpr::EqualLength { a1, b1, a2, b2 }
        }
        Constraint::EqualRadius { entities } => {
            let (_, r1) = resolve_round(sketch, index, cid, entities[0])?;
            let (_, r2) = resolve_round(sketch, index, cid, entities[1])?;
            ResidualExpr::EqualRadius { r1, r2 }
        }
        Constraint::Symmetric { points, axis } => {
            let (a, b) = resolve_line(sketch, index, cid, *axis)?;
            ResidualExpr::Symmetric {
                p: resolve_point(sketch, index, cid, points[0])?,
                q: resolve_point(sketch, index, cid, points[1])?,
                a,
                b,
            }
        }
        Constraint::Horizontal { line } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            ResidualExpr::Horizontal { a, b }
        }
        Constraint::Vertical { line } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            ResidualExpr::Vertical { a, b }
        }
        Constraint::Distance { points, value } => ResidualExpr::Distance {
            a: resolve_point(sketch, index, cid, points[0])?,
            b: resolve_point(sketch, index, cid, points[1])?,
            value: *value,
        },
        Constraint::Length { line, value } => {
            let (a, b) = resolve_line(sketch, index, cid, *line)?;
            ResidualExpr::Length { a, b, value: *value }
        }
        Constraint::Angle { lines, value } => {
            let (a1, b1) = resolve_line(sketch, index, cid, lines[0])?;
            let (a2, b2) = resolve_line(sketch, index, cid, lines[1])?;
            ResidualExpr::Angle { a1, b1, a2, b2, value: *value }
        }
        Constraint::Radius { entity, value } => {
            let (_, radius) = resolve_round(sketch, index, cid, *entity)?;
            ResidualExpr::Radius { radius, value: *value }
        }
        Constraint::Diameter { entity, value } => {
            let (_, radius) = resolve_round(sketch, index, cid, *entity)?;
            ResidualExpr::Diameter { radius, value: *value }
        }
    })
}

fn geometry<'a>(
    sketch: &'a Sketch,
    cid: ConstraintId,
    id: EntityId,
) -> Result<&'a SketchGeometry, ModelError> {
    sketch
        .entity(id)
        .map(|e| &e.geometry)
        .ok_or(ModelError::UnknownEntity {
            constraint: cid,
            entity: id,
        })
}

fn resolve_point(
    sketch: &Sketch,
    index: &VariableIndex,
    cid: ConstraintId,
    id: EntityId,
) -> Result<Anchor, ModelError> {
    match geometry(sketch, cid, id)? {
        SketchGeometry::Point { pos, fixed } => {
            if *fixed {
                return Ok(Anchor::Pinned { pos: *pos });
            }
            match index.slot(id) {
                Some(EntitySlots::Point { x, y }) => Ok(Anchor::Free { x, y }),
                // A free point always has a slot when the index was built
                // from the same sketch; treat a miss as a pinned snapshot.
                _ => Ok(Anchor::Pinned { pos: *pos }),
            }
        }
        other => Err(ModelError::WrongGeometry {
            constraint: cid,
            entity: id,
            expected: "Point",
            actual: other.kind_name(),
        }),
    }
}

fn resolve_line(
    sketch: &Sketch,
    index: &VariableIndex,
    cid: ConstraintId,
    id: EntityId,
) -> Result<(Anchor, Anchor), ModelError> {
    match geometry(sketch, cid, id)? {
        SketchGeometry::Line { start, end } => Ok((
            resolve_point(sketch, index, cid, *start)?,
            resolve_point(sketch, index, cid, *end)?,
        )),
        other => Err(ModelError::WrongGeometry {
            constraint: cid,
            entity: id,
            expected: "Line",
            actual: other.kind_name(),
        }),
    }
}

/// Circle or arc: center anchor plus radius variable offset.
fn resolve_round(
    sketch: &Sketch,
    index: &VariableIndex,
    cid: ConstraintId,
    id: EntityId,
) -> Result<(Anchor, usize), ModelError> {
    let geo = geometry(sketch, cid, id)?;
    let center = match geo {
        SketchGeometry::Circle { center, .. } | SketchGeometry::Arc { center, .. } => *center,
        other => {
            return Err(ModelError::WrongGeometry {
                constraint: cid,
                entity: id,
                expected: "Circle or Arc",
                actual: other.kind_name(),
            })
        }
    };
    let radius = match index.slot(id) {
        Some(EntitySlots::Circle { radius }) | Some(EntitySlots::Arc { radius, .. }) => radius,
        _ => {
            return Err(ModelError::UnknownEntity {
                constraint: cid,
                entity: id,
            })
        }
    };
    Ok((resolve_point(sketch, index, cid, center)?, radius))
}

// --- math helpers ---------------------------------------------------------

#[inline]
fn hypot(d: [f64; 2]) -> f64 {
    (d[0] * d[0] + d[1] * d[1]).sqrt()
}

#[inline]
fn cross(a: [f64; 2], b: [f64; 2]) -> f64 {
    a[0] * b[1] - a[1] * b[0]
}

#[inline]
fn dot(a: [f64; 2], b: [f64; 2]) -> f64 {
    a[0] * b[0] + a[1] * b[1]
}

#[inline]
fn directions(
    v: &DVector<f64>,
    a1: Anchor,
    b1: Anchor,
    a2: Anchor,
    b2: Anchor,
) -> ([f64; 2], [f64; 2]) {
    let pa1 = a1.eval(v);
    let pb1 = b1.eval(v);
    let pa2 = a2.eval(v);
    let pb2 = b2.eval(v);
    (
        [pb1[0] - pa1[0], pb1[1] - pa1[1]],
        [pb2[0] - pa2[0], pb2[1] - pa2[1]],
    )
}

/// Smooth |x|: differentiable at zero, indistinguishable from |x| away from it.
#[inline]
fn smooth_abs(x: f64) -> f64 {
    (x * x + 1e-16).sqrt()
}

/// Softplus ramp: ~0 for negative arguments, ~x for positive ones.
fn softplus(x: f64) -> f64 {
    let s = x / BARRIER_SHARPNESS;
    if s > 30.0 {
        x
    } else {
        BARRIER_SHARPNESS * s.exp().ln_1p()
    }
}

/// Wrap an angle delta into (-pi, pi].
pub(crate) fn wrap_angle(delta: f64) -> f64 {
    if delta > -std::f64::consts::PI && delta <= std::f64::consts::PI {
        delta
    } else {
        delta.sin().atan2(delta.cos())
    }
}
