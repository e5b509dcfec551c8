//! Newton-CG trust-region minimization.
//!
//! Each iteration approximately minimizes the quadratic model
//! `m(p) = f + g.p + 0.5 p^T H p` inside a ball of radius `delta` with the
//! Steihaug-Toint truncated conjugate gradient method, then grows or shrinks
//! the ball from the ratio of actual to predicted reduction:
//!
//! - `rho < 0.25`: `delta <- delta / 4`
//! - `rho > 0.75` and the step reached the boundary: `delta <- min(2 delta, max)`
//! - the step is accepted when `rho > eta`.
//!
//! Convergence is declared when `||g||_inf` drops below the configured
//! tolerance. Failing to converge is reported through [`SolveStatus`], never
//! as a panic.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::TrustRegionConfig;
use crate::error::Result;
use crate::hyperdual::HyperDual;

/// Objective value with its exact gradient and Hessian at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: f64,
    pub gradient: DVector<f64>,
    pub hessian: DMatrix<f64>,
}

impl From<HyperDual> for Evaluation {
    fn from(h: HyperDual) -> Self {
        Self {
            value: h.value,
            gradient: h.gradient,
            hessian: h.hessian,
        }
    }
}

impl Evaluation {
    fn is_finite(&self) -> bool {
        self.value.is_finite()
            && self.gradient.iter().all(|g| g.is_finite())
            && self.hessian.iter().all(|h| h.is_finite())
    }
}

/// A twice-differentiable scalar function of `dimension()` unknowns.
pub trait Objective {
    fn dimension(&self) -> usize;
    fn evaluate(&mut self, x: &DVector<f64>) -> Result<Evaluation>;
}

/// Terminal state of a minimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Gradient infinity norm below tolerance.
    Converged,
    /// Iteration limit hit first.
    MaxIterationsReached,
    /// The quadratic model stopped predicting a decrease.
    BadApproximation,
    /// The objective or its derivatives became NaN or infinite.
    NonFinite,
}

#[derive(Debug, Clone)]
pub struct TrustRegionReport {
    pub status: SolveStatus,
    /// Last accepted point. Only meaningful when `status` is `Converged`.
    pub x: DVector<f64>,
    pub objective: f64,
    pub gradient_norm: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

impl TrustRegionReport {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }
}

/// Minimize `objective` starting from `x0`.
#[instrument(skip(objective, x0, config), fields(n = x0.len()))]
pub fn minimize<O: Objective>(
    objective: &mut O,
    x0: DVector<f64>,
    config: &TrustRegionConfig,
) -> Result<TrustRegionReport> {
    let n = x0.len();
    let mut x = x0;
    let mut current = objective.evaluate(&x)?;
    let mut evaluations = 1;

    if n == 0 {
        return Ok(TrustRegionReport {
            status: SolveStatus::Converged,
            x,
            objective: current.value,
            gradient_norm: 0.0,
            iterations: 0,
            evaluations,
        });
    }

    let limit = config.iteration_limit(n);
    let mut radius = config.initial_radius;
    let mut iterations = 0;

    let status = loop {
        if !current.is_finite() {
            break SolveStatus::NonFinite;
        }
        let gradient_norm = current.gradient.amax();
        if gradient_norm < config.gradient_tolerance {
            break SolveStatus::Converged;
        }
        if iterations >= limit {
            break SolveStatus::MaxIterationsReached;
        }
        if radius <= f64::EPSILON * (1.0 + x.norm()) {
            break SolveStatus::BadApproximation;
        }

        let step = steihaug_step(&current.gradient, &current.hessian, radius);
        let predicted_reduction = -model_change(&current.gradient, &current.hessian, &step.p);
        if predicted_reduction <= 0.0 {
            break SolveStatus::BadApproximation;
        }

        let trial_x = &x + &step.p;
        let trial = objective.evaluate(&trial_x)?;
        evaluations += 1;

        let rho = if trial.value.is_finite() {
            (current.value - trial.value) / predicted_reduction
        } else {
            f64::NEG_INFINITY
        };

        if rho < 0.25 {
            radius *= 0.25;
        } else if rho > 0.75 && step.hits_boundary {
            radius = (2.0 * radius).min(config.max_radius);
        }

        if rho > config.eta {
            x = trial_x;
            current = trial;
        }
        iterations += 1;

        debug!(
            iteration = iterations,
            objective = current.value,
            gradient_norm,
            radius,
            rho,
            "trust-region step"
        );
    };

    let gradient_norm = current.gradient.amax();
    if status != SolveStatus::Converged {
        warn!(?status, iterations, gradient_norm, "trust-region solve stopped early");
    }

    Ok(TrustRegionReport {
        status,
        x,
        objective: current.value,
        gradient_norm,
        iterations,
        evaluations,
    })
}

#[derive(Debug)]
struct Step {
    p: DVector<f64>,
    hits_boundary: bool,
}

/// `m(p) - f = g.p + 0.5 p^T H p`.
fn model_change(g: &DVector<f64>, h: &DMatrix<f64>, p: &DVector<f64>) -> f64 {
    g.dot(p) + 0.5 * p.dot(&(h * p))
}

/// Values `ta <= tb` with `||z + t d|| = radius`.
fn boundary_intersections(z: &DVector<f64>, d: &DVector<f64>, radius: f64) -> (f64, f64) {
    let a = d.dot(d);
    let b = 2.0 * z.dot(d);
    let c = z.dot(z) - radius * radius;
    let sqrt_discriminant = (b * b - 4.0 * a * c).max(0.0).sqrt();
    // Numerically stable roots of a t^2 + b t + c.
    let aux = b + sqrt_discriminant.copysign(b);
    let ta = -aux / (2.0 * a);
    let tb = -2.0 * c / aux;
    if ta <= tb { (ta, tb) } else { (tb, ta) }
}

/// Steihaug-Toint truncated CG on the trust-region subproblem.
fn steihaug_step(g: &DVector<f64>, h: &DMatrix<f64>, radius: f64) -> Step {
    let n = g.len();
    let mut z = DVector::zeros(n);
    let g_norm = g.norm();
    let tolerance = 0.5f64.min(g_norm.sqrt()) * g_norm;
    if g_norm < tolerance {
        return Step {
            p: z,
            hits_boundary: false,
        };
    }

    let mut r = g.clone();
    let mut d = -g;
    let max_cg = 2 * n + 10;

    for _ in 0..max_cg {
        let bd = h * &d;
        let curvature = d.dot(&bd);
        if curvature <= 0.0 {
            // Negative curvature: go to whichever boundary point has lower model value.
            let (ta, tb) = boundary_intersections(&z, &d, radius);
            let pa = &z + &d * ta;
            let pb = &z + &d * tb;
            let p = if model_change(g, h, &pa) < model_change(g, h, &pb) {
                pa
            } else {
                pb
            };
            return Step {
                p,
                hits_boundary: true,
            };
        }

        let r_sq = r.dot(&r);
        let alpha = r_sq / curvature;
        let z_next = &z + &d * alpha;
        if z_next.norm() >= radius {
            let (_, tb) = boundary_intersections(&z, &d, radius);
            return Step {
                p: &z + &d * tb,
                hits_boundary: true,
            };
        }

        let r_next = &r + &bd * alpha;
        let r_next_sq = r_next.dot(&r_next);
        if r_next_sq.sqrt() < tolerance {
            return Step {
                p: z_next,
                hits_boundary: false,
            };
        }

        let beta = r_next_sq / r_sq;
        d = -&r_next + &d * beta;
        z = z_next;
        r = r_next;
    }

    Step {
        p: z,
        hits_boundary: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Objective from a closure returning `(f, g, H)`.
    struct FnObjective<F> {
        n: usize,
        f: F,
    }

    impl<F> Objective for FnObjective<F>
    where
        F: FnMut(&DVector<f64>) -> Evaluation,
    {
        fn dimension(&self) -> usize {
            self.n
        }

        fn evaluate(&mut self, x: &DVector<f64>) -> Result<Evaluation> {
            Ok((self.f)(x))
        }
    }

    fn rosenbrock(x: &DVector<f64>) -> Evaluation {
        let (a, b) = (x[0], x[1]);
        let value = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let gradient = DVector::from_vec(vec![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a),
        ]);
        let hessian = DMatrix::from_row_slice(
            2,
            2,
            &[
                2.0 - 400.0 * b + 1200.0 * a * a,
                -400.0 * a,
                -400.0 * a,
                200.0,
            ],
        );
        Evaluation {
            value,
            gradient,
            hessian,
        }
    }

    #[test]
    fn test_rosenbrock_converges() {
        let mut objective = FnObjective { n: 2, f: rosenbrock };
        let x0 = DVector::from_vec(vec![-1.2, 1.0]);
        let report = minimize(&mut objective, x0, &TrustRegionConfig::default()).unwrap();
        assert_eq!(report.status, SolveStatus::Converged);
        assert_abs_diff_eq!(report.x[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(report.x[1], 1.0, epsilon = 1e-6);
        assert!(report.gradient_norm < 1e-8);
    }

    #[test]
    fn test_quadratic_far_from_start() {
        // f = sum (x_i - 50 i)^2; the radius has to grow to get there.
        let target = DVector::from_vec(vec![0.0, 50.0, 100.0]);
        let t = target.clone();
        let mut objective = FnObjective {
            n: 3,
            f: move |x: &DVector<f64>| {
                let diff = x - &t;
                Evaluation {
                    value: diff.dot(&diff),
                    gradient: &diff * 2.0,
                    hessian: DMatrix::identity(3, 3) * 2.0,
                }
            },
        };
        let report =
            minimize(&mut objective, DVector::zeros(3), &TrustRegionConfig::default()).unwrap();
        assert!(report.converged());
        for i in 0..3 {
            assert_abs_diff_eq!(report.x[i], target[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_empty_problem_is_a_no_op() {
        let mut objective = FnObjective {
            n: 0,
            f: |_: &DVector<f64>| Evaluation {
                value: 0.0,
                gradient: DVector::zeros(0),
                hessian: DMatrix::zeros(0, 0),
            },
        };
        let report =
            minimize(&mut objective, DVector::zeros(0), &TrustRegionConfig::default()).unwrap();
        assert!(report.converged());
        assert_eq!(report.iterations, 0);
        assert_eq!(report.x.len(), 0);
    }

    #[test]
    fn test_iteration_limit_is_a_status() {
        let mut objective = FnObjective { n: 2, f: rosenbrock };
        let config = TrustRegionConfig {
            max_iterations: Some(2),
            ..TrustRegionConfig::default()
        };
        let report =
            minimize(&mut objective, DVector::from_vec(vec![-1.2, 1.0]), &config).unwrap();
        assert_eq!(report.status, SolveStatus::MaxIterationsReached);
        assert_eq!(report.iterations, 2);
    }

    #[test]
    fn test_non_finite_objective_is_a_status() {
        let mut objective = FnObjective {
            n: 1,
            f: |_: &DVector<f64>| Evaluation {
                value: f64::NAN,
                gradient: DVector::from_element(1, 1.0),
                hessian: DMatrix::identity(1, 1),
            },
        };
        let report =
            minimize(&mut objective, DVector::zeros(1), &TrustRegionConfig::default()).unwrap();
        assert_eq!(report.status, SolveStatus::NonFinite);
    }

    #[test]
    fn test_steihaug_follows_negative_curvature_to_boundary() {
        let g = DVector::from_vec(vec![1.0, 0.0]);
        let h = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, 1.0]);
        let step = steihaug_step(&g, &h, 0.5);
        assert!(step.hits_boundary);
        assert_abs_diff_eq!(step.p.norm(), 0.5, epsilon = 1e-12);
        assert!(step.p[0] < 0.0);
    }

    #[test]
    fn test_steihaug_interior_newton_step() {
        let g = DVector::from_vec(vec![2.0, -4.0]);
        let h = DMatrix::identity(2, 2) * 2.0;
        let step = steihaug_step(&g, &h, 10.0);
        assert!(!step.hits_boundary);
        assert_abs_diff_eq!(step.p[0], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(step.p[1], 2.0, epsilon = 1e-12);
    }
}
