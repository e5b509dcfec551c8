//! Quaternions over hyper-dual numbers.
//!
//! Components are stored as `(q0, q1, q2, q3) = (x, y, z, w)`. Rotation
//! quaternions are built from half-angle sin/cos and are never renormalized,
//! so the unit-norm property holds only by construction.

use std::ops::{Add, Mul, Sub};

use crate::hyperdual::HyperDual;
use crate::variable::Axis;

#[derive(Debug, Clone, PartialEq)]
pub struct HyperQuaternion {
    pub q0: HyperDual,
    pub q1: HyperDual,
    pub q2: HyperDual,
    pub q3: HyperDual,
}

impl HyperQuaternion {
    pub fn new(q0: HyperDual, q1: HyperDual, q2: HyperDual, q3: HyperDual) -> Self {
        Self { q0, q1, q2, q3 }
    }

    pub fn identity(n: usize) -> Self {
        Self::from_constants([0.0, 0.0, 0.0, 1.0], n)
    }

    pub fn from_constants(q: [f64; 4], n: usize) -> Self {
        Self {
            q0: HyperDual::constant(q[0], n),
            q1: HyperDual::constant(q[1], n),
            q2: HyperDual::constant(q[2], n),
            q3: HyperDual::constant(q[3], n),
        }
    }

    /// A pure quaternion `(x, y, z, 0)` holding a 3-vector.
    pub fn pure(x: HyperDual, y: HyperDual, z: HyperDual) -> Self {
        let n = x.dim();
        Self {
            q0: x,
            q1: y,
            q2: z,
            q3: HyperDual::zero(n),
        }
    }

    /// Rotation of `angle` radians about a global axis.
    pub fn from_axis_angle(axis: Axis, angle: &HyperDual) -> Self {
        let half = angle * 0.5;
        let s = half.sin();
        let c = half.cos();
        let zero = HyperDual::zero(angle.dim());
        match axis {
            Axis::X => Self::new(s, zero.clone(), zero, c),
            Axis::Y => Self::new(zero.clone(), s, zero, c),
            Axis::Z => Self::new(zero.clone(), zero, s, c),
        }
    }

    /// Constant rotation of `radians` about a global axis.
    pub fn from_axis_angle_f64(axis: Axis, radians: f64, n: usize) -> Self {
        Self::from_axis_angle(axis, &HyperDual::constant(radians, n))
    }

    /// Compose per-axis rotations in the fixed `z * y * x` Euler order.
    pub fn from_euler_parts(x: &Self, y: &Self, z: &Self) -> Self {
        &(z * y) * x
    }

    pub fn conjugate(&self) -> Self {
        Self {
            q0: -&self.q0,
            q1: -&self.q1,
            q2: -&self.q2,
            q3: self.q3.clone(),
        }
    }

    /// Inverse of a unit quaternion, which is its conjugate.
    pub fn inverse(&self) -> Self {
        self.conjugate()
    }

    pub fn component(&self, axis: Axis) -> &HyperDual {
        match axis {
            Axis::X => &self.q0,
            Axis::Y => &self.q1,
            Axis::Z => &self.q2,
        }
    }

    /// `|q|^2` including the scalar part.
    pub fn norm_squared(&self) -> HyperDual {
        self.q0.square() + self.q1.square() + self.q2.square() + self.q3.square()
    }

    /// Sum of the squared vector components.
    pub fn vector_norm_squared(&self) -> HyperDual {
        self.q0.square() + self.q1.square() + self.q2.square()
    }

    /// Rotate the vector part of `v` by this quaternion (`q v q*`).
    ///
    /// Closed form: `t = 2 (q x v)`, `v' = v + w t + q x t`. The scalar part
    /// of `v` passes through unchanged.
    pub fn rotate_vector(&self, v: &Self) -> Self {
        let q = self;
        let t = Self::pure(
            (&q.q1 * &v.q2 - &q.q2 * &v.q1) * 2.0,
            (&q.q2 * &v.q0 - &q.q0 * &v.q2) * 2.0,
            (&q.q0 * &v.q1 - &q.q1 * &v.q0) * 2.0,
        );
        let t2 = Self::pure(
            &q.q1 * &t.q2 - &q.q2 * &t.q1,
            &q.q2 * &t.q0 - &q.q0 * &t.q2,
            &q.q0 * &t.q1 - &q.q1 * &t.q0,
        );
        let t3 = Self::pure(&t.q0 * &q.q3, &t.q1 * &q.q3, &t.q2 * &q.q3);
        &(v + &t3) + &t2
    }

    pub fn values(&self) -> [f64; 4] {
        [self.q0.value, self.q1.value, self.q2.value, self.q3.value]
    }
}

fn hamilton(a: &HyperQuaternion, b: &HyperQuaternion) -> HyperQuaternion {
    HyperQuaternion {
        q0: &a.q3 * &b.q0 + &a.q0 * &b.q3 + &a.q1 * &b.q2 - &a.q2 * &b.q1,
        q1: &a.q3 * &b.q1 - &a.q0 * &b.q2 + &a.q1 * &b.q3 + &a.q2 * &b.q0,
        q2: &a.q3 * &b.q2 + &a.q0 * &b.q1 - &a.q1 * &b.q0 + &a.q2 * &b.q3,
        q3: &a.q3 * &b.q3 - &a.q0 * &b.q0 - &a.q1 * &b.q1 - &a.q2 * &b.q2,
    }
}

impl Mul for &HyperQuaternion {
    type Output = HyperQuaternion;
    fn mul(self, rhs: &HyperQuaternion) -> HyperQuaternion {
        hamilton(self, rhs)
    }
}

impl Mul for HyperQuaternion {
    type Output = HyperQuaternion;
    fn mul(self, rhs: HyperQuaternion) -> HyperQuaternion {
        hamilton(&self, &rhs)
    }
}

impl Add for &HyperQuaternion {
    type Output = HyperQuaternion;
    fn add(self, rhs: &HyperQuaternion) -> HyperQuaternion {
        HyperQuaternion {
            q0: &self.q0 + &rhs.q0,
            q1: &self.q1 + &rhs.q1,
            q2: &self.q2 + &rhs.q2,
            q3: &self.q3 + &rhs.q3,
        }
    }
}

impl Sub for &HyperQuaternion {
    type Output = HyperQuaternion;
    fn sub(self, rhs: &HyperQuaternion) -> HyperQuaternion {
        HyperQuaternion {
            q0: &self.q0 - &rhs.q0,
            q1: &self.q1 - &rhs.q1,
            q2: &self.q2 - &rhs.q2,
            q3: &self.q3 - &rhs.q3,
        }
    }
}
