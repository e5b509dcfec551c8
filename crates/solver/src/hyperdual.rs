//! Second-order forward-mode automatic differentiation.
//!
//! A [`HyperDual`] carries a value together with its exact gradient and Hessian
//! with respect to the `n` free unknowns of one solve. Seeding unknown `i` with
//! gradient `e_i` and a zero Hessian makes every expression built from it carry
//! the exact first and second partials.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use nalgebra::{DMatrix, DVector};

use crate::error::{Result, SolverError};

#[derive(Debug, Clone, PartialEq)]
pub struct HyperDual {
    pub value: f64,
    pub gradient: DVector<f64>,
    pub hessian: DMatrix<f64>,
}

impl HyperDual {
    pub fn new(value: f64, gradient: DVector<f64>, hessian: DMatrix<f64>) -> Self {
        debug_assert_eq!(hessian.nrows(), gradient.len());
        debug_assert_eq!(hessian.ncols(), gradient.len());
        Self {
            value,
            gradient,
            hessian,
        }
    }

    /// A real number lifted into `n` unknowns with zero derivatives.
    pub fn constant(value: f64, n: usize) -> Self {
        Self {
            value,
            gradient: DVector::zeros(n),
            hessian: DMatrix::zeros(n, n),
        }
    }

    pub fn zero(n: usize) -> Self {
        Self::constant(0.0, n)
    }

    /// The `index`-th unknown: gradient is the unit basis vector, Hessian is zero.
    pub fn variable(value: f64, index: usize, n: usize) -> Self {
        assert!(index < n, "unknown index {index} out of range for {n} unknowns");
        let mut gradient = DVector::zeros(n);
        gradient[index] = 1.0;
        Self {
            value,
            gradient,
            hessian: DMatrix::zeros(n, n),
        }
    }

    /// Number of unknowns the derivatives are taken against.
    pub fn dim(&self) -> usize {
        self.gradient.len()
    }

    /// Replace the value and keep the seeded derivatives.
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    /// Apply a scalar function `f` given `f(a)`, `f'(a)` and `f''(a)`.
    ///
    /// `grad f(a) = f'(a) g` and `hess f(a) = f''(a) g g^T + f'(a) H`.
    fn chain(&self, f0: f64, f1: f64, f2: f64) -> Self {
        let outer = &self.gradient * self.gradient.transpose();
        Self {
            value: f0,
            gradient: &self.gradient * f1,
            hessian: outer * f2 + &self.hessian * f1,
        }
    }

    pub fn square(&self) -> Self {
        self.chain(self.value * self.value, 2.0 * self.value, 2.0)
    }

    pub fn sin(&self) -> Self {
        let (s, c) = self.value.sin_cos();
        self.chain(s, c, -s)
    }

    pub fn cos(&self) -> Self {
        let (s, c) = self.value.sin_cos();
        self.chain(c, -s, -c)
    }

    /// Integer power. Negative exponents of a zero value are singular.
    pub fn powi(&self, exponent: i32) -> Result<Self> {
        match exponent {
            0 => Ok(Self::constant(1.0, self.dim())),
            1 => Ok(self.clone()),
            _ => {
                if exponent < 0 && self.value == 0.0 {
                    return Err(SolverError::DivisionSingularity { operation: "powi" });
                }
                let v = self.value;
                let e = f64::from(exponent);
                Ok(self.chain(
                    v.powi(exponent),
                    e * v.powi(exponent - 1),
                    e * (e - 1.0) * v.powi(exponent - 2),
                ))
            }
        }
    }

    /// Real power. At a zero value the derivatives are singular for exponents
    /// below two (other than the trivial 0 and 1).
    pub fn powf(&self, exponent: f64) -> Result<Self> {
        if exponent.fract() == 0.0 && exponent.abs() <= f64::from(i32::MAX) {
            return self.powi(exponent as i32);
        }
        if self.value == 0.0 && exponent < 2.0 {
            return Err(SolverError::DivisionSingularity { operation: "powf" });
        }
        let v = self.value;
        Ok(self.chain(
            v.powf(exponent),
            exponent * v.powf(exponent - 1.0),
            exponent * (exponent - 1.0) * v.powf(exponent - 2.0),
        ))
    }

    pub fn recip(&self) -> Result<Self> {
        if self.value == 0.0 {
            return Err(SolverError::DivisionSingularity { operation: "recip" });
        }
        let inv = 1.0 / self.value;
        Ok(self.chain(inv, -inv * inv, 2.0 * inv * inv * inv))
    }

    pub fn checked_div(&self, divisor: &HyperDual) -> Result<Self> {
        if divisor.value == 0.0 {
            return Err(SolverError::DivisionSingularity { operation: "div" });
        }
        Ok(self * divisor.recip()?)
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self {
            value: self.value * factor,
            gradient: &self.gradient * factor,
            hessian: &self.hessian * factor,
        }
    }
}

fn add(a: &HyperDual, b: &HyperDual) -> HyperDual {
    HyperDual {
        value: a.value + b.value,
        gradient: &a.gradient + &b.gradient,
        hessian: &a.hessian + &b.hessian,
    }
}

fn sub(a: &HyperDual, b: &HyperDual) -> HyperDual {
    HyperDual {
        value: a.value - b.value,
        gradient: &a.gradient - &b.gradient,
        hessian: &a.hessian - &b.hessian,
    }
}

fn mul(a: &HyperDual, b: &HyperDual) -> HyperDual {
    let cross = &a.gradient * b.gradient.transpose();
    let cross_t = cross.transpose();
    HyperDual {
        value: a.value * b.value,
        gradient: &a.gradient * b.value + &b.gradient * a.value,
        hessian: &a.hessian * b.value + cross + cross_t + &b.hessian * a.value,
    }
}

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $func:ident) => {
        impl $op<HyperDual> for HyperDual {
            type Output = HyperDual;
            fn $method(self, rhs: HyperDual) -> HyperDual {
                $func(&self, &rhs)
            }
        }

        impl<'a> $op<&'a HyperDual> for HyperDual {
            type Output = HyperDual;
            fn $method(self, rhs: &'a HyperDual) -> HyperDual {
                $func(&self, rhs)
            }
        }

        impl<'a> $op<HyperDual> for &'a HyperDual {
            type Output = HyperDual;
            fn $method(self, rhs: HyperDual) -> HyperDual {
                $func(self, &rhs)
            }
        }

        impl<'a, 'b> $op<&'b HyperDual> for &'a HyperDual {
            type Output = HyperDual;
            fn $method(self, rhs: &'b HyperDual) -> HyperDual {
                $func(self, rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, add);
impl_binary_op!(Sub, sub, sub);
impl_binary_op!(Mul, mul, mul);

impl AddAssign<&HyperDual> for HyperDual {
    fn add_assign(&mut self, rhs: &HyperDual) {
        self.value += rhs.value;
        self.gradient += &rhs.gradient;
        self.hessian += &rhs.hessian;
    }
}

impl AddAssign<HyperDual> for HyperDual {
    fn add_assign(&mut self, rhs: HyperDual) {
        *self += &rhs;
    }
}

impl Neg for &HyperDual {
    type Output = HyperDual;
    fn neg(self) -> HyperDual {
        HyperDual {
            value: -self.value,
            gradient: -&self.gradient,
            hessian: -&self.hessian,
        }
    }
}

impl Neg for HyperDual {
    type Output = HyperDual;
    fn neg(self) -> HyperDual {
        -&self
    }
}

// Mixed arithmetic with real constants (targets, offsets, literal factors).

impl Add<f64> for &HyperDual {
    type Output = HyperDual;
    fn add(self, rhs: f64) -> HyperDual {
        let mut out = self.clone();
        out.value += rhs;
        out
    }
}

impl Add<f64> for HyperDual {
    type Output = HyperDual;
    fn add(mut self, rhs: f64) -> HyperDual {
        self.value += rhs;
        self
    }
}

impl Add<HyperDual> for f64 {
    type Output = HyperDual;
    fn add(self, rhs: HyperDual) -> HyperDual {
        rhs + self
    }
}

impl Sub<f64> for &HyperDual {
    type Output = HyperDual;
    fn sub(self, rhs: f64) -> HyperDual {
        self + (-rhs)
    }
}

impl Sub<f64> for HyperDual {
    type Output = HyperDual;
    fn sub(self, rhs: f64) -> HyperDual {
        self + (-rhs)
    }
}

impl Sub<HyperDual> for f64 {
    type Output = HyperDual;
    fn sub(self, rhs: HyperDual) -> HyperDual {
        -rhs + self
    }
}

impl Mul<f64> for &HyperDual {
    type Output = HyperDual;
    fn mul(self, rhs: f64) -> HyperDual {
        self.scale(rhs)
    }
}

impl Mul<f64> for HyperDual {
    type Output = HyperDual;
    fn mul(self, rhs: f64) -> HyperDual {
        self.scale(rhs)
    }
}

impl Mul<HyperDual> for f64 {
    type Output = HyperDual;
    fn mul(self, rhs: HyperDual) -> HyperDual {
        rhs.scale(self)
    }
}

impl Mul<&HyperDual> for f64 {
    type Output = HyperDual;
    fn mul(self, rhs: &HyperDual) -> HyperDual {
        rhs.scale(self)
    }
}
