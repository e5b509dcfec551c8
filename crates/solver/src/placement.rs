//! Resolved variable values and the per-evaluation placement cache.

use std::collections::HashMap;

use crate::error::{Result, SolverError};
use crate::hyperdual::HyperDual;
use crate::quaternion::HyperQuaternion;
use crate::variable::{Axis, ObjectId, PlacementKind, VariableId, VariableKey, VariableRegistry};

/// Where a variable reads its value from. Aliased variables bind to the slot
/// of their class representative, so every alias observes the same number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Unknown(usize),
    Constant(usize),
}

/// Hyper-dual values for every registered variable of one solve.
#[derive(Debug, Clone)]
pub struct ResolvedVariables {
    n: usize,
    unknowns: Vec<HyperDual>,
    constants: Vec<HyperDual>,
    bindings: Vec<Binding>,
}

impl ResolvedVariables {
    /// Seed free unknowns with unit gradients and lift locked classes to
    /// constants. The registry must already be indexed and seeded.
    pub fn seed(registry: &VariableRegistry) -> Result<Self> {
        if !registry.is_indexed() {
            return Err(SolverError::RegistryState {
                reason: "indices must be assigned before resolving variables",
            });
        }
        let n = registry.free_count();
        let unknowns: Vec<HyperDual> = registry
            .variables()
            .iter()
            .filter_map(|v| v.index.map(|i| HyperDual::variable(v.current_value, i, n)))
            .collect();
        debug_assert_eq!(unknowns.len(), n);

        let mut constants = Vec::new();
        let mut constant_slots: HashMap<VariableId, usize> = HashMap::new();
        let mut bindings = Vec::with_capacity(registry.len());
        for id in registry.ids() {
            let root = registry.representative(id);
            let variable = registry.variable(root);
            let binding = match variable.index {
                Some(index) => Binding::Unknown(index),
                None => {
                    let slot = *constant_slots.entry(root).or_insert_with(|| {
                        constants.push(HyperDual::constant(variable.current_value, n));
                        constants.len() - 1
                    });
                    Binding::Constant(slot)
                }
            };
            bindings.push(binding);
        }

        Ok(Self {
            n,
            unknowns,
            constants,
            bindings,
        })
    }

    /// Number of free unknowns.
    pub fn dimension(&self) -> usize {
        self.n
    }

    /// Write a trial point into the unknowns. Derivative seeds are untouched.
    pub fn set_unknowns(&mut self, x: &[f64]) {
        assert_eq!(x.len(), self.n, "trial vector has the wrong dimension");
        for (unknown, value) in self.unknowns.iter_mut().zip(x) {
            unknown.set_value(*value);
        }
    }

    pub fn value(&self, id: VariableId) -> &HyperDual {
        match self.bindings[id.index()] {
            Binding::Unknown(i) => &self.unknowns[i],
            Binding::Constant(i) => &self.constants[i],
        }
    }

    /// Overwrite the value behind `id`; all aliases of `id` see the change.
    pub fn set_value(&mut self, id: VariableId, value: f64) {
        match self.bindings[id.index()] {
            Binding::Unknown(i) => self.unknowns[i].set_value(value),
            Binding::Constant(i) => self.constants[i].set_value(value),
        }
    }

    pub fn unknowns(&self) -> &[HyperDual] {
        &self.unknowns
    }
}

#[derive(Debug, Clone)]
struct CachedRotation {
    axes: [HyperQuaternion; 3],
    composed: HyperQuaternion,
}

/// Base and Rotation placements composed once per objective evaluation and
/// shared by every constraint.
#[derive(Debug, Clone, Default)]
pub struct PlacementCache {
    bases: HashMap<ObjectId, HyperQuaternion>,
    rotations: HashMap<ObjectId, CachedRotation>,
}

impl PlacementCache {
    pub fn build(registry: &VariableRegistry, resolved: &ResolvedVariables) -> Result<Self> {
        let mut cache = Self::default();
        for placement in registry.placements() {
            let [x, y, z] = Axis::ALL.map(|axis| {
                registry.get(&VariableKey::new(
                    placement.object.clone(),
                    placement.kind,
                    axis,
                ))
            });
            let (Some(x), Some(y), Some(z)) = (x, y, z) else {
                return Err(SolverError::MissingPlacement {
                    object: placement.object.clone(),
                    kind: placement.kind,
                });
            };
            match placement.kind {
                PlacementKind::Base => {
                    let base = HyperQuaternion::pure(
                        resolved.value(x).clone(),
                        resolved.value(y).clone(),
                        resolved.value(z).clone(),
                    );
                    cache.bases.insert(placement.object.clone(), base);
                }
                PlacementKind::Rotation => {
                    let axes = [
                        HyperQuaternion::from_axis_angle(Axis::X, resolved.value(x)),
                        HyperQuaternion::from_axis_angle(Axis::Y, resolved.value(y)),
                        HyperQuaternion::from_axis_angle(Axis::Z, resolved.value(z)),
                    ];
                    let composed = HyperQuaternion::from_euler_parts(&axes[0], &axes[1], &axes[2]);
                    cache
                        .rotations
                        .insert(placement.object.clone(), CachedRotation { axes, composed });
                }
            }
        }
        Ok(cache)
    }

    pub fn base(&self, object: &ObjectId) -> Result<&HyperQuaternion> {
        self.bases
            .get(object)
            .ok_or_else(|| missing(object, PlacementKind::Base))
    }

    /// The composed rotation `Rz * Ry * Rx`.
    pub fn rotation(&self, object: &ObjectId) -> Result<&HyperQuaternion> {
        self.rotations
            .get(object)
            .map(|r| &r.composed)
            .ok_or_else(|| missing(object, PlacementKind::Rotation))
    }

    /// The single-axis factor of an object's rotation.
    pub fn axis_rotation(&self, object: &ObjectId, axis: Axis) -> Result<&HyperQuaternion> {
        let rotation = self
            .rotations
            .get(object)
            .ok_or_else(|| missing(object, PlacementKind::Rotation))?;
        Ok(match axis {
            Axis::X => &rotation.axes[0],
            Axis::Y => &rotation.axes[1],
            Axis::Z => &rotation.axes[2],
        })
    }
}

fn missing(object: &ObjectId, kind: PlacementKind) -> SolverError {
    SolverError::MissingPlacement {
        object: object.clone(),
        kind,
    }
}

/// Everything a constraint needs to build its residual.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub registry: &'a VariableRegistry,
    pub variables: &'a ResolvedVariables,
    pub placements: &'a PlacementCache,
}

impl<'a> EvaluationContext<'a> {
    pub fn dimension(&self) -> usize {
        self.variables.dimension()
    }

    pub fn value(&self, key: &VariableKey) -> Result<&'a HyperDual> {
        let id = self
            .registry
            .get(key)
            .ok_or_else(|| missing(&key.object, key.kind))?;
        Ok(self.variables.value(id))
    }
}
