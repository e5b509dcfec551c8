//! The set of scalar unknowns of one solve.
//!
//! Every translation or rotation axis referenced by a constraint becomes a
//! [`Variable`]. Equality constraints alias variables (identity sharing, not a
//! penalty), Lock constraints turn them into constants, and the remaining
//! variables are numbered densely as the solver's unknown vector.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SolverError};

/// Identifier of a host object whose placement is solved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Which half of a placement a variable belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PlacementKind {
    Base,
    Rotation,
}

impl PlacementKind {
    pub const ALL: [PlacementKind; 2] = [PlacementKind::Base, PlacementKind::Rotation];
}

impl fmt::Display for PlacementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementKind::Base => f.write_str("Base"),
            PlacementKind::Rotation => f.write_str("Rotation"),
        }
    }
}

/// A global coordinate axis. Iteration order is always x, y, z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => f.write_str("x"),
            Axis::Y => f.write_str("y"),
            Axis::Z => f.write_str("z"),
        }
    }
}

/// `(object, kind, axis)`: one scalar degree of freedom of one placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableKey {
    pub object: ObjectId,
    pub kind: PlacementKind,
    pub axis: Axis,
}

impl VariableKey {
    pub fn new(object: ObjectId, kind: PlacementKind, axis: Axis) -> Self {
        Self { object, kind, axis }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.object, self.kind, self.axis)
    }
}

/// A whole Base or Rotation placement of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlacementKey {
    pub object: ObjectId,
    pub kind: PlacementKind,
}

/// Index of a variable inside its registry (registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(usize);

impl VariableId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub key: VariableKey,
    /// Held at `current_value` for the whole solve.
    pub locked: bool,
    /// The variable this one is identical to.
    pub equal_to: Option<VariableId>,
    /// Slot in the solver's unknown vector; set only for free variables.
    pub index: Option<usize>,
    /// Seed value read from the host (or pinned by a Lock) at solve start.
    pub current_value: f64,
    /// Value a Lock constraint fixes this variable at.
    pub pinned_value: Option<f64>,
}

impl Variable {
    fn new(key: VariableKey) -> Self {
        Self {
            key,
            locked: false,
            equal_to: None,
            index: None,
            current_value: 0.0,
            pinned_value: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.index.is_some()
    }
}

/// Solve-scoped registry of variables, aliases and locks.
#[derive(Debug, Default)]
pub struct VariableRegistry {
    variables: Vec<Variable>,
    lookup: HashMap<VariableKey, VariableId>,
    /// Union-find parents mirroring the `equal_to` links.
    parent: Vec<usize>,
    placements: Vec<PlacementKey>,
    placement_set: HashSet<PlacementKey>,
    free_count: usize,
    indexed: bool,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `key`, creating the variable on first use.
    pub fn register(&mut self, key: VariableKey) -> Result<VariableId> {
        if let Some(id) = self.lookup.get(&key) {
            return Ok(*id);
        }
        if self.indexed {
            return Err(SolverError::RegistryState {
                reason: "cannot register variables after indices were assigned",
            });
        }
        let id = VariableId(self.variables.len());
        debug!(variable = %key, id = id.0, "registered variable");
        self.lookup.insert(key.clone(), id);
        self.variables.push(Variable::new(key));
        self.parent.push(id.0);
        Ok(id)
    }

    /// Register the three axes of a placement (x, y, z) and mark the
    /// placement for construction by the placement cache.
    pub fn require_placement(
        &mut self,
        object: &ObjectId,
        kind: PlacementKind,
    ) -> Result<[VariableId; 3]> {
        let mut ids = [VariableId(0); 3];
        for (slot, axis) in ids.iter_mut().zip(Axis::ALL) {
            *slot = self.register(VariableKey::new(object.clone(), kind, axis))?;
        }
        let key = PlacementKey {
            object: object.clone(),
            kind,
        };
        if self.placement_set.insert(key.clone()) {
            self.placements.push(key);
        }
        Ok(ids)
    }

    /// Make `a` identical to `b`.
    ///
    /// Fails with [`SolverError::CyclicAlias`] if `a` and `b` already share a
    /// class through another path. When `a` already follows another variable
    /// the new link is placed on its class root, so no earlier equality is
    /// dropped.
    pub fn alias(&mut self, a: VariableId, b: VariableId) -> Result<()> {
        if self.indexed {
            return Err(SolverError::RegistryState {
                reason: "cannot alias variables after indices were assigned",
            });
        }
        if self.variables[a.0].equal_to == Some(b) {
            return Ok(());
        }
        let root_a = self.find(a.0);
        let root_b = self.find(b.0);
        if root_a == root_b {
            return Err(SolverError::CyclicAlias {
                variable: self.variables[a.0].key.clone(),
            });
        }
        debug!(
            variable = %self.variables[a.0].key,
            target = %self.variables[b.0].key,
            "aliased variable"
        );
        self.variables[root_a].equal_to = Some(b);
        self.parent[root_a] = root_b;
        Ok(())
    }

    /// Hold `a` at its seed value.
    pub fn lock(&mut self, a: VariableId) {
        self.variables[a.0].locked = true;
    }

    /// Hold `a` at `value` instead of the host's value.
    pub fn lock_at(&mut self, a: VariableId, value: f64) {
        let variable = &mut self.variables[a.0];
        if let Some(previous) = variable.pinned_value {
            if previous != value {
                warn!(
                    variable = %variable.key,
                    previous,
                    value,
                    "variable locked at conflicting values; keeping the latest"
                );
            }
        }
        variable.locked = true;
        variable.pinned_value = Some(value);
    }

    /// Number the free variables densely in registration order.
    ///
    /// Must run exactly once, after every constraint has been discovered.
    pub fn assign_indices(&mut self) -> Result<usize> {
        if self.indexed {
            return Err(SolverError::RegistryState {
                reason: "indices were already assigned for this solve",
            });
        }
        for i in 0..self.variables.len() {
            self.find(i);
        }
        let mut next = 0;
        for variable in &mut self.variables {
            if !variable.locked && variable.equal_to.is_none() {
                variable.index = Some(next);
                next += 1;
            } else {
                variable.index = None;
            }
        }
        self.free_count = next;
        self.indexed = true;
        debug!(
            variables = self.variables.len(),
            free = next,
            "assigned unknown indices"
        );
        Ok(next)
    }

    /// Fill `current_value` for every variable: pinned values win, the rest
    /// come from `read`.
    pub fn seed_current_values<F>(&mut self, mut read: F) -> Result<()>
    where
        F: FnMut(&VariableKey) -> Result<f64>,
    {
        for variable in &mut self.variables {
            variable.current_value = match variable.pinned_value {
                Some(value) => value,
                None => read(&variable.key)?,
            };
        }
        Ok(())
    }

    pub fn set_current_value(&mut self, id: VariableId, value: f64) {
        self.variables[id.0].current_value = value;
    }

    /// The class root `id` resolves to.
    pub fn representative(&self, id: VariableId) -> VariableId {
        let mut i = id.0;
        while self.parent[i] != i {
            i = self.parent[i];
        }
        VariableId(i)
    }

    fn find(&mut self, mut i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[i] != root {
            let next = self.parent[i];
            self.parent[i] = root;
            i = next;
        }
        root
    }

    pub fn get(&self, key: &VariableKey) -> Option<VariableId> {
        self.lookup.get(key).copied()
    }

    pub fn variable(&self, id: VariableId) -> &Variable {
        &self.variables[id.0]
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn ids(&self) -> impl Iterator<Item = VariableId> + '_ {
        (0..self.variables.len()).map(VariableId)
    }

    pub fn placements(&self) -> &[PlacementKey] {
        &self.placements
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn is_indexed(&self) -> bool {
        self.indexed
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Seed values of the free variables, ordered by index.
    pub fn initial_guess(&self) -> Vec<f64> {
        let mut x = vec![0.0; self.free_count];
        for variable in &self.variables {
            if let Some(index) = variable.index {
                x[index] = variable.current_value;
            }
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(object: &str, kind: PlacementKind, axis: Axis) -> VariableKey {
        VariableKey::new(ObjectId::from(object), kind, axis)
    }

    fn base_x(object: &str) -> VariableKey {
        key(object, PlacementKind::Base, Axis::X)
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.register(base_x("A")).unwrap(), a);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(&base_x("B")), Some(b));
    }

    #[test]
    fn test_require_placement_registers_axes_in_order() {
        let mut reg = VariableRegistry::new();
        let ids = reg
            .require_placement(&ObjectId::from("A"), PlacementKind::Rotation)
            .unwrap();
        for (id, axis) in ids.iter().zip(Axis::ALL) {
            assert_eq!(reg.variable(*id).key.axis, axis);
        }
        reg.require_placement(&ObjectId::from("A"), PlacementKind::Rotation)
            .unwrap();
        assert_eq!(reg.placements().len(), 1);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_alias_shares_representative() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        let c = reg.register(base_x("C")).unwrap();
        reg.alias(a, b).unwrap();
        reg.alias(b, c).unwrap();
        assert_eq!(reg.representative(a), c);
        assert_eq!(reg.representative(b), c);
        assert_eq!(reg.variable(a).equal_to, Some(b));
    }

    #[test]
    fn test_alias_cycle_is_rejected() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        let c = reg.register(base_x("C")).unwrap();
        reg.alias(a, b).unwrap();
        reg.alias(b, c).unwrap();
        let err = reg.alias(c, a).unwrap_err();
        assert!(matches!(err, SolverError::CyclicAlias { .. }));
        assert!(matches!(
            reg.alias(a, a),
            Err(SolverError::CyclicAlias { .. })
        ));
    }

    #[test]
    fn test_repeated_alias_is_a_no_op() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        reg.alias(a, b).unwrap();
        reg.alias(a, b).unwrap();
        assert_eq!(reg.representative(a), b);
    }

    #[test]
    fn test_second_alias_links_class_root() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        let c = reg.register(base_x("C")).unwrap();
        reg.alias(a, b).unwrap();
        reg.alias(a, c).unwrap();
        // All three end up in one class rooted at C.
        assert_eq!(reg.representative(a), c);
        assert_eq!(reg.representative(b), c);
        assert_eq!(reg.variable(b).equal_to, Some(c));
    }

    #[test]
    fn test_assign_indices_skips_locked_and_aliased() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        let c = reg.register(base_x("C")).unwrap();
        let d = reg.register(base_x("D")).unwrap();
        reg.lock(a);
        reg.alias(c, b).unwrap();
        assert_eq!(reg.assign_indices().unwrap(), 2);
        assert_eq!(reg.variable(a).index, None);
        assert_eq!(reg.variable(b).index, Some(0));
        assert_eq!(reg.variable(c).index, None);
        assert_eq!(reg.variable(d).index, Some(1));
        assert_eq!(reg.free_count(), 2);
    }

    #[test]
    fn test_indices_are_assigned_once() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        reg.assign_indices().unwrap();
        assert!(reg.assign_indices().is_err());
        assert!(reg.register(base_x("B")).is_err());
        // Known keys still resolve.
        assert_eq!(reg.register(base_x("A")).unwrap(), a);
    }

    #[test]
    fn test_empty_registry_has_no_unknowns() {
        let mut reg = VariableRegistry::new();
        assert_eq!(reg.assign_indices().unwrap(), 0);
        assert!(reg.initial_guess().is_empty());
    }

    #[test]
    fn test_pinned_values_override_host_values() {
        let mut reg = VariableRegistry::new();
        let a = reg.register(base_x("A")).unwrap();
        let b = reg.register(base_x("B")).unwrap();
        reg.lock_at(a, 7.5);
        reg.assign_indices().unwrap();
        reg.seed_current_values(|_| Ok(1.0)).unwrap();
        assert_eq!(reg.variable(a).current_value, 7.5);
        assert_eq!(reg.variable(b).current_value, 1.0);
        assert_eq!(reg.initial_guess(), vec![1.0]);
    }

    #[test]
    fn test_key_display() {
        let k = key("Part", PlacementKind::Rotation, Axis::Z);
        assert_eq!(k.to_string(), "Part.Rotation.z");
    }
}
