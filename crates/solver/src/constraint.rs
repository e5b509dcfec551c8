use serde::{Deserialize, Serialize};

use crate::error::{Result, SolverError};
use crate::hyperdual::HyperDual;
use crate::placement::EvaluationContext;
use crate::quaternion::HyperQuaternion;
use crate::variable::{Axis, ObjectId, PlacementKind, VariableKey, VariableRegistry};

/// One value per global axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AxisTriple<T> {
    pub x: T,
    pub y: T,
    pub z: T,
}

impl<T: Copy> AxisTriple<T> {
    pub fn new(x: T, y: T, z: T) -> Self {
        Self { x, y, z }
    }

    pub fn splat(v: T) -> Self {
        Self { x: v, y: v, z: v }
    }

    pub fn get(&self, axis: Axis) -> T {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    pub fn set(&mut self, axis: Axis, value: T) {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
            Axis::Z => self.z = value,
        }
    }

    /// `(axis, value)` pairs in x, y, z order.
    pub fn iter(&self) -> impl Iterator<Item = (Axis, T)> + '_ {
        Axis::ALL.into_iter().map(move |axis| (axis, self.get(axis)))
    }
}

impl AxisTriple<bool> {
    pub fn any(&self) -> bool {
        self.x || self.y || self.z
    }
}

/// The six Base/Rotation x/y/z slots of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Components<T> {
    pub base: AxisTriple<T>,
    pub rotation: AxisTriple<T>,
}

impl<T: Copy> Components<T> {
    pub fn new(base: AxisTriple<T>, rotation: AxisTriple<T>) -> Self {
        Self { base, rotation }
    }

    pub fn splat(v: T) -> Self {
        Self {
            base: AxisTriple::splat(v),
            rotation: AxisTriple::splat(v),
        }
    }

    pub fn of(&self, kind: PlacementKind) -> &AxisTriple<T> {
        match kind {
            PlacementKind::Base => &self.base,
            PlacementKind::Rotation => &self.rotation,
        }
    }

    /// All six slots: Base x, y, z then Rotation x, y, z.
    pub fn slots(&self) -> impl Iterator<Item = (PlacementKind, Axis, T)> + '_ {
        PlacementKind::ALL.into_iter().flat_map(move |kind| {
            self.of(kind)
                .iter()
                .map(move |(axis, value)| (kind, axis, value))
        })
    }
}

/// Which slots a constraint restrains.
pub type EnabledAxes = Components<bool>;

/// Target values per slot: lengths in document units, angles in degrees.
pub type FixedValues = Components<f64>;

impl EnabledAxes {
    pub fn none() -> Self {
        Self::splat(false)
    }

    pub fn all() -> Self {
        Self::splat(true)
    }

    pub fn base_only() -> Self {
        Self::new(AxisTriple::splat(true), AxisTriple::splat(false))
    }

    pub fn rotation_only() -> Self {
        Self::new(AxisTriple::splat(false), AxisTriple::splat(true))
    }

    pub fn any(&self) -> bool {
        self.base.any() || self.rotation.any()
    }
}

impl FixedValues {
    pub fn base(x: f64, y: f64, z: f64) -> Self {
        Self::new(AxisTriple::new(x, y, z), AxisTriple::splat(0.0))
    }

    /// Zero every slot that is not enabled.
    pub fn masked(&self, enabled: &EnabledAxes) -> Self {
        let mask = |v: &AxisTriple<f64>, e: &AxisTriple<bool>| {
            AxisTriple::new(
                if e.x { v.x } else { 0.0 },
                if e.y { v.y } else { 0.0 },
                if e.z { v.z } else { 0.0 },
            )
        };
        Self::new(
            mask(&self.base, &enabled.base),
            mask(&self.rotation, &enabled.rotation),
        )
    }
}

/// Host-editable fields of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EditedFields {
    pub enabled: EnabledAxes,
    pub values: FixedValues,
}

/// A placement constraint declared by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Constraint {
    /// Enabled slots of `object_1` are the same numbers as those of `object_2`.
    Equality {
        object_1: ObjectId,
        object_2: ObjectId,
        enabled: EnabledAxes,
    },
    /// Enabled slots of `object` are held at `values`.
    Lock {
        object: ObjectId,
        enabled: EnabledAxes,
        values: FixedValues,
    },
    /// `object` is posed relative to `reference`: its Base at offset
    /// `values.base` in the reference frame, its Rotation at `values.rotation`
    /// relative to the reference rotation.
    Fix {
        object: ObjectId,
        reference: ObjectId,
        enabled: EnabledAxes,
        values: FixedValues,
    },
}

impl Constraint {
    pub fn equality(
        object_1: impl Into<ObjectId>,
        object_2: impl Into<ObjectId>,
        enabled: EnabledAxes,
    ) -> Result<Self> {
        let c = Constraint::Equality {
            object_1: object_1.into(),
            object_2: object_2.into(),
            enabled,
        };
        c.check_selection()?;
        Ok(c)
    }

    pub fn lock(object: impl Into<ObjectId>, enabled: EnabledAxes, values: FixedValues) -> Result<Self> {
        let c = Constraint::Lock {
            object: object.into(),
            enabled,
            values: values.masked(&enabled),
        };
        c.check_selection()?;
        Ok(c)
    }

    pub fn fix(
        object: impl Into<ObjectId>,
        reference: impl Into<ObjectId>,
        enabled: EnabledAxes,
        values: FixedValues,
    ) -> Result<Self> {
        let c = Constraint::Fix {
            object: object.into(),
            reference: reference.into(),
            enabled,
            values: values.masked(&enabled),
        };
        c.check_selection()?;
        Ok(c)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Constraint::Equality { .. } => "Equality",
            Constraint::Lock { .. } => "Lock",
            Constraint::Fix { .. } => "Fix",
        }
    }

    pub fn label(&self) -> String {
        match self {
            Constraint::Equality {
                object_1, object_2, ..
            } => format!("Equality({object_1} = {object_2})"),
            Constraint::Lock { object, .. } => format!("Lock({object})"),
            Constraint::Fix {
                object, reference, ..
            } => format!("Fix({object} -> {reference})"),
        }
    }

    pub fn enabled(&self) -> &EnabledAxes {
        match self {
            Constraint::Equality { enabled, .. }
            | Constraint::Lock { enabled, .. }
            | Constraint::Fix { enabled, .. } => enabled,
        }
    }

    pub fn objects(&self) -> Vec<&ObjectId> {
        match self {
            Constraint::Equality {
                object_1, object_2, ..
            } => vec![object_1, object_2],
            Constraint::Lock { object, .. } => vec![object],
            Constraint::Fix {
                object, reference, ..
            } => vec![object, reference],
        }
    }

    /// Reject empty or duplicated object selections.
    pub fn check_selection(&self) -> Result<()> {
        let objects = self.objects();
        if objects.iter().any(|o| o.as_str().is_empty()) {
            return Err(SolverError::Selection {
                reason: format!("{} is missing an object", self.kind_name()),
            });
        }
        if objects.len() == 2 && objects[0] == objects[1] {
            return Err(SolverError::Selection {
                reason: format!(
                    "{} needs two different objects, got {} twice",
                    self.kind_name(),
                    objects[0]
                ),
            });
        }
        Ok(())
    }

    /// A constraint without any enabled slot restrains nothing.
    pub fn check_enabled(&self) -> Result<()> {
        if self.enabled().any() {
            Ok(())
        } else {
            Err(SolverError::Underdetermined {
                constraint: self.label(),
            })
        }
    }

    /// Apply edited enable flags and values, returning the new canonical
    /// constraint. Values of disabled slots are reset to zero.
    pub fn update_from_edited_fields(&self, fields: &EditedFields) -> Result<Self> {
        let updated = match self {
            Constraint::Equality {
                object_1, object_2, ..
            } => Constraint::Equality {
                object_1: object_1.clone(),
                object_2: object_2.clone(),
                enabled: fields.enabled,
            },
            Constraint::Lock { object, .. } => Constraint::Lock {
                object: object.clone(),
                enabled: fields.enabled,
                values: fields.values.masked(&fields.enabled),
            },
            Constraint::Fix {
                object, reference, ..
            } => Constraint::Fix {
                object: object.clone(),
                reference: reference.clone(),
                enabled: fields.enabled,
                values: fields.values.masked(&fields.enabled),
            },
        };
        updated.check_selection()?;
        Ok(updated)
    }

    /// Register, alias and lock the variables this constraint touches.
    ///
    /// Slots are visited Base x, y, z then Rotation x, y, z, the same order
    /// the placement cache composes them in.
    pub fn discover_variables(&self, registry: &mut VariableRegistry) -> Result<()> {
        match self {
            Constraint::Equality {
                object_1,
                object_2,
                enabled,
            } => {
                for (kind, axis, on) in enabled.slots() {
                    if !on {
                        continue;
                    }
                    let a = registry.register(VariableKey::new(object_1.clone(), kind, axis))?;
                    let b = registry.register(VariableKey::new(object_2.clone(), kind, axis))?;
                    registry.alias(a, b)?;
                }
            }
            Constraint::Lock {
                object,
                enabled,
                values,
            } => {
                for (kind, axis, on) in enabled.slots() {
                    if !on {
                        continue;
                    }
                    let id = registry.register(VariableKey::new(object.clone(), kind, axis))?;
                    registry.lock_at(id, internal_value(kind, values.of(kind).get(axis)));
                }
            }
            Constraint::Fix {
                object,
                reference,
                enabled,
                ..
            } => {
                if enabled.base.any() {
                    registry.require_placement(object, PlacementKind::Base)?;
                    registry.require_placement(reference, PlacementKind::Base)?;
                    registry.require_placement(reference, PlacementKind::Rotation)?;
                }
                if enabled.rotation.any() {
                    registry.require_placement(object, PlacementKind::Rotation)?;
                    registry.require_placement(reference, PlacementKind::Rotation)?;
                }
            }
        }
        Ok(())
    }

    /// Sum of this constraint's squared residual terms.
    pub fn build_residual(&self, ctx: &EvaluationContext<'_>) -> Result<HyperDual> {
        let n = ctx.dimension();
        match self {
            // Equality is enforced exactly through aliasing.
            Constraint::Equality { .. } => Ok(HyperDual::zero(n)),
            Constraint::Lock {
                object,
                enabled,
                values,
            } => {
                let mut total = HyperDual::zero(n);
                for (kind, axis, on) in enabled.slots() {
                    if !on {
                        continue;
                    }
                    let key = VariableKey::new(object.clone(), kind, axis);
                    let target = internal_value(kind, values.of(kind).get(axis));
                    total += (ctx.value(&key)? - target).square();
                }
                Ok(total)
            }
            Constraint::Fix {
                object,
                reference,
                enabled,
                values,
            } => {
                let mut total = HyperDual::zero(n);
                if enabled.base.any() {
                    total += fix_base_residual(ctx, object, reference, enabled, values)?;
                }
                if enabled.rotation.any() {
                    total += fix_rotation_residual(ctx, object, reference, enabled, values)?;
                }
                Ok(total)
            }
        }
    }
}

/// Rotation slots are stored in degrees and solved in radians.
fn internal_value(kind: PlacementKind, stored: f64) -> f64 {
    match kind {
        PlacementKind::Base => stored,
        PlacementKind::Rotation => stored.to_radians(),
    }
}

/// `R_ref^-1 (p_obj - p_ref) R_ref - offset`, squared on the enabled axes.
/// The scalar part is always included so the error stays a pure vector.
fn fix_base_residual(
    ctx: &EvaluationContext<'_>,
    object: &ObjectId,
    reference: &ObjectId,
    enabled: &EnabledAxes,
    values: &FixedValues,
) -> Result<HyperDual> {
    let n = ctx.dimension();
    let position = ctx.placements.base(object)?;
    let reference_position = ctx.placements.base(reference)?;
    let reference_rotation = ctx.placements.rotation(reference)?;

    let v = position - reference_position;
    let local = reference_rotation.inverse().rotate_vector(&v);
    let offset = HyperQuaternion::from_constants(
        [values.base.x, values.base.y, values.base.z, 0.0],
        n,
    );
    let error = &local - &offset;

    let mut total = error.q3.square();
    for (axis, on) in enabled.base.iter() {
        if on {
            total += error.component(axis).square();
        }
    }
    Ok(total)
}

/// Vector part of `R_ref^-1 * R_obj * F^-1`, squared. Disabled axes of `F`
/// take the object's own current rotation about that axis.
fn fix_rotation_residual(
    ctx: &EvaluationContext<'_>,
    object: &ObjectId,
    reference: &ObjectId,
    enabled: &EnabledAxes,
    values: &FixedValues,
) -> Result<HyperDual> {
    let n = ctx.dimension();
    let rotation = ctx.placements.rotation(object)?;
    let reference_rotation = ctx.placements.rotation(reference)?;

    let mut parts = Vec::with_capacity(3);
    for (axis, on) in enabled.rotation.iter() {
        let part = if on {
            HyperQuaternion::from_axis_angle_f64(axis, values.rotation.get(axis).to_radians(), n)
        } else {
            ctx.placements.axis_rotation(object, axis)?.clone()
        };
        parts.push(part);
    }
    let fixed = HyperQuaternion::from_euler_parts(&parts[0], &parts[1], &parts[2]);

    let error = &(&reference_rotation.inverse() * rotation) * &fixed.inverse();
    Ok(error.vector_norm_squared())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::{PlacementCache, ResolvedVariables};
    use approx::assert_abs_diff_eq;

    /// Discover, seed from `read` and evaluate the summed residual.
    fn evaluate<F>(constraints: &[Constraint], read: F) -> (VariableRegistry, HyperDual)
    where
        F: FnMut(&VariableKey) -> Result<f64>,
    {
        let mut registry = VariableRegistry::new();
        for c in constraints {
            c.discover_variables(&mut registry).unwrap();
        }
        registry.assign_indices().unwrap();
        registry.seed_current_values(read).unwrap();
        let resolved = ResolvedVariables::seed(&registry).unwrap();
        let cache = PlacementCache::build(&registry, &resolved).unwrap();
        let ctx = EvaluationContext {
            registry: &registry,
            variables: &resolved,
            placements: &cache,
        };
        let mut total = HyperDual::zero(resolved.dimension());
        for c in constraints {
            total += c.build_residual(&ctx).unwrap();
        }
        (registry, total)
    }

    fn placement_values(key: &VariableKey) -> Result<f64> {
        Ok(match (key.object.as_str(), key.kind, key.axis) {
            ("B", PlacementKind::Base, Axis::X) => 12.0,
            ("B", PlacementKind::Base, Axis::Y) => 1.0,
            ("A", PlacementKind::Rotation, Axis::Z) => std::f64::consts::FRAC_PI_2,
            _ => 0.0,
        })
    }

    #[test]
    fn test_equality_aliases_enabled_slots() {
        let enabled = EnabledAxes::new(AxisTriple::new(true, false, false), AxisTriple::splat(false));
        let c = Constraint::equality("A", "B", enabled).unwrap();
        let mut registry = VariableRegistry::new();
        c.discover_variables(&mut registry).unwrap();
        assert_eq!(registry.len(), 2);
        let a = registry
            .get(&VariableKey::new("A".into(), PlacementKind::Base, Axis::X))
            .unwrap();
        let b = registry
            .get(&VariableKey::new("B".into(), PlacementKind::Base, Axis::X))
            .unwrap();
        assert_eq!(registry.representative(a), b);
    }

    #[test]
    fn test_lock_pins_rotation_in_radians() {
        let enabled = EnabledAxes::new(AxisTriple::splat(false), AxisTriple::new(false, false, true));
        let values = FixedValues::new(AxisTriple::splat(0.0), AxisTriple::new(0.0, 0.0, 90.0));
        let c = Constraint::lock("A", enabled, values).unwrap();
        let (registry, total) = evaluate(&[c], |_| Ok(0.3));
        let v = registry.variable(
            registry
                .get(&VariableKey::new("A".into(), PlacementKind::Rotation, Axis::Z))
                .unwrap(),
        );
        assert!(v.locked);
        assert_abs_diff_eq!(v.current_value, std::f64::consts::FRAC_PI_2, epsilon = 1e-15);
        assert_eq!(registry.free_count(), 0);
        assert_eq!(total.value, 0.0);
    }

    #[test]
    fn test_fix_base_residual_in_reference_frame() {
        // A rotated 90 degrees about z; B at (12, 1, 0) is (1, -12, 0) in A's
        // frame, so the error against offset (10, 0, 0) is (-9, -12, 0).
        let c = Constraint::fix("B", "A", EnabledAxes::base_only(), FixedValues::base(10.0, 0.0, 0.0)).unwrap();
        let (_, total) = evaluate(&[c], placement_values);
        assert_abs_diff_eq!(total.value, 81.0 + 144.0, epsilon = 1e-9);

        let x_only = EnabledAxes::new(AxisTriple::new(true, false, false), AxisTriple::splat(false));
        let c = Constraint::fix("B", "A", x_only, FixedValues::base(10.0, 0.0, 0.0)).unwrap();
        let (_, total) = evaluate(&[c], placement_values);
        assert_abs_diff_eq!(total.value, 81.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fix_base_does_not_need_object_rotation() {
        let c = Constraint::fix("B", "A", EnabledAxes::base_only(), FixedValues::base(10.0, 0.0, 0.0)).unwrap();
        let (registry, _) = evaluate(&[c], placement_values);
        assert!(registry
            .get(&VariableKey::new("B".into(), PlacementKind::Rotation, Axis::X))
            .is_none());
        // Object base, reference base and reference rotation.
        assert_eq!(registry.len(), 9);
    }

    #[test]
    fn test_fix_rotation_residual_vanishes_at_target() {
        let values = FixedValues::new(AxisTriple::splat(0.0), AxisTriple::new(0.0, 0.0, 90.0));
        let c = Constraint::fix("B", "A", EnabledAxes::rotation_only(), values).unwrap();

        // B rotated 180 degrees about z, A rotated 90: relative rotation is 90.
        let (_, total) = evaluate(&[c.clone()], |k| {
            Ok(match (k.object.as_str(), k.axis) {
                ("A", Axis::Z) => std::f64::consts::FRAC_PI_2,
                ("B", Axis::Z) => std::f64::consts::PI,
                _ => 0.0,
            })
        });
        assert_abs_diff_eq!(total.value, 0.0, epsilon = 1e-12);
        assert!(total.gradient.amax() < 1e-12);

        // Off target by 60 degrees: |vector part|^2 = sin^2(30 deg).
        let (_, total) = evaluate(&[c], |k| {
            Ok(match (k.object.as_str(), k.axis) {
                ("B", Axis::Z) => 30f64.to_radians(),
                _ => 0.0,
            })
        });
        assert_abs_diff_eq!(total.value, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_fix_rotation_ignores_disabled_axes() {
        let enabled = EnabledAxes::new(AxisTriple::splat(false), AxisTriple::new(true, false, false));
        let values = FixedValues::new(AxisTriple::splat(0.0), AxisTriple::new(45.0, 0.0, 0.0));
        let c = Constraint::fix("B", "A", enabled, values).unwrap();
        let (_, total) = evaluate(&[c], |k| {
            Ok(match (k.object.as_str(), k.axis) {
                ("B", Axis::X) => 45f64.to_radians(),
                ("B", Axis::Y) => 0.4,
                ("B", Axis::Z) => -1.2,
                _ => 0.0,
            })
        });
        assert_abs_diff_eq!(total.value, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_selection_errors() {
        assert!(matches!(
            Constraint::fix("A", "A", EnabledAxes::all(), FixedValues::default()),
            Err(SolverError::Selection { .. })
        ));
        assert!(matches!(
            Constraint::equality("", "B", EnabledAxes::all()),
            Err(SolverError::Selection { .. })
        ));
    }

    #[test]
    fn test_no_enabled_axes_is_underdetermined() {
        let c = Constraint::lock("A", EnabledAxes::none(), FixedValues::default()).unwrap();
        assert!(matches!(
            c.check_enabled(),
            Err(SolverError::Underdetermined { .. })
        ));
    }

    #[test]
    fn test_update_from_edited_fields_is_canonical() {
        let c = Constraint::lock("A", EnabledAxes::all(), FixedValues::base(1.0, 2.0, 3.0)).unwrap();
        let fields = EditedFields {
            enabled: EnabledAxes::new(AxisTriple::new(false, true, false), AxisTriple::splat(false)),
            values: FixedValues::base(9.0, 8.0, 7.0),
        };
        let updated = c.update_from_edited_fields(&fields).unwrap();
        match updated {
            Constraint::Lock { object, enabled, values } => {
                assert_eq!(object, ObjectId::from("A"));
                assert_eq!(enabled, fields.enabled);
                assert_eq!(values, FixedValues::base(0.0, 8.0, 0.0));
            }
            other => panic!("unexpected constraint {other:?}"),
        }
        // The original is untouched.
        assert_eq!(c.enabled(), &EnabledAxes::all());
    }

    #[test]
    fn test_constraint_json_is_tagged() {
        let c = Constraint::equality("A", "B", EnabledAxes::base_only()).unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "Equality");
        assert_eq!(json["object_1"], "A");
        assert_eq!(json["enabled"]["base"]["x"], true);
    }
}
