//! Host-side placements and the in-memory document.
//!
//! The solver never reaches into a global document. Everything it reads or
//! writes goes through [`PlacementHost`], which a CAD host implements over its
//! own object model. [`Document`] is a small serializable implementation used
//! by the tests and by callers that keep placements in memory.

use std::collections::BTreeMap;
use std::f64::consts::TAU;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::assembly::{SolveReport, solve_assembly};
use crate::config::SolverConfig;
use crate::constraint::{AxisTriple, Components, Constraint};
use crate::error::{Result, SolverError};
use crate::variable::ObjectId;

/// Position and orientation of one object.
///
/// Rotations decompose as `R = Rz(z) * Ry(y) * Rx(x)`, the same composition
/// the solver uses for its Rotation variables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PlacementRecord", into = "PlacementRecord")]
pub struct Placement {
    pub base: Vector3<f64>,
    pub rotation: UnitQuaternion<f64>,
}

impl Default for Placement {
    fn default() -> Self {
        Self::identity()
    }
}

impl Placement {
    pub fn new(base: Vector3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self { base, rotation }
    }

    pub fn identity() -> Self {
        Self::new(Vector3::zeros(), UnitQuaternion::identity())
    }

    pub fn from_translation(x: f64, y: f64, z: f64) -> Self {
        Self::new(Vector3::new(x, y, z), UnitQuaternion::identity())
    }

    /// Build from a base and `[x, y, z]` Euler angles in radians.
    pub fn from_euler_xyz(base: Vector3<f64>, angles: [f64; 3]) -> Self {
        let [x, y, z] = angles;
        Self::new(base, UnitQuaternion::from_euler_angles(x, y, z))
    }

    /// `[x, y, z]` Euler angles in radians.
    pub fn euler_xyz(&self) -> [f64; 3] {
        let (x, y, z) = self.rotation.euler_angles();
        [x, y, z]
    }

    /// The six scalar slots a solve seeds its variables from. With
    /// `normalize_angles`, negative angles are shifted into `[0, 2*pi)`.
    pub fn components(&self, normalize_angles: bool) -> Components<f64> {
        let angle = |a: f64| if normalize_angles && a < 0.0 { a + TAU } else { a };
        let [x, y, z] = self.euler_xyz();
        Components::new(
            AxisTriple::new(self.base.x, self.base.y, self.base.z),
            AxisTriple::new(angle(x), angle(y), angle(z)),
        )
    }
}

/// Serialized form: base coordinates and Euler angles in degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PlacementRecord {
    base: [f64; 3],
    #[serde(default)]
    rotation: [f64; 3],
}

impl From<PlacementRecord> for Placement {
    fn from(record: PlacementRecord) -> Self {
        Placement::from_euler_xyz(
            Vector3::from(record.base),
            record.rotation.map(f64::to_radians),
        )
    }
}

impl From<Placement> for PlacementRecord {
    fn from(placement: Placement) -> Self {
        PlacementRecord {
            base: placement.base.into(),
            rotation: placement.euler_xyz().map(f64::to_degrees),
        }
    }
}

/// Read and write access to object placements.
pub trait PlacementHost {
    fn placement(&self, object: &ObjectId) -> Result<Placement>;
    fn set_placement(&mut self, object: &ObjectId, placement: Placement) -> Result<()>;
}

/// In-memory snapshot of placements and the constraints between them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, Placement>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, object: impl Into<ObjectId>, placement: Placement) {
        self.objects.insert(object.into(), placement);
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Solve this document's constraints and update its placements.
    pub fn solve(&mut self, config: &SolverConfig) -> Result<SolveReport> {
        let constraints = self.constraints.clone();
        solve_assembly(self, &constraints, config)
    }
}

impl PlacementHost for Document {
    fn placement(&self, object: &ObjectId) -> Result<Placement> {
        self.objects
            .get(object)
            .copied()
            .ok_or_else(|| SolverError::UnknownObject {
                object: object.clone(),
            })
    }

    fn set_placement(&mut self, object: &ObjectId, placement: Placement) -> Result<()> {
        match self.objects.get_mut(object) {
            Some(slot) => {
                *slot = placement;
                Ok(())
            }
            None => Err(SolverError::UnknownObject {
                object: object.clone(),
            }),
        }
    }
}
