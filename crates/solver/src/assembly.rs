//! Assembly placement solving.
//!
//! A solve turns the host's constraints into one scalar objective, the sum of
//! every constraint's squared residuals, and minimizes it over the free
//! placement variables with the Newton-CG trust-region method. Exact
//! gradients and Hessians come from hyper-dual arithmetic, so no finite
//! differences are involved.
//!
//! Flow of one [`solve_assembly`] call:
//!
//! 1. discover variables (Equality aliases, Lock pins, Fix placements)
//! 2. number the free variables and seed all values from the host
//! 3. minimize
//! 4. on convergence, write every registered variable back to the host

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DVector, UnitQuaternion, Vector3};
use tracing::{debug, info, instrument, warn};

use crate::config::SolverConfig;
use crate::constraint::{Components, Constraint};
use crate::error::{Result, SolverError};
use crate::host::{Placement, PlacementHost};
use crate::hyperdual::HyperDual;
use crate::placement::{EvaluationContext, PlacementCache, ResolvedVariables};
use crate::trust_region::{Evaluation, Objective, SolveStatus, minimize};
use crate::variable::{ObjectId, PlacementKind, VariableKey, VariableRegistry};

// ── Problem ──────────────────────────────────────────────────────────────────

/// A discovered and seeded placement problem, ready to minimize.
#[derive(Debug)]
pub struct AssemblyProblem {
    pub registry: VariableRegistry,
    /// Constraints that take part in the objective.
    pub constraints: Vec<Constraint>,
    /// Starting point: the seed values of the free variables.
    pub x0: DVector<f64>,
}

impl AssemblyProblem {
    pub fn free_variables(&self) -> usize {
        self.registry.free_count()
    }

    pub fn objective(&self) -> Result<AssemblyObjective<'_>> {
        Ok(AssemblyObjective {
            registry: &self.registry,
            constraints: &self.constraints,
            variables: ResolvedVariables::seed(&self.registry)?,
            last: None,
        })
    }
}

/// Discover the variables of `constraints` and seed them from `host`.
///
/// Constraints without any enabled slot are skipped. Every host object is
/// queried at most once.
#[instrument(skip_all, fields(constraints = constraints.len()))]
pub fn build_problem<H: PlacementHost + ?Sized>(
    host: &H,
    constraints: &[Constraint],
    config: &SolverConfig,
) -> Result<AssemblyProblem> {
    let mut registry = VariableRegistry::new();
    let mut active = Vec::with_capacity(constraints.len());
    for constraint in constraints {
        constraint.check_selection()?;
        if let Err(err) = constraint.check_enabled() {
            debug!(%err, "skipping constraint");
            continue;
        }
        constraint.discover_variables(&mut registry)?;
        active.push(constraint.clone());
    }

    let free = registry.assign_indices()?;

    let mut seeds: HashMap<ObjectId, Components<f64>> = HashMap::new();
    registry.seed_current_values(|key| {
        let components = match seeds.get(&key.object) {
            Some(components) => *components,
            None => {
                let components = host
                    .placement(&key.object)?
                    .components(config.normalize_angles);
                seeds.insert(key.object.clone(), components);
                components
            }
        };
        Ok(components.of(key.kind).get(key.axis))
    })?;

    info!(
        constraints = active.len(),
        variables = registry.len(),
        free,
        "assembly problem built"
    );

    let x0 = DVector::from_vec(registry.initial_guess());
    Ok(AssemblyProblem {
        registry,
        constraints: active,
        x0,
    })
}

// ── Objective ────────────────────────────────────────────────────────────────

/// Sum of squared constraint residuals over the free variables.
///
/// The last evaluation is memoized on the trial vector, so evaluating the
/// same point twice rebuilds nothing.
pub struct AssemblyObjective<'a> {
    registry: &'a VariableRegistry,
    constraints: &'a [Constraint],
    variables: ResolvedVariables,
    last: Option<(DVector<f64>, Evaluation)>,
}

impl AssemblyObjective<'_> {
    /// Final value of every registered variable at `x`, aliases and locked
    /// variables included.
    pub fn values_at(&mut self, x: &DVector<f64>) -> BTreeMap<VariableKey, f64> {
        self.variables.set_unknowns(x.as_slice());
        self.registry
            .ids()
            .map(|id| {
                (
                    self.registry.variable(id).key.clone(),
                    self.variables.value(id).value,
                )
            })
            .collect()
    }
}

impl Objective for AssemblyObjective<'_> {
    fn dimension(&self) -> usize {
        self.variables.dimension()
    }

    fn evaluate(&mut self, x: &DVector<f64>) -> Result<Evaluation> {
        if let Some((last_x, last)) = &self.last {
            if last_x == x {
                return Ok(last.clone());
            }
        }

        self.variables.set_unknowns(x.as_slice());
        let placements = PlacementCache::build(self.registry, &self.variables)?;
        let ctx = EvaluationContext {
            registry: self.registry,
            variables: &self.variables,
            placements: &placements,
        };
        let mut total = HyperDual::zero(self.variables.dimension());
        for constraint in self.constraints {
            total += constraint.build_residual(&ctx)?;
        }

        let evaluation = Evaluation::from(total);
        self.last = Some((x.clone(), evaluation.clone()));
        Ok(evaluation)
    }
}

// ── Solve ────────────────────────────────────────────────────────────────────

/// Outcome of a converged assembly solve.
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub status: SolveStatus,
    pub iterations: usize,
    /// Objective value at the solution.
    pub objective: f64,
    pub gradient_norm: f64,
    pub free_variables: usize,
    /// Final value of every registered variable. Angles are in radians.
    pub values: BTreeMap<VariableKey, f64>,
}

impl SolveReport {
    pub fn value(&self, key: &VariableKey) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// Solve `constraints` against the placements in `host` and write the result
/// back. On failure the host is left untouched.
#[instrument(skip_all, fields(constraints = constraints.len()))]
pub fn solve_assembly<H: PlacementHost + ?Sized>(
    host: &mut H,
    constraints: &[Constraint],
    config: &SolverConfig,
) -> Result<SolveReport> {
    let problem = build_problem(&*host, constraints, config)?;
    let mut objective = problem.objective()?;
    let result = minimize(&mut objective, problem.x0.clone(), &config.trust_region)?;

    if !result.converged() {
        warn!(
            status = ?result.status,
            iterations = result.iterations,
            gradient_norm = result.gradient_norm,
            "assembly did not converge; placements unchanged"
        );
        return Err(SolverError::DidNotConverge {
            status: result.status,
            iterations: result.iterations,
            gradient_norm: result.gradient_norm,
        });
    }

    let values = objective.values_at(&result.x);
    write_back(host, &values)?;

    info!(
        iterations = result.iterations,
        objective = result.objective,
        free = problem.free_variables(),
        "assembly solved"
    );

    Ok(SolveReport {
        status: result.status,
        iterations: result.iterations,
        objective: result.objective,
        gradient_norm: result.gradient_norm,
        free_variables: problem.free_variables(),
        values,
    })
}

/// Per-object slots touched by a solve; `None` keeps the host's value.
type SolvedSlots = Components<Option<f64>>;

/// Apply solved values, one placement update per object. All placements are
/// read before the first write.
fn write_back<H: PlacementHost + ?Sized>(
    host: &mut H,
    values: &BTreeMap<VariableKey, f64>,
) -> Result<()> {
    let mut solved: BTreeMap<&ObjectId, SolvedSlots> = BTreeMap::new();
    for (key, value) in values {
        let slots = solved.entry(&key.object).or_insert_with(|| Components::splat(None));
        let triple = match key.kind {
            PlacementKind::Base => &mut slots.base,
            PlacementKind::Rotation => &mut slots.rotation,
        };
        triple.set(key.axis, Some(*value));
    }

    let mut updates = Vec::with_capacity(solved.len());
    for (object, slots) in &solved {
        let current = host.placement(object)?;
        updates.push((*object, apply_slots(&current, slots)));
    }

    for (object, placement) in updates {
        debug!(%object, base = ?placement.base, "writing placement");
        host.set_placement(object, placement)?;
    }
    Ok(())
}

fn apply_slots(current: &Placement, slots: &SolvedSlots) -> Placement {
    let base = Vector3::new(
        slots.base.x.unwrap_or(current.base.x),
        slots.base.y.unwrap_or(current.base.y),
        slots.base.z.unwrap_or(current.base.z),
    );
    let rotation = if slots.rotation.iter().any(|(_, v)| v.is_some()) {
        let [x, y, z] = current.euler_xyz();
        UnitQuaternion::from_euler_angles(
            slots.rotation.x.unwrap_or(x),
            slots.rotation.y.unwrap_or(y),
            slots.rotation.z.unwrap_or(z),
        )
    } else {
        current.rotation
    };
    Placement::new(base, rotation)
}
