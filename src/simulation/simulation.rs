use std::fmt::{self, Display};

use nalgebra::zero;
use num_traits::Float;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    concurrency::{par_count_mut1, par_iter_mut1},
    floating_type_mod::{FT, TAU},
    implicit_solver::{ImplicitSolver, ImplicitSolverStats},
    sanitize::{is_finite_vector, sanitize_vectors},
    simulation_parameters::SimulationParams,
    sparse_matrix::SparseMatrixError,
    spatial_hash::{SpatialHashGrid, SpatialHashStats},
    sph_kernels::{cubic_kernel_2d, spiky_kernel_2d_grad, viscosity_kernel_2d_laplacian},
    statistics::{PerformanceCounters, ValueCounters},
    vec2f, V2, V3, V4,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SimulationError {
    /// the implicit system could not be assembled or solved, this is a bug and not a physical edge case
    Assembly(SparseMatrixError),
    DragFieldLength { expected: usize, got: usize },
}

impl Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::Assembly(err) => write!(f, "implicit system assembly failed: {}", err),
            SimulationError::DragFieldLength { expected, got } => {
                write!(f, "drag field has {} entries but there are {} particles", got, expected)
            }
        }
    }
}

impl std::error::Error for SimulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimulationError::Assembly(err) => Some(err),
            SimulationError::DragFieldLength { .. } => None,
        }
    }
}

impl From<SparseMatrixError> for SimulationError {
    fn from(err: SparseMatrixError) -> Self {
        SimulationError::Assembly(err)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Phase {
    Liquid,
    Gel,
}

impl Phase {
    pub fn from_temperature(temperature: FT, gel_temperature: FT) -> Phase {
        if temperature < gel_temperature {
            Phase::Gel
        } else {
            Phase::Liquid
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Phase::Liquid => 0,
            Phase::Gel => 1,
        }
    }
}

macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        #[derive(Debug, Clone)]
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn extend(&mut self, num_elements: usize) {
                $(
                    self.$field_name.extend((0..num_elements).map::<$field_type, _>(|_| $default_value));
                )*
            }

            pub fn default(len: usize) -> Self {
                Self {
                    $(
                        $field_name: (0..len).map(|_| $default_value).collect::<Vec<$field_type>>(),
                    )*
                }
            }
        }
    }
}

decl_particle_vec! {
    pub struct ParticleVec {
        pub position: Vec<V2> | zero(),
        pub velocity: Vec<V2> | zero(),
        pub force: Vec<V2> | zero(),

        pub density: Vec<FT> | 0.,
        pub pressure: Vec<FT> | 0.,

        // carried for rendering and export, the physics never reads these
        pub temperature: Vec<FT> | 0.,
        pub phase: Vec<Phase> | Phase::Liquid,
        pub color: Vec<V3> | zero(),
    }
}

impl ParticleVec {
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}

/// What a point-sprite renderer needs per particle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParticle {
    pub position: V2,
    /// premultiplied RGBA
    pub color: V4,
    pub density: FT,
}

/// Outcome of one simulation step. Repair counts are non-finite values that were reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepReport {
    pub repaired_densities: usize,
    pub repaired_pressures: usize,
    pub repaired_forces: usize,
    pub repaired_velocities: usize,
    pub repaired_positions: usize,
    pub boundary_collisions: usize,
    pub implicit: Option<ImplicitSolverStats>,
}

impl StepReport {
    pub fn total_repaired(&self) -> usize {
        self.repaired_densities
            + self.repaired_pressures
            + self.repaired_forces
            + self.repaired_velocities
            + self.repaired_positions
    }
}

/// Sums `m W(r, h)` over all particles within the kernel support.
///
/// The result is floored at a fraction of the rest density. A non-finite sum is replaced by
/// the rest density. Returns the number of such replacements.
pub fn compute_densities(
    params: &SimulationParams,
    grid: &SpatialHashGrid,
    position: &[V2],
    density: &mut [FT],
) -> usize {
    let h = params.h;
    let support_radius = params.support_radius();
    let m = params.particle_mass;
    let density_floor = params.density_floor();

    par_count_mut1(density, |i, p_density| {
        let xi = position[i];
        let mut sum = 0.;
        grid.for_each_candidate(xi.x, xi.y, support_radius, |j| {
            let r = (xi - position[j]).norm();
            if r < support_radius {
                sum += m * cubic_kernel_2d(r, h);
            }
        });

        if sum.is_finite() {
            *p_density = sum.max(density_floor);
            false
        } else {
            *p_density = params.rest_density;
            true
        }
    })
}

/// Tait equation of state, clamped to be tension-free (`p >= 0`).
pub fn compute_pressures(params: &SimulationParams, density: &[FT], pressure: &mut [FT]) -> usize {
    par_count_mut1(pressure, |i, p_pressure| {
        let density_ratio = density[i] / params.rest_density;
        let p = params.eos_stiffness * (density_ratio.powi(params.eos_power) - 1.);
        if p.is_finite() {
            *p_pressure = p.max(0.);
            false
        } else {
            *p_pressure = 0.;
            true
        }
    })
}

/// Accumulates pressure, viscosity, cohesion, center gravity and spin into `force`.
pub fn compute_forces(
    params: &SimulationParams,
    grid: &SpatialHashGrid,
    rotation_rate: FT,
    position: &[V2],
    velocity: &[V2],
    density: &[FT],
    pressure: &[FT],
    force: &mut [V2],
) -> usize {
    let support_radius = params.support_radius();
    let m = params.particle_mass;

    // pressure and viscosity share one neighbor pass
    par_iter_mut1(force, |i, p_force| {
        let xi = position[i];
        let pressure_term_i = pressure[i] / (density[i] * density[i]);
        let mut f: V2 = zero();

        grid.for_each_candidate(xi.x, xi.y, support_radius, |j| {
            if j == i {
                return;
            }
            let x_ij = xi - position[j];
            let r = x_ij.norm();
            if r >= support_radius {
                return;
            }

            let pressure_term_j = pressure[j] / (density[j] * density[j]);
            f -= spiky_kernel_2d_grad(x_ij, support_radius) * (m * m * (pressure_term_i + pressure_term_j));

            let laplacian = viscosity_kernel_2d_laplacian(r, support_radius);
            f += (velocity[j] - velocity[i]) * (params.viscosity * m * m * laplacian / (density[i] * density[j]));
        });

        *p_force = f;
    });

    // two-scale cohesion
    let short = params.cohesion_short();
    let long = params.cohesion_long();
    let min_distance = params.cohesion_min_distance_world();
    let cohesion_radius = short.range.max(long.range);
    par_iter_mut1(force, |i, p_force| {
        let xi = position[i];
        let mut f: V2 = zero();

        grid.for_each_candidate(xi.x, xi.y, cohesion_radius, |j| {
            if j == i {
                return;
            }
            let x_ji = position[j] - xi;
            let r = x_ji.norm();
            if r < min_distance || r >= cohesion_radius {
                return;
            }
            let magnitude = short.magnitude(r, min_distance) + long.magnitude(r, min_distance);
            f += x_ji * (magnitude / r);
        });

        *p_force += f;
    });

    // both body forces are linear in the position, so they act on the centroid like on a single particle
    let gravity = params.center_gravity * m / params.container_radius;
    par_iter_mut1(force, |i, p_force| {
        let x = position[i];
        *p_force -= x * gravity;
        *p_force += vec2f(-x.y, x.x) * (rotation_rate * m);
    });

    sanitize_vectors(force, zero())
}

/// Global exponential damping followed by the speed cap.
pub fn limit_velocities(params: &SimulationParams, dt: FT, velocity: &mut [V2]) {
    let damping = (-params.damping * dt).exp();
    let max_speed = params.max_speed;
    par_iter_mut1(velocity, |_, v| {
        *v *= damping;
        let speed = v.norm();
        if speed > max_speed {
            *v *= max_speed / speed;
        }
    });
}

/// Semi-implicit Euler velocity update. Non-finite velocities are reset to zero.
pub fn integrate_velocities(params: &SimulationParams, dt: FT, force: &[V2], velocity: &mut [V2]) -> usize {
    let dt_by_mass = dt / params.particle_mass;
    par_iter_mut1(velocity, |i, v| {
        *v += force[i] * dt_by_mass;
    });
    let repaired = sanitize_vectors(velocity, zero());
    limit_velocities(params, dt, velocity);
    repaired
}

/// `x += v dt`. Non-finite positions are moved back to the container center.
pub fn integrate_positions(dt: FT, velocity: &[V2], position: &mut [V2]) -> usize {
    par_iter_mut1(position, |i, x| {
        *x += velocity[i] * dt;
    });
    sanitize_vectors(position, zero())
}

/// Projects escaped particles back onto the container circle and reflects their outward
/// velocity with the restitution factor. Returns the number of collisions.
pub fn enforce_boundaries(params: &SimulationParams, position: &mut [V2], velocity: &mut [V2]) -> usize {
    let radius = params.container_radius;
    let restitution = params.boundary_restitution;
    let mut collisions = 0;

    for (x, v) in position.iter_mut().zip(velocity.iter_mut()) {
        let dist = x.norm();
        if !dist.is_finite() {
            *x = zero();
            *v = zero();
            collisions += 1;
            continue;
        }
        if dist <= radius {
            continue;
        }

        let normal = *x / dist;
        *x = normal * radius;
        let normal_speed = v.dot(&normal);
        if normal_speed > 0. {
            *v -= normal * ((1. + restitution) * normal_speed);
        }
        collisions += 1;
    }

    collisions
}

/// Owns every particle array and all solver state. Nothing is global.
#[derive(Debug, Clone)]
pub struct FluidSimulation {
    pub particles: ParticleVec,
    pub time: FT,

    params: SimulationParams,
    grid: SpatialHashGrid,
    implicit_solver: ImplicitSolver,

    // aligned 1:1 with the particles
    drag: Option<Vec<V2>>,

    rng: StdRng,
    step_number: usize,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,
}

fn make_grid(params: &SimulationParams) -> SpatialHashGrid {
    SpatialHashGrid::new(params.support_radius(), params.container_radius + params.support_radius())
}

impl FluidSimulation {
    pub fn new(params: SimulationParams, counters_enabled: bool) -> Self {
        log::info!(
            "simulation: h={} container radius={} particle limit={} implicit={}",
            params.h,
            params.container_radius,
            params.particle_limit(),
            params.implicit.enabled
        );

        FluidSimulation {
            particles: ParticleVec::default(0),
            time: 0.,
            grid: make_grid(&params),
            implicit_solver: ImplicitSolver::new(params.implicit.preconditioner),
            drag: None,
            rng: StdRng::seed_from_u64(params.seed),
            step_number: 0,
            pcounters: PerformanceCounters::new(counters_enabled),
            vcounters: ValueCounters::new(counters_enabled),
            params,
        }
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Changing `h` or the container radius rebuilds the (empty) grid layout.
    pub fn set_params(&mut self, params: SimulationParams) {
        if params.h != self.params.h || params.container_radius != self.params.container_radius {
            self.grid = make_grid(&params);
        }
        self.params = params;
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    pub fn step_number(&self) -> usize {
        self.step_number
    }

    pub fn performance_counters(&self) -> &PerformanceCounters {
        &self.pcounters
    }

    pub fn value_counters(&self) -> &ValueCounters {
        &self.vcounters
    }

    pub fn grid_stats(&self) -> SpatialHashStats {
        self.grid.stats()
    }

    pub fn implicit_stats(&self) -> ImplicitSolverStats {
        self.implicit_solver.stats()
    }

    /// Creates up to `count` particles jittered inside a small disk around `center`.
    ///
    /// The count is clamped so the particle limit is never exceeded, the return value is the
    /// number of particles actually created.
    pub fn spawn_particles(&mut self, center: V2, count: usize, color: V3, temperature: FT) -> usize {
        let limit = self.params.particle_limit();
        let available = limit.saturating_sub(self.num_particles());
        let actual = count.min(available);
        if actual < count {
            log::warn!(
                "spawn of {} particles clamped to {} (particle limit {})",
                count,
                actual,
                limit
            );
        }
        if actual == 0 {
            return 0;
        }

        let spawn_radius = self.params.spawn_radius_world();
        let max_center_distance = (self.params.container_radius - spawn_radius).max(0.);
        let mut center = if is_finite_vector(&center) { center } else { zero() };
        let center_distance = center.norm();
        if center_distance > max_center_distance {
            center *= max_center_distance / center_distance;
        }

        let phase = Phase::from_temperature(temperature, self.params.gel_temperature);
        let start = self.num_particles();
        self.particles.extend(actual);

        for i in start..start + actual {
            let r = spawn_radius * self.rng.gen::<FT>().sqrt();
            let phi = self.rng.gen_range(0. ..TAU);
            self.particles.position[i] = center + vec2f(r * phi.cos(), r * phi.sin());
            self.particles.density[i] = self.params.rest_density;
            self.particles.temperature[i] = temperature;
            self.particles.phase[i] = phase;
            self.particles.color[i] = color;
        }

        if let Some(drag) = &mut self.drag {
            drag.resize(start + actual, zero());
        }

        log::debug!(
            "spawned {} {:?} particles at ({:.3}, {:.3}), {} total",
            actual,
            phase,
            center.x,
            center.y,
            self.num_particles()
        );
        actual
    }

    /// Per-particle external velocity field used by the implicit drag term.
    pub fn set_drag_field(&mut self, drag: Option<Vec<V2>>) -> Result<(), SimulationError> {
        if let Some(drag) = &drag {
            if drag.len() != self.num_particles() {
                return Err(SimulationError::DragFieldLength {
                    expected: self.num_particles(),
                    got: drag.len(),
                });
            }
        }
        self.drag = drag;
        Ok(())
    }

    /// Hash rebuild, densities, pressures and forces for the current state.
    fn compute_explicit_state(&mut self, rotation_rate: FT, report: &mut StepReport) {
        let params = &self.params;
        let particles = &mut self.particles;

        self.pcounters.begin("1-spatial-hash");
        self.grid.rebuild(&particles.position);
        self.pcounters.end("1-spatial-hash");

        self.pcounters.begin("2-densities");
        report.repaired_densities = compute_densities(params, &self.grid, &particles.position, &mut particles.density);
        self.pcounters.end("2-densities");

        self.pcounters.begin("3-pressures");
        report.repaired_pressures = compute_pressures(params, &particles.density, &mut particles.pressure);
        self.pcounters.end("3-pressures");

        self.pcounters.begin("4-forces");
        report.repaired_forces = compute_forces(
            params,
            &self.grid,
            rotation_rate,
            &particles.position,
            &particles.velocity,
            &particles.density,
            &particles.pressure,
            &mut particles.force,
        );
        self.pcounters.end("4-forces");
    }

    fn finish_step(&mut self, dt: FT, report: &mut StepReport) {
        self.pcounters.begin("6-positions");
        report.repaired_positions = integrate_positions(dt, &self.particles.velocity, &mut self.particles.position);
        report.boundary_collisions =
            enforce_boundaries(&self.params, &mut self.particles.position, &mut self.particles.velocity);
        self.pcounters.end("6-positions");

        self.time += dt;
        self.step_number += 1;
        self.pcounters.end("simulation-step");

        self.vcounters.add_value("particle-count", self.num_particles() as FT);
        self.vcounters.add_value("boundary-collisions", report.boundary_collisions as FT);
        if let Some(stats) = &report.implicit {
            self.vcounters.add_value("cg-iterations", stats.iterations as FT);
            self.vcounters.add_value("cg-residual", stats.residual);
        }

        if report.total_repaired() > 0 {
            log::warn!("step {}: repaired non-finite values {:?}", self.step_number, report);
        }
        if log::log_enabled!(log::Level::Debug) {
            let (min_density, max_density) = self.density_range();
            log::debug!(
                "step {}: {} particles, density [{:.1}, {:.1}]",
                self.step_number,
                self.num_particles(),
                min_density,
                max_density
            );
        }
    }

    /// One explicit step: hash, densities, pressures, forces, semi-implicit Euler, boundary.
    pub fn update(&mut self, dt: FT, rotation_rate: FT) -> StepReport {
        let mut report = StepReport::default();
        self.pcounters.begin("simulation-step");
        self.compute_explicit_state(rotation_rate, &mut report);

        self.pcounters.begin("5-velocities");
        report.repaired_velocities = integrate_velocities(
            &self.params,
            dt,
            &self.particles.force,
            &mut self.particles.velocity,
        );
        self.pcounters.end("5-velocities");

        self.finish_step(dt, &mut report);
        report
    }

    /// Replaces the particle velocities with the implicit solution for the forces of this step.
    ///
    /// The spatial hash, densities and forces must be current, as they are right after the
    /// force stage of a step.
    pub fn solve_implicit(&mut self, dt: FT) -> Result<ImplicitSolverStats, SimulationError> {
        let stats = self.implicit_solver.solve(
            &mut self.particles,
            &self.grid,
            &self.params,
            self.drag.as_deref(),
            dt,
        )?;
        self.pcounters.add_duration("5-implicit-build", stats.build_time);
        self.pcounters.add_duration("5-implicit-solve", stats.solve_time);
        Ok(stats)
    }

    /// Like [`Self::update`], but the velocity update goes through the implicit solver when it
    /// is enabled in the parameters.
    ///
    /// The explicit forces still enter the right hand side in full, even for the terms that are
    /// also linearized into the system matrix.
    pub fn step(&mut self, dt: FT, rotation_rate: FT) -> Result<StepReport, SimulationError> {
        if !self.params.implicit.enabled {
            return Ok(self.update(dt, rotation_rate));
        }

        let mut report = StepReport::default();
        self.pcounters.begin("simulation-step");
        self.compute_explicit_state(rotation_rate, &mut report);

        let stats = self.solve_implicit(dt)?;
        report.repaired_velocities = stats.repaired_velocities;
        report.implicit = Some(stats);
        limit_velocities(&self.params, dt, &mut self.particles.velocity);

        self.finish_step(dt, &mut report);
        Ok(report)
    }

    /// Position, premultiplied color and density of every particle.
    ///
    /// Alpha is `clamp(density / rest_density, min_alpha, 1)`.
    pub fn render_particles(&self) -> impl Iterator<Item = RenderParticle> + '_ {
        let rest_density = self.params.rest_density;
        let min_alpha = self.params.min_alpha.min(1.);
        (0..self.num_particles()).map(move |i| {
            let density = self.particles.density[i];
            let alpha = (density / rest_density).max(min_alpha).min(1.);
            let c = self.particles.color[i] * alpha;
            RenderParticle {
                position: self.particles.position[i],
                color: V4::new(c.x, c.y, c.z, alpha),
                density,
            }
        })
    }

    pub fn centroid(&self) -> V2 {
        if self.particles.is_empty() {
            return zero();
        }
        self.particles.position.iter().sum::<V2>() / self.num_particles() as FT
    }

    pub fn kinetic_energy(&self) -> FT {
        let m = self.params.particle_mass;
        self.particles.velocity.iter().map(|v| 0.5 * m * v.norm_squared()).sum()
    }

    pub fn momentum(&self) -> V2 {
        self.particles.velocity.iter().sum::<V2>() * self.params.particle_mass
    }

    pub fn density_range(&self) -> (FT, FT) {
        self.particles
            .density
            .iter()
            .fold((FT::INFINITY, FT::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)))
    }
}

pub fn is_ft_approx_eq<FT: Float>(a: FT, b: FT, tolerance: FT) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<FT: Float + Display>(a: FT, b: FT, tolerance: FT, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

#[cfg(test)]
fn orange() -> V3 {
    crate::vec3f(1., 0.5, 0.)
}

#[cfg(test)]
fn assert_all_finite(sim: &FluidSimulation) {
    let p = &sim.particles;
    assert!(p.position.iter().all(is_finite_vector));
    assert!(p.velocity.iter().all(is_finite_vector));
    assert!(p.force.iter().all(is_finite_vector));
    assert!(p.density.iter().all(|d| d.is_finite()));
    assert!(p.pressure.iter().all(|d| d.is_finite()));
}

#[test]
fn densities_are_floored_and_finite() {
    let mut params = SimulationParams::default();
    params.particle_mass = 1e-6;

    let position = vec![vec2f(0., 0.), vec2f(0.01, 0.), vec2f(0.9, 0.), vec2f(FT::NAN, 0.)];
    let mut density = vec![0.; position.len()];
    let mut grid = make_grid(&params);
    grid.rebuild(&position);

    compute_densities(&params, &grid, &position, &mut density);
    for d in &density {
        assert!(d.is_finite());
        assert!(*d >= params.density_floor());
    }

    // a lonely particle with a realistic mass only sees itself
    let params = SimulationParams::default();
    compute_densities(&params, &grid, &position, &mut density);
    let self_density = params.particle_mass * cubic_kernel_2d(0., params.h);
    assert_ft_approx_eq(density[2], self_density, 1e-3 * self_density, || format!("isolated density"));
}

#[test]
fn densities_of_packed_particles_exceed_self_contribution() {
    let params = SimulationParams::default();
    let mut position = Vec::new();
    for y in 0..5 {
        for x in 0..5 {
            position.push(vec2f(x as FT * 0.5 * params.h, y as FT * 0.5 * params.h));
        }
    }
    let mut density = vec![0.; position.len()];
    let mut grid = make_grid(&params);
    grid.rebuild(&position);
    assert_eq!(compute_densities(&params, &grid, &position, &mut density), 0);

    let self_density = params.particle_mass * cubic_kernel_2d(0., params.h);
    // the center particle sees the whole patch
    assert!(density[12] > 4. * self_density);
    assert!(density.iter().all(|&d| d > self_density));
}

#[test]
fn pressure_is_zero_at_and_below_rest_density() {
    let params = SimulationParams::default();
    let density = vec![0., 0.5 * params.rest_density, params.rest_density, 2. * params.rest_density];
    let mut pressure = vec![-1.; 4];
    assert_eq!(compute_pressures(&params, &density, &mut pressure), 0);
    assert_eq!(&pressure[..3], &[0., 0., 0.]);
    let expected = params.eos_stiffness * (2f32.powi(7) - 1.);
    assert_ft_approx_eq(pressure[3], expected, 1e-3, || format!("tait pressure"));
}

#[test]
fn pairwise_forces_conserve_momentum() {
    let mut params = SimulationParams::default();
    params.center_gravity = 0.;
    params.spawn_radius = 2.;
    let mut sim = FluidSimulation::new(params, false);
    sim.spawn_particles(zero(), 40, orange(), 30.);
    for (i, v) in sim.particles.velocity.iter_mut().enumerate() {
        *v = vec2f((i as FT * 0.7).sin(), (i as FT * 1.3).cos()) * 0.1;
    }

    let mut report = StepReport::default();
    sim.compute_explicit_state(0., &mut report);
    assert_eq!(report.total_repaired(), 0);

    let total: V2 = sim.particles.force.iter().sum();
    let scale: FT = sim.particles.force.iter().map(|f| f.norm()).sum();
    assert!(scale > 0.);
    assert!(total.norm() <= 1e-4 * scale, "net force {:?} of {}", total, scale);
}

#[test]
fn spin_adds_tangential_force() {
    let mut params = SimulationParams::default();
    params.center_gravity = 0.;
    let position = vec![vec2f(0.5, 0.)];
    let velocity = vec![zero()];
    let density = vec![params.rest_density];
    let pressure = vec![0.];
    let mut force = vec![zero()];
    let mut grid = make_grid(&params);
    grid.rebuild(&position);

    compute_forces(&params, &grid, 2., &position, &velocity, &density, &pressure, &mut force);
    assert_ft_approx_eq(force[0].x, 0., 1e-6, || format!("radial"));
    assert_ft_approx_eq(force[0].y, 2. * params.particle_mass * 0.5, 1e-5, || format!("tangential"));
}

#[cfg(test)]
fn pair_cohesion_force(params: &SimulationParams, distance: FT) -> [V2; 2] {
    let position = vec![vec2f(-0.5 * distance, 0.), vec2f(0.5 * distance, 0.)];
    let velocity = vec![zero(); 2];
    let density = vec![params.rest_density; 2];
    let pressure = vec![0.; 2];
    let mut force = vec![zero(); 2];
    let mut grid = make_grid(params);
    grid.rebuild(&position);

    compute_forces(params, &grid, 0., &position, &velocity, &density, &pressure, &mut force);
    [force[0], force[1]]
}

#[test]
fn cohesion_acts_at_both_scales() {
    let mut params = SimulationParams::default();
    params.center_gravity = 0.;
    let short = params.cohesion_short();
    let long = params.cohesion_long();
    let min_distance = params.cohesion_min_distance_world();

    // between the short range and the long radius, outside the kernel support
    let r = 0.5 * (params.support_radius().max(short.range) + long.range);
    assert!(r > short.range && r > params.support_radius() && r < long.range);
    let [f0, f1] = pair_cohesion_force(&params, r);
    assert_eq!(short.magnitude(r, min_distance), 0.);
    assert_ft_approx_eq(f0.x, long.magnitude(r, min_distance), 1e-5, || format!("long range pull"));
    assert!(f0.x > 0., "particle on the left is pulled to the right");
    assert_ft_approx_eq(f0.y, 0., 1e-6, || format!("no sideways force"));
    assert_ft_approx_eq(f0.x + f1.x, 0., 1e-5, || format!("equal and opposite"));

    // closer than the minimum distance nothing acts
    let [f0, f1] = pair_cohesion_force(&params, 0.5 * min_distance);
    assert_eq!(f0, V2::zeros());
    assert_eq!(f1, V2::zeros());

    // inside the short range both scales add up
    let inner = 0.7 * short.range;
    let outer = 1.2 * short.range;
    assert!(outer < long.range);
    let inner_pull = pair_cohesion_force(&params, inner)[0].x;
    let outer_pull = pair_cohesion_force(&params, outer)[0].x;
    assert_ft_approx_eq(
        inner_pull,
        short.magnitude(inner, min_distance) + long.magnitude(inner, min_distance),
        1e-5,
        || format!("short plus long pull"),
    );
    assert_ft_approx_eq(outer_pull, long.magnitude(outer, min_distance), 1e-5, || format!("long only pull"));
    assert!(inner_pull > outer_pull);
}

#[test]
fn boundary_projects_and_reflects() {
    let params = SimulationParams::default();
    let mut position = vec![vec2f(2., 0.), vec2f(0.5, 0.), vec2f(0., -1.5)];
    let mut velocity = vec![vec2f(1., 0.5), vec2f(1., 0.), vec2f(0., 1.)];

    assert_eq!(enforce_boundaries(&params, &mut position, &mut velocity), 2);

    assert_eq!(position[0], vec2f(1., 0.));
    let e = params.boundary_restitution;
    assert_ft_approx_eq(velocity[0].x, -e, 1e-6, || format!("reflected normal velocity"));
    assert_ft_approx_eq(velocity[0].y, 0.5, 1e-6, || format!("tangential velocity"));

    assert_eq!(position[1], vec2f(0.5, 0.));
    assert_eq!(velocity[1], vec2f(1., 0.));

    // already moving inwards: only projected
    assert_eq!(position[2], vec2f(0., -1.));
    assert_eq!(velocity[2], vec2f(0., 1.));
}

#[test]
fn integration_resets_non_finite_values() {
    let params = SimulationParams::default();
    let force = vec![vec2f(FT::NAN, 0.), vec2f(1., 0.)];
    let mut velocity = vec![zero(), vec2f(FT::INFINITY, 0.)];
    assert_eq!(integrate_velocities(&params, 0.01, &force, &mut velocity), 2);
    assert_eq!(velocity, vec![V2::zeros(), V2::zeros()]);

    let mut position = vec![vec2f(0.1, 0.1), vec2f(FT::NAN, 0.)];
    assert_eq!(integrate_positions(0.01, &velocity, &mut position), 1);
    assert_eq!(position[1], V2::zeros());
}

#[test]
fn velocities_are_damped_and_capped() {
    let params = SimulationParams::default();
    let mut velocity = vec![vec2f(10., 0.), vec2f(0., 0.1)];
    limit_velocities(&params, 0.1, &mut velocity);
    assert_ft_approx_eq(velocity[0].norm(), params.max_speed, 1e-5, || format!("capped speed"));
    assert_ft_approx_eq(velocity[1].y, 0.1 * (-params.damping * 0.1).exp(), 1e-6, || format!("damped"));
}

#[test]
fn spawn_is_clamped_by_the_particle_ceiling() {
    let mut params = SimulationParams::default();
    params.particle_ceiling = 30;
    let mut sim = FluidSimulation::new(params, false);

    assert_eq!(sim.spawn_particles(zero(), 20, orange(), 30.), 20);
    assert_eq!(sim.spawn_particles(zero(), 20, orange(), 30.), 10);
    assert_eq!(sim.spawn_particles(zero(), 5, orange(), 30.), 0);
    assert_eq!(sim.num_particles(), 30);
}

#[test]
fn spawn_stays_inside_container_and_tags_phase() {
    let params = SimulationParams::default();
    let mut sim = FluidSimulation::new(params, false);
    sim.spawn_particles(vec2f(5., 0.), 10, orange(), 5.);
    sim.spawn_particles(vec2f(0., 0.), 10, orange(), 50.);

    let spawn_radius = params.spawn_radius_world();
    for i in 0..10 {
        assert!(sim.particles.position[i].norm() <= params.container_radius + 1e-5);
        assert!((sim.particles.position[i] - vec2f(params.container_radius - spawn_radius, 0.)).norm() <= spawn_radius + 1e-6);
        assert_eq!(sim.particles.phase[i], Phase::Gel);
    }
    for i in 10..20 {
        assert!(sim.particles.position[i].norm() <= spawn_radius + 1e-6);
        assert_eq!(sim.particles.phase[i], Phase::Liquid);
        assert_eq!(sim.particles.temperature[i], 50.);
    }
}

#[test]
fn spawn_is_reproducible_from_seed() {
    let params = SimulationParams::default();
    let mut a = FluidSimulation::new(params, false);
    let mut b = FluidSimulation::new(params, false);
    a.spawn_particles(vec2f(0.2, 0.1), 25, orange(), 30.);
    b.spawn_particles(vec2f(0.2, 0.1), 25, orange(), 30.);
    assert_eq!(a.particles.position, b.particles.position);
}

#[test]
fn drag_field_length_is_checked() {
    let mut sim = FluidSimulation::new(SimulationParams::default(), false);
    sim.spawn_particles(zero(), 4, orange(), 30.);
    assert_eq!(
        sim.set_drag_field(Some(vec![zero(); 3])),
        Err(SimulationError::DragFieldLength { expected: 4, got: 3 })
    );
    assert!(sim.set_drag_field(Some(vec![zero(); 4])).is_ok());

    // spawning keeps the field aligned
    sim.spawn_particles(zero(), 2, orange(), 30.);
    assert_eq!(sim.drag.as_ref().map(|d| d.len()), Some(6));
}

#[test]
fn render_particles_premultiply_density_alpha() {
    let params = SimulationParams::default();
    let mut sim = FluidSimulation::new(params, false);
    sim.spawn_particles(zero(), 3, crate::vec3f(1., 0.5, 0.25), 30.);
    sim.particles.density[0] = params.rest_density * 2.;
    sim.particles.density[1] = params.rest_density * 0.5;
    sim.particles.density[2] = params.rest_density * 0.01;

    let render: Vec<RenderParticle> = sim.render_particles().collect();
    assert_eq!(render.len(), 3);
    assert_eq!(render[0].color, V4::new(1., 0.5, 0.25, 1.));
    assert_eq!(render[1].color, V4::new(0.5, 0.25, 0.125, 0.5));
    assert_eq!(render[2].color.w, params.min_alpha);
    assert_eq!(render[2].density, params.rest_density * 0.01);
}

#[test]
fn blob_stays_centered_and_finite() {
    let params = SimulationParams::default();
    let mut sim = FluidSimulation::new(params, false);
    assert_eq!(sim.spawn_particles(zero(), 50, orange(), 30.), 50);

    for step in 0..120 {
        let report = sim.update(1. / 60., 0.);
        assert_eq!(report.total_repaired(), 0, "step {}: {:?}", step, report);
        assert_all_finite(&sim);
        let centroid = sim.centroid();
        assert!(
            centroid.norm() < 0.1 * params.container_radius,
            "step {}: centroid {:?}",
            step,
            centroid
        );
    }
    assert_eq!(sim.step_number(), 120);
    assert!(sim.particles.position.iter().all(|x| x.norm() <= params.container_radius * (1. + 1e-5)));
}

#[test]
fn explicit_and_implicit_trajectories_diverge_but_stay_bounded() {
    // explicit forces stay in the right hand side while pressure, viscosity and cohesion are
    // also linearized into the matrix; this pins down the current behavior of that overlap
    let params = SimulationParams::default();
    let mut settled = FluidSimulation::new(params, false);
    settled.spawn_particles(zero(), 50, orange(), 30.);
    for _ in 0..60 {
        settled.update(1. / 60., 0.);
    }

    let mut explicit = settled.clone();
    let mut implicit = settled.clone();
    let mut implicit_params = params;
    implicit_params.implicit.enabled = true;
    implicit_params.implicit.tolerance = 1e-5;
    implicit_params.implicit.max_iterations = 200;
    implicit.set_params(implicit_params);

    let explicit_report = explicit.step(1. / 60., 0.).unwrap();
    let implicit_report = implicit.step(1. / 60., 0.).unwrap();
    assert!(explicit_report.implicit.is_none());
    let stats = implicit_report.implicit.unwrap();
    assert!(stats.converged, "{:?}", stats);
    assert!(stats.matrix.non_zeros > 2 * implicit.num_particles());

    // (M + dt K) v = M v_explicit with K positive semi-definite can only remove kinetic energy
    assert!(implicit.kinetic_energy() <= explicit.kinetic_energy() * (1. + 1e-3) + 1e-9);
    let momentum_scale: FT = explicit.particles.velocity.iter().map(|v| v.norm()).sum::<FT>() * params.particle_mass;
    assert!((implicit.momentum() - explicit.momentum()).norm() <= 1e-3 * momentum_scale + 1e-6);

    for _ in 0..60 {
        let e = explicit.step(1. / 60., 0.).unwrap();
        let i = implicit.step(1. / 60., 0.).unwrap();
        assert_eq!(e.total_repaired(), 0);
        assert_eq!(i.total_repaired(), 0);
    }
    assert_all_finite(&explicit);
    assert_all_finite(&implicit);

    let max_difference = explicit
        .particles
        .position
        .iter()
        .zip(&implicit.particles.position)
        .map(|(a, b)| (a - b).norm())
        .fold(0., FT::max);
    assert!(max_difference > 0.);
    assert!(implicit.centroid().norm() < 0.1 * params.container_radius);
    assert!(explicit.centroid().norm() < 0.1 * params.container_radius);
}

#[cfg(test)]
proptest::proptest! {
    #[test]
    fn pressures_are_never_negative(density in proptest::collection::vec(proptest::num::f32::ANY, 1..64)) {
        let params = SimulationParams::default();
        let mut pressure = vec![0.; density.len()];
        compute_pressures(&params, &density, &mut pressure);
        for p in &pressure {
            assert!(*p >= 0. && p.is_finite(), "pressure {}", p);
        }
    }

    #[test]
    fn boundary_contains_every_particle(
        state in proptest::collection::vec((-100.0f32..100.0, -100.0f32..100.0, -50.0f32..50.0, -50.0f32..50.0), 1..64)
    ) {
        let params = SimulationParams::default();
        let mut position: Vec<V2> = state.iter().map(|s| vec2f(s.0, s.1)).collect();
        let mut velocity: Vec<V2> = state.iter().map(|s| vec2f(s.2, s.3)).collect();
        enforce_boundaries(&params, &mut position, &mut velocity);
        for x in &position {
            assert!(x.norm() <= params.container_radius * (1. + 1e-5), "{:?} escaped", x);
        }
    }
}
