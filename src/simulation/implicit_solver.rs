//! Implicit velocity update `(M - dt J) v_new = M v_old + dt F`.
//!
//! `J` is a hand-linearized velocity Jacobian. Every interacting pair `(i, j)` contributes a
//! symmetric positive semi-definite 2x2 coupling block `K_ij`, which enters the system matrix as
//! `-dt K_ij` off the diagonal and `+dt K_ij` on both diagonal blocks. Together with the mass
//! term the matrix is symmetric positive definite.
//!
//! The cohesion block is not a derivative. Cohesion is a position dependent spring force, it is
//! coupled here as a stiff velocity damping between neighbors so that an implicit step resists
//! shear and spreading. A mixed position/velocity system would be the exact treatment.

use std::time::{Duration, Instant};

use crate::{
    conjugate_gradient::ConjugateGradient,
    floating_type_mod::FT,
    sanitize::sanitize_vectors,
    simulation_parameters::{PreconditionerType, SimulationParams},
    sparse_matrix::{SparseMatrix, SparseMatrixStats},
    spatial_hash::SpatialHashGrid,
    sph_kernels::{spiky_kernel_2d_grad, viscosity_kernel_2d_laplacian, MIN_PAIR_DISTANCE_BY_SMOOTHING_LENGTH},
    ParticleVec, SimulationError, M2, V2,
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImplicitSolverStats {
    pub build_time: Duration,
    pub solve_time: Duration,
    pub iterations: usize,
    pub residual: FT,
    pub converged: bool,
    /// velocities of the solution that were non-finite and reset to zero
    pub repaired_velocities: usize,
    pub matrix: SparseMatrixStats,
}

/// Velocity coupling between two particles, `None` if they do not interact.
///
/// `x_ij = x_i - x_j`. The block is the same for `(i, j)` and `(j, i)`.
pub fn pair_coupling(params: &SimulationParams, dt: FT, x_ij: V2, density_i: FT, density_j: FT) -> Option<M2> {
    let support_radius = params.support_radius();
    let r = x_ij.norm();
    if r >= support_radius {
        return None;
    }

    let m = params.particle_mass;
    let implicit = &params.implicit;
    let mut block = M2::zeros();

    if implicit.linearize_viscosity {
        let k_visc = params.viscosity * m * m * viscosity_kernel_2d_laplacian(r, support_radius) / (density_i * density_j);
        block += M2::identity() * k_visc;
    }

    if implicit.linearize_pressure && r > MIN_PAIR_DISTANCE_BY_SMOOTHING_LENGTH * support_radius {
        let mean_density = 0.5 * (density_i + density_j);
        let density_ratio = (mean_density / params.rest_density).min(implicit.max_pressure_density_ratio);
        let c_sq = params.speed_of_sound_sq(density_ratio);
        if c_sq > 0. {
            let grad = spiky_kernel_2d_grad(x_ij, support_radius);
            let n = x_ij / r;
            let k_press = dt
                * c_sq
                * m
                * m
                * grad.norm_squared()
                * 0.5
                * (m / (density_i * density_i) + m / (density_j * density_j));
            block += n * n.transpose() * k_press;
        }
    }

    if implicit.linearize_cohesion {
        let min_distance = params.cohesion_min_distance_world();
        let k_coh = implicit.cohesion_stiffness * dt * params.cohesion_short().stiffness(r, min_distance);
        block += M2::identity() * k_coh;
    }

    if block.iter().all(|v| v.is_finite()) {
        Some(block)
    } else {
        None
    }
}

/// Owns the system matrix, the CG solver and the right hand side between steps.
///
/// Buffers are only reallocated when the particle count changes.
#[derive(Debug, Clone)]
pub struct ImplicitSolver {
    matrix: SparseMatrix,
    cg: ConjugateGradient,
    preconditioner: PreconditionerType,
    rhs: Vec<FT>,
    solution: Vec<FT>,
    couplings: Vec<(usize, M2)>,
    neighbors: Vec<usize>,
    last_stats: ImplicitSolverStats,
}

impl ImplicitSolver {
    pub fn new(preconditioner: PreconditionerType) -> Self {
        ImplicitSolver {
            matrix: SparseMatrix::new(0),
            cg: ConjugateGradient::new(preconditioner),
            preconditioner,
            rhs: Vec::new(),
            solution: Vec::new(),
            couplings: Vec::new(),
            neighbors: Vec::new(),
            last_stats: ImplicitSolverStats::default(),
        }
    }

    pub fn matrix(&self) -> &SparseMatrix {
        &self.matrix
    }

    pub fn stats(&self) -> ImplicitSolverStats {
        self.last_stats
    }

    /// Builds `A = M - dt J` for the current particle state. The spatial hash must be up to date.
    pub fn assemble(
        &mut self,
        particles: &ParticleVec,
        grid: &SpatialHashGrid,
        params: &SimulationParams,
        dt: FT,
    ) -> Result<(), SimulationError> {
        let n = particles.len();
        let size = 2 * n;
        self.matrix.reset(size);

        let support_radius = params.support_radius();
        let position = &particles.position;
        let density = &particles.density;

        for i in 0..n {
            let xi = position[i];
            grid.query_into(xi.x, xi.y, support_radius, &mut self.neighbors);

            self.couplings.clear();
            let mut diagonal_correction = M2::zeros();
            for &j in &self.neighbors {
                if j == i {
                    continue;
                }
                if let Some(block) = pair_coupling(params, dt, xi - position[j], density[i], density[j]) {
                    diagonal_correction += block * dt;
                    self.couplings.push((j, block * -dt));
                }
            }

            for c in 0..2 {
                let row = 2 * i + c;
                self.matrix.begin_row(row)?;
                for &(j, block) in &self.couplings {
                    self.matrix.add_entry(2 * j, block[(c, 0)])?;
                    self.matrix.add_entry(2 * j + 1, block[(c, 1)])?;
                }
                self.matrix.add_entry(2 * i, diagonal_correction[(c, 0)])?;
                self.matrix.add_entry(2 * i + 1, diagonal_correction[(c, 1)])?;

                // mass goes last, as a separate entry on top of the coupling diagonal
                self.matrix.add_entry(row, params.particle_mass)?;
            }
        }

        self.matrix.finalize()?;
        Ok(())
    }

    /// `rhs = M v_old + dt F (+ dt M k_drag (u_drag - v_old))`
    fn build_rhs(&mut self, particles: &ParticleVec, params: &SimulationParams, drag: Option<&[V2]>, dt: FT) {
        let n = particles.len();
        let m = params.particle_mass;
        let k_drag = params.implicit.drag_coefficient;

        self.rhs.resize(2 * n, 0.);
        self.solution.resize(2 * n, 0.);

        for i in 0..n {
            let v = particles.velocity[i];
            let mut b = v * m + particles.force[i] * dt;
            if let Some(drag) = drag {
                b += (drag[i] - v) * (dt * m * k_drag);
            }
            self.rhs[2 * i] = b.x;
            self.rhs[2 * i + 1] = b.y;

            // current velocities are the initial guess
            self.solution[2 * i] = v.x;
            self.solution[2 * i + 1] = v.y;
        }
    }

    /// Replaces all particle velocities with the implicit solution.
    ///
    /// The forces in `particles.force` must already be accumulated for this step. A solve that
    /// does not converge is logged and its last iterate is applied anyway.
    pub fn solve(
        &mut self,
        particles: &mut ParticleVec,
        grid: &SpatialHashGrid,
        params: &SimulationParams,
        drag: Option<&[V2]>,
        dt: FT,
    ) -> Result<ImplicitSolverStats, SimulationError> {
        let n = particles.len();
        if let Some(drag) = drag {
            if drag.len() != n {
                return Err(SimulationError::DragFieldLength {
                    expected: n,
                    got: drag.len(),
                });
            }
        }
        if params.implicit.preconditioner != self.preconditioner {
            self.preconditioner = params.implicit.preconditioner;
            self.cg = ConjugateGradient::new(self.preconditioner);
        }

        let build_start = Instant::now();
        self.build_rhs(particles, params, drag, dt);
        self.assemble(particles, grid, params, dt)?;
        let build_time = build_start.elapsed();

        let solve_start = Instant::now();
        let result = self.cg.solve(
            &self.matrix,
            &self.rhs,
            &mut self.solution,
            params.implicit.max_iterations,
            params.implicit.tolerance,
        )?;
        let solve_time = solve_start.elapsed();

        if !result.converged {
            log::warn!(
                "implicit solve did not converge after {} iterations (residual {:e}), applying partial result",
                result.iterations,
                result.residual
            );
        }

        for (i, v) in particles.velocity.iter_mut().enumerate() {
            *v = V2::new(self.solution[2 * i], self.solution[2 * i + 1]);
        }
        let repaired_velocities = sanitize_vectors(&mut particles.velocity, V2::zeros());
        if repaired_velocities > 0 {
            log::warn!("implicit solve produced {} non-finite velocities", repaired_velocities);
        }

        self.last_stats = ImplicitSolverStats {
            build_time,
            solve_time,
            iterations: result.iterations,
            residual: result.residual,
            converged: result.converged,
            repaired_velocities,
            matrix: self.matrix.stats(),
        };
        log::debug!(
            "implicit: {} dofs, {} non-zeros, {} iterations, residual {:e}",
            self.last_stats.matrix.size,
            self.last_stats.matrix.non_zeros,
            result.iterations,
            result.residual
        );

        Ok(self.last_stats)
    }
}

#[cfg(test)]
fn lattice_particles(side: usize, spacing: FT, density: FT) -> ParticleVec {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(11);
    let mut particles = ParticleVec::default(side * side);
    let offset = 0.5 * spacing * (side - 1) as FT;
    for y in 0..side {
        for x in 0..side {
            let i = y * side + x;
            particles.position[i] = V2::new(x as FT * spacing - offset, y as FT * spacing - offset);
            particles.velocity[i] = V2::new(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5));
            particles.density[i] = density;
        }
    }
    particles
}

#[cfg(test)]
fn grid_for(params: &SimulationParams, particles: &ParticleVec) -> SpatialHashGrid {
    let mut grid = SpatialHashGrid::new(params.support_radius(), params.container_radius + params.support_radius());
    grid.rebuild(&particles.position);
    grid
}

#[cfg(test)]
fn kinetic_energy(params: &SimulationParams, particles: &ParticleVec) -> FT {
    particles.velocity.iter().map(|v| 0.5 * params.particle_mass * v.norm_squared()).sum()
}

#[test]
fn assembled_matrix_is_symmetric_positive_definite() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let params = SimulationParams::default();
    let particles = lattice_particles(6, 0.6 * params.h, 1.2 * params.rest_density);
    let grid = grid_for(&params, &particles);

    let mut solver = ImplicitSolver::new(PreconditionerType::BlockJacobi);
    solver.assemble(&particles, &grid, &params, 1. / 60.).unwrap();
    let a = solver.matrix();
    assert_eq!(a.size(), 72);
    assert!(a.non_zeros() > 72);

    let mut max_entry: FT = 0.;
    for r in 0..a.size() {
        for c in 0..a.size() {
            max_entry = max_entry.max(a.get(r, c).unwrap().abs());
        }
    }
    for r in 0..a.size() {
        assert!(a.diagonal(r).unwrap() >= params.particle_mass);
        for c in 0..r {
            crate::assert_ft_approx_eq(a.get(r, c).unwrap(), a.get(c, r).unwrap(), 1e-6 * max_entry, || {
                format!("A[{}][{}] vs A[{}][{}]", r, c, c, r)
            });
        }
    }

    let mut rng = StdRng::seed_from_u64(5);
    let mut ax = vec![0.; a.size()];
    for _ in 0..10 {
        let x: Vec<FT> = (0..a.size()).map(|_| rng.gen_range(-1.0..1.0)).collect();
        a.multiply(&x, &mut ax).unwrap();
        let x_ax: FT = x.iter().zip(&ax).map(|(x, ax)| x * ax).sum();
        assert!(x_ax > 0.);
    }
}

#[test]
fn coupling_is_symmetric_and_vanishes_outside_support() {
    let params = SimulationParams::default();
    let dt = 1. / 60.;
    let x_ij = V2::new(0.03, -0.02);
    let a = pair_coupling(&params, dt, x_ij, 1300., 1100.).unwrap();
    let b = pair_coupling(&params, dt, -x_ij, 1100., 1300.).unwrap();
    assert!((a - b).norm() <= 1e-6 * a.norm());
    assert!((a - a.transpose()).norm() <= 1e-6 * a.norm());

    assert!(pair_coupling(&params, dt, V2::new(params.support_radius(), 0.), 1000., 1000.).is_none());
}

#[test]
fn viscosity_only_step_dissipates_energy_and_keeps_momentum() {
    let mut params = SimulationParams::default();
    params.implicit.linearize_pressure = false;
    params.implicit.linearize_cohesion = false;
    params.implicit.tolerance = 1e-5;
    params.implicit.max_iterations = 200;
    params.viscosity = 50.;

    let mut particles = lattice_particles(5, 0.7 * params.h, params.rest_density);
    let grid = grid_for(&params, &particles);

    let energy_before = kinetic_energy(&params, &particles);
    let momentum_before: V2 = particles.velocity.iter().sum::<V2>() * params.particle_mass;
    let momentum_scale: FT = particles.velocity.iter().map(|v| v.norm()).sum::<FT>() * params.particle_mass;

    let mut solver = ImplicitSolver::new(PreconditionerType::BlockJacobi);
    let stats = solver.solve(&mut particles, &grid, &params, None, 1. / 60.).unwrap();
    assert!(stats.converged, "{:?}", stats);
    assert_eq!(stats.repaired_velocities, 0);

    let energy_after = kinetic_energy(&params, &particles);
    let momentum_after: V2 = particles.velocity.iter().sum::<V2>() * params.particle_mass;
    assert!(energy_after < energy_before, "{} >= {}", energy_after, energy_before);
    assert!((momentum_after - momentum_before).norm() <= 1e-3 * momentum_scale);
}

#[test]
fn isolated_particle_relaxes_towards_drag_velocity() {
    let mut params = SimulationParams::default();
    params.implicit.drag_coefficient = 3.;
    let dt = 0.1;

    let mut particles = ParticleVec::default(2);
    particles.position[0] = V2::new(-0.5, 0.);
    particles.position[1] = V2::new(0.5, 0.);
    particles.velocity[0] = V2::new(1., 0.);
    particles.velocity[1] = V2::new(0., 0.);
    particles.force[1] = V2::new(0., 4.);
    particles.density.iter_mut().for_each(|d| *d = params.rest_density);
    let grid = grid_for(&params, &particles);

    let drag = vec![V2::new(0., 1.), V2::zeros()];
    let mut solver = ImplicitSolver::new(PreconditionerType::BlockJacobi);
    solver.solve(&mut particles, &grid, &params, Some(&drag), dt).unwrap();

    // no neighbors: v = v_old + dt k (u - v_old) + dt F / m
    let expected0 = V2::new(1., 0.) + (V2::new(0., 1.) - V2::new(1., 0.)) * (dt * 3.);
    let expected1 = V2::new(0., 4.) * (dt / params.particle_mass);
    assert!((particles.velocity[0] - expected0).norm() < 1e-5);
    assert!((particles.velocity[1] - expected1).norm() < 1e-5);
}

#[test]
fn drag_field_must_match_particle_count() {
    let params = SimulationParams::default();
    let mut particles = ParticleVec::default(3);
    let grid = grid_for(&params, &particles);
    let mut solver = ImplicitSolver::new(PreconditionerType::BlockJacobi);
    let drag = vec![V2::zeros(); 2];
    assert!(matches!(
        solver.solve(&mut particles, &grid, &params, Some(&drag), 0.01),
        Err(SimulationError::DragFieldLength { expected: 3, got: 2 })
    ));
}
