pub mod concurrency;
pub mod conjugate_gradient;
pub mod growable_buffer;
pub mod implicit_solver;
pub mod preconditioner;
pub mod sanitize;
pub mod simulation_parameters;
pub mod sparse_matrix;
pub mod spatial_hash;
pub mod sph_kernels;
pub mod statistics;
pub mod simulation;

/// The whole pipeline runs in single precision. Solver tolerances are chosen with that in mind.
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{PI, TAU};
}

use floating_type_mod::FT;

use nalgebra::{SMatrix, SVector};

#[allow(dead_code)]
pub type V<FT, const D: usize> = SVector<FT, D>;
#[allow(dead_code)]
pub type M<FT, const D: usize> = SMatrix<FT, D, D>;

pub type V2 = V<FT, 2>;
pub type M2 = M<FT, 2>;
pub type V3 = V<FT, 3>;
pub type V4 = V<FT, 4>;

pub fn vec2f(x: FT, y: FT) -> V2 {
    [x, y].into()
}

pub fn vec3f(x: FT, y: FT, z: FT) -> V3 {
    [x, y, z].into()
}

pub use simulation::*;
