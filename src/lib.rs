/*!
Cohesive "oil" SPH in 2D.

The explicit pipeline (spatial hash, density, Tait pressure, viscosity, two-scale cohesion,
center gravity, operator spin, circular container) lives in [`simulation::FluidSimulation`].
[`simulation::implicit_solver::ImplicitSolver`] adds an optional linearized velocity solve
`(M - dt J) v_new = M v_old + dt F` on top, assembled into a CSR matrix and solved with a
block-Jacobi preconditioned conjugate gradient.
*/

mod platform;
pub mod simulation;

pub use simulation::*;

pub use platform::start;
