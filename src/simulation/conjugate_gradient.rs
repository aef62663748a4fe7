//! Preconditioned conjugate gradient for symmetric positive-definite [`SparseMatrix`] systems.
//!
//! Symmetry and definiteness are assumed, not checked. A system that violates them shows up as
//! a vanishing `p^T A p`, which stops the iteration early with `converged == false`.

use crate::{
    floating_type_mod::FT,
    preconditioner::{Preconditioner, PreconditionerTrait},
    simulation_parameters::PreconditionerType,
    sparse_matrix::{SparseMatrix, SparseMatrixError},
};

/// Initial residual norms below this count as an exact initial guess.
pub const ZERO_RESIDUAL: FT = 1e-12;

/// `p^T A p` at or below this value aborts the iteration.
pub const CURVATURE_UNDERFLOW: FT = 1e-30;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgResult {
    pub iterations: usize,
    /// `|r| / |r0|` of the returned iterate (zero if the initial guess was already exact).
    pub residual: FT,
    pub converged: bool,
}

#[inline]
fn dot(a: &[FT], b: &[FT]) -> FT {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn norm(a: &[FT]) -> FT {
    dot(a, a).sqrt()
}

/// Owns the per-solve work vectors so repeated solves of the same size do not allocate.
#[derive(Debug, Clone)]
pub struct ConjugateGradient {
    preconditioner: Preconditioner,
    r: Vec<FT>,
    z: Vec<FT>,
    p: Vec<FT>,
    ap: Vec<FT>,
}

impl ConjugateGradient {
    pub fn new(preconditioner: PreconditionerType) -> Self {
        ConjugateGradient {
            preconditioner: Preconditioner::new(preconditioner),
            r: Vec::new(),
            z: Vec::new(),
            p: Vec::new(),
            ap: Vec::new(),
        }
    }

    fn resize(&mut self, n: usize) {
        if self.r.len() != n {
            self.r.resize(n, 0.);
            self.z.resize(n, 0.);
            self.p.resize(n, 0.);
            self.ap.resize(n, 0.);
        }
    }

    /// Solves `A x = b`. `x` is the initial guess on entry and the (possibly partial) solution on return.
    pub fn solve(
        &mut self,
        a: &SparseMatrix,
        b: &[FT],
        x: &mut [FT],
        max_iterations: usize,
        tolerance: FT,
    ) -> Result<CgResult, SparseMatrixError> {
        let n = a.size();
        if b.len() != n || x.len() != n {
            return Err(SparseMatrixError::DimensionMismatch {
                size: n,
                x: x.len(),
                y: b.len(),
            });
        }
        self.resize(n);
        self.preconditioner.update(a)?;

        // r = b - A x
        a.multiply(x, &mut self.ap)?;
        for ((r, b), ax) in self.r.iter_mut().zip(b).zip(&self.ap) {
            *r = b - ax;
        }

        let initial_residual = norm(&self.r);
        if initial_residual < ZERO_RESIDUAL {
            return Ok(CgResult {
                iterations: 0,
                residual: 0.,
                converged: true,
            });
        }

        self.preconditioner.apply(&self.r, &mut self.z);
        self.p.copy_from_slice(&self.z);
        let mut rz = dot(&self.r, &self.z);

        let mut iterations = 0;
        let mut residual = 1.;
        let mut converged = false;

        while iterations < max_iterations {
            a.multiply(&self.p, &mut self.ap)?;
            let p_ap = dot(&self.p, &self.ap);
            if !(p_ap > CURVATURE_UNDERFLOW) {
                log::debug!(
                    "cg: p^T A p = {} after {} iterations, system is singular or not positive definite",
                    p_ap,
                    iterations
                );
                break;
            }

            let alpha = rz / p_ap;
            for (x, p) in x.iter_mut().zip(&self.p) {
                *x += alpha * p;
            }
            for (r, ap) in self.r.iter_mut().zip(&self.ap) {
                *r -= alpha * ap;
            }
            iterations += 1;

            residual = norm(&self.r) / initial_residual;
            if residual < tolerance {
                converged = true;
                break;
            }

            self.preconditioner.apply(&self.r, &mut self.z);
            let rz_next = dot(&self.r, &self.z);
            let beta = rz_next / rz;
            for (p, z) in self.p.iter_mut().zip(&self.z) {
                *p = z + beta * *p;
            }
            rz = rz_next;
        }

        Ok(CgResult {
            iterations,
            residual,
            converged,
        })
    }
}

#[cfg(test)]
fn tridiagonal(size: usize, diag: FT, off: FT) -> SparseMatrix {
    let mut m = SparseMatrix::new(size);
    for row in 0..size {
        m.begin_row(row).unwrap();
        if row > 0 {
            m.add_entry(row - 1, off).unwrap();
        }
        m.add_entry(row, diag).unwrap();
        if row + 1 < size {
            m.add_entry(row + 1, off).unwrap();
        }
    }
    m.finalize().unwrap();
    m
}

#[test]
fn solves_small_spd_system() {
    // [[4,1,0],[1,4,1],[0,1,4]] x = [1,2,3] has the exact solution [5/28, 2/7, 19/28]
    let a = tridiagonal(3, 4., 1.);
    let b = [1., 2., 3.];
    let expected = [5. / 28., 2. / 7., 19. / 28.];

    for kind in [PreconditionerType::BlockJacobi, PreconditionerType::Jacobi, PreconditionerType::None] {
        let mut cg = ConjugateGradient::new(kind);
        let mut x = [0.; 3];
        let result = cg.solve(&a, &b, &mut x, 10, 1e-5).unwrap();

        assert!(result.converged, "{:?} did not converge: {:?}", kind, result);
        assert!(result.iterations <= 10);
        let error: FT = x.iter().zip(&expected).map(|(x, e)| (x - e) * (x - e)).sum::<FT>().sqrt();
        assert!(error < 1e-3, "{:?}: x={:?} error={}", kind, x, error);
    }
}

#[test]
fn exact_initial_guess_returns_immediately() {
    let a = tridiagonal(3, 4., 1.);
    let mut x = [5. / 28., 2. / 7., 19. / 28.];
    let b = [0.; 3];
    let mut zero = [0.; 3];
    let mut cg = ConjugateGradient::new(PreconditionerType::BlockJacobi);

    let result = cg.solve(&a, &b, &mut zero, 10, 1e-6).unwrap();
    assert_eq!(result.iterations, 0);
    assert!(result.converged);
    assert_eq!(zero, [0.; 3]);

    let mut b = [0.; 3];
    a.multiply(&x, &mut b).unwrap();
    let result = cg.solve(&a, &b, &mut x, 10, 1e-6).unwrap();
    assert!(result.converged);
    assert!(result.iterations <= 1);
}

#[test]
fn singular_system_stops_without_converging() {
    let mut a = SparseMatrix::new(2);
    a.begin_row(0).unwrap();
    a.begin_row(1).unwrap();
    a.finalize().unwrap();

    let mut x = [0.5, -0.5];
    let mut cg = ConjugateGradient::new(PreconditionerType::BlockJacobi);
    let result = cg.solve(&a, &[1., 1.], &mut x, 50, 1e-6).unwrap();

    assert!(!result.converged);
    assert_eq!(result.iterations, 0);
    assert_eq!(x, [0.5, -0.5]);
}

#[test]
fn iteration_limit_returns_partial_iterate() {
    let a = tridiagonal(40, 2.05, -1.);
    let b: Vec<FT> = (0..40).map(|i| (i as FT * 0.3).sin()).collect();
    let mut x = vec![0.; 40];
    let mut cg = ConjugateGradient::new(PreconditionerType::None);

    let result = cg.solve(&a, &b, &mut x, 2, 1e-6).unwrap();
    assert_eq!(result.iterations, 2);
    assert!(!result.converged);
    assert!(result.residual < 1.);
    assert!(x.iter().all(|v| v.is_finite()));
}

#[test]
fn block_jacobi_converges_on_larger_chain() {
    let a = tridiagonal(64, 3., -1.);
    let b: Vec<FT> = (0..64).map(|i| 1. + (i % 5) as FT).collect();
    let mut x = vec![0.; 64];
    let mut cg = ConjugateGradient::new(PreconditionerType::BlockJacobi);

    let result = cg.solve(&a, &b, &mut x, 100, 1e-5).unwrap();
    assert!(result.converged, "{:?}", result);

    let mut ax = vec![0.; 64];
    a.multiply(&x, &mut ax).unwrap();
    for (ax, b) in ax.iter().zip(&b) {
        crate::assert_ft_approx_eq(*ax, *b, 1e-3, || format!("A x = b"));
    }
}

#[test]
fn mismatched_right_hand_side_is_an_error() {
    let a = tridiagonal(3, 4., 1.);
    let mut x = [0.; 3];
    let mut cg = ConjugateGradient::new(PreconditionerType::BlockJacobi);
    assert_eq!(
        cg.solve(&a, &[1., 2.], &mut x, 10, 1e-6),
        Err(SparseMatrixError::DimensionMismatch { size: 3, x: 3, y: 2 })
    );
}
