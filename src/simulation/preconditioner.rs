use enum_dispatch::enum_dispatch;

use crate::{
    floating_type_mod::FT,
    simulation_parameters::PreconditionerType,
    sparse_matrix::{SparseMatrix, SparseMatrixError},
    M2,
};

/// 2x2 blocks with a smaller |det| are treated as singular.
pub const SINGULAR_BLOCK_DETERMINANT: FT = 1e-12;

/// Diagonal entries with a smaller magnitude are left unscaled.
pub const SINGULAR_DIAGONAL: FT = 1e-12;

#[enum_dispatch]
pub trait PreconditionerTrait {
    /// Rebuild from a finalized matrix.
    fn update(&mut self, matrix: &SparseMatrix) -> Result<(), SparseMatrixError>;

    /// `z = M^-1 r`
    fn apply(&self, r: &[FT], z: &mut [FT]);
}

#[inline]
fn scalar_inverse(d: FT) -> FT {
    if d.abs() < SINGULAR_DIAGONAL {
        1.
    } else {
        1. / d
    }
}

/// Inverts the 2x2 diagonal block of every particle (x and y velocity rows).
///
/// Near-singular blocks fall back to scalar Jacobi on their two diagonal entries. An odd
/// trailing row (only happens for systems that are not particle based) is scalar Jacobi.
#[derive(Debug, Clone, Default)]
pub struct BlockJacobiPreconditioner {
    block_inverses: Vec<M2>,
    trailing_inverse: Option<FT>,
    num_fallback_blocks: usize,
}

impl BlockJacobiPreconditioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_fallback_blocks(&self) -> usize {
        self.num_fallback_blocks
    }
}

impl PreconditionerTrait for BlockJacobiPreconditioner {
    fn update(&mut self, matrix: &SparseMatrix) -> Result<(), SparseMatrixError> {
        let size = matrix.size();
        let num_blocks = size / 2;

        self.block_inverses.clear();
        self.num_fallback_blocks = 0;

        for b in 0..num_blocks {
            let row = 2 * b;
            let block = M2::new(
                matrix.get(row, row)?,
                matrix.get(row, row + 1)?,
                matrix.get(row + 1, row)?,
                matrix.get(row + 1, row + 1)?,
            );

            let det = block.determinant();
            let inverse = if det.abs() < SINGULAR_BLOCK_DETERMINANT || !det.is_finite() {
                self.num_fallback_blocks += 1;
                M2::new(scalar_inverse(block[(0, 0)]), 0., 0., scalar_inverse(block[(1, 1)]))
            } else {
                M2::new(block[(1, 1)], -block[(0, 1)], -block[(1, 0)], block[(0, 0)]) / det
            };
            self.block_inverses.push(inverse);
        }

        self.trailing_inverse = if size % 2 == 1 {
            Some(scalar_inverse(matrix.get(size - 1, size - 1)?))
        } else {
            None
        };

        Ok(())
    }

    fn apply(&self, r: &[FT], z: &mut [FT]) {
        for (b, inverse) in self.block_inverses.iter().enumerate() {
            let r0 = r[2 * b];
            let r1 = r[2 * b + 1];
            z[2 * b] = inverse[(0, 0)] * r0 + inverse[(0, 1)] * r1;
            z[2 * b + 1] = inverse[(1, 0)] * r0 + inverse[(1, 1)] * r1;
        }
        if let Some(inverse) = self.trailing_inverse {
            let last = r.len() - 1;
            z[last] = inverse * r[last];
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JacobiPreconditioner {
    inverse_diagonal: Vec<FT>,
}

impl PreconditionerTrait for JacobiPreconditioner {
    fn update(&mut self, matrix: &SparseMatrix) -> Result<(), SparseMatrixError> {
        self.inverse_diagonal.resize(matrix.size(), 0.);
        matrix.diagonal_into(&mut self.inverse_diagonal)?;
        for d in &mut self.inverse_diagonal {
            *d = scalar_inverse(*d);
        }
        Ok(())
    }

    fn apply(&self, r: &[FT], z: &mut [FT]) {
        for ((z, r), inv) in z.iter_mut().zip(r).zip(&self.inverse_diagonal) {
            *z = r * inv;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPreconditioner;

impl PreconditionerTrait for IdentityPreconditioner {
    fn update(&mut self, _matrix: &SparseMatrix) -> Result<(), SparseMatrixError> {
        Ok(())
    }

    fn apply(&self, r: &[FT], z: &mut [FT]) {
        z.copy_from_slice(r);
    }
}

#[enum_dispatch(PreconditionerTrait)]
#[derive(Debug, Clone)]
pub enum Preconditioner {
    BlockJacobiPreconditioner(BlockJacobiPreconditioner),
    JacobiPreconditioner(JacobiPreconditioner),
    IdentityPreconditioner(IdentityPreconditioner),
}

impl Preconditioner {
    pub fn new(kind: PreconditionerType) -> Self {
        match kind {
            PreconditionerType::BlockJacobi => BlockJacobiPreconditioner::new().into(),
            PreconditionerType::Jacobi => JacobiPreconditioner::default().into(),
            PreconditionerType::None => IdentityPreconditioner.into(),
        }
    }
}

#[cfg(test)]
fn matrix_from_rows(rows: &[&[(usize, FT)]]) -> SparseMatrix {
    let mut m = SparseMatrix::new(rows.len());
    for (row, entries) in rows.iter().enumerate() {
        m.begin_row(row).unwrap();
        for &(col, value) in entries.iter() {
            m.add_entry(col, value).unwrap();
        }
    }
    m.finalize().unwrap();
    m
}

#[test]
fn block_jacobi_inverts_2x2_blocks() {
    let m = matrix_from_rows(&[
        &[(0, 4.), (1, 1.), (2, 0.5)],
        &[(0, 1.), (1, 3.)],
        &[(0, 0.5), (2, 2.), (3, -1.)],
        &[(2, -1.), (3, 5.)],
    ]);
    let mut p = Preconditioner::new(PreconditionerType::BlockJacobi);
    p.update(&m).unwrap();

    // apply to the block columns of A itself: z must be the unit vectors
    let r = [4., 1., 2., -1.];
    let mut z = [0.; 4];
    p.apply(&r, &mut z);
    crate::assert_ft_approx_eq(z[0], 1., 1e-6, || format!("z0"));
    crate::assert_ft_approx_eq(z[1], 0., 1e-6, || format!("z1"));
    crate::assert_ft_approx_eq(z[2], 1., 1e-6, || format!("z2"));
    crate::assert_ft_approx_eq(z[3], 0., 1e-6, || format!("z3"));
}

#[test]
fn block_jacobi_falls_back_to_scalar_for_singular_blocks() {
    // [[1, 1], [1, 1]] has det 0
    let m = matrix_from_rows(&[&[(0, 1.), (1, 1.)], &[(0, 1.), (1, 1.)], &[(2, 2.)]]);
    let mut p = BlockJacobiPreconditioner::new();
    p.update(&m).unwrap();
    assert_eq!(p.num_fallback_blocks(), 1);

    let mut z = [0.; 3];
    p.apply(&[3., 5., 4.], &mut z);
    assert_eq!(z, [3., 5., 2.]);
}

#[test]
fn jacobi_and_identity_preconditioners() {
    let m = matrix_from_rows(&[&[(0, 2.)], &[(1, 0.)], &[(2, -4.)]]);

    let mut jacobi = Preconditioner::new(PreconditionerType::Jacobi);
    jacobi.update(&m).unwrap();
    let mut z = [0.; 3];
    jacobi.apply(&[1., 1., 1.], &mut z);
    assert_eq!(z, [0.5, 1., -0.25]);

    let mut identity = Preconditioner::new(PreconditionerType::None);
    identity.update(&m).unwrap();
    identity.apply(&[1., 2., 3.], &mut z);
    assert_eq!(z, [1., 2., 3.]);
}
