//! Row-sequential Compressed Sparse Row builder.
//!
//! Rows are opened with [`SparseMatrix::begin_row`] in strictly increasing order, filled with
//! [`SparseMatrix::add_entry`] and the whole matrix is locked with [`SparseMatrix::finalize`].
//! Entries are appended as given: two `add_entry` calls for the same `(row, col)` produce two
//! stored entries. `multiply` and `get` both sum such duplicates, so the numerical value of the
//! matrix is the same as if they had been accumulated.

use std::fmt;

use crate::{floating_type_mod::FT, growable_buffer::GrowableBuffer};

/// Entries with a smaller magnitude are not stored.
pub const DROP_EPSILON: FT = 1e-12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SparseMatrixError {
    RowOutOfOrder { previous: usize, row: usize },
    RowOutOfRange { row: usize, size: usize },
    NoActiveRow,
    ColumnOutOfRange { row: usize, col: usize, size: usize },
    MissingRows { started: usize, size: usize },
    NotFinalized,
    AlreadyFinalized,
    DimensionMismatch { size: usize, x: usize, y: usize },
}

impl fmt::Display for SparseMatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SparseMatrixError::RowOutOfOrder { previous, row } => {
                write!(f, "row {} started after row {} (rows must be strictly increasing)", row, previous)
            }
            SparseMatrixError::RowOutOfRange { row, size } => {
                write!(f, "row {} out of range for matrix of size {}", row, size)
            }
            SparseMatrixError::NoActiveRow => write!(f, "entry added before any row was started"),
            SparseMatrixError::ColumnOutOfRange { row, col, size } => {
                write!(f, "column {} in row {} out of range for matrix of size {}", col, row, size)
            }
            SparseMatrixError::MissingRows { started, size } => {
                write!(f, "finalize with only {} of {} rows started", started, size)
            }
            SparseMatrixError::NotFinalized => write!(f, "matrix used before finalize"),
            SparseMatrixError::AlreadyFinalized => write!(f, "matrix modified after finalize"),
            SparseMatrixError::DimensionMismatch { size, x, y } => {
                write!(f, "multiply with size {} matrix got x.len()={} y.len()={}", size, x, y)
            }
        }
    }
}

impl std::error::Error for SparseMatrixError {}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SparseMatrixStats {
    pub size: usize,
    pub non_zeros: usize,
    pub density_percent: FT,
    pub memory_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct SparseMatrix {
    size: usize,
    values: GrowableBuffer<FT>,
    col_indices: GrowableBuffer<u32>,

    // size + 1 entries once finalized
    row_start: Vec<usize>,

    current_row: Option<usize>,
    rows_started: usize,
    finalized: bool,
}

impl SparseMatrix {
    pub fn new(size: usize) -> Self {
        Self::with_capacity(size, size)
    }

    pub fn with_capacity(size: usize, expected_non_zeros: usize) -> Self {
        SparseMatrix {
            size,
            values: GrowableBuffer::with_capacity(expected_non_zeros),
            col_indices: GrowableBuffer::with_capacity(expected_non_zeros),
            row_start: vec![0; size + 1],
            current_row: None,
            rows_started: 0,
            finalized: false,
        }
    }

    /// Unlocks the matrix for a new build with the given size. Allocations are kept.
    pub fn reset(&mut self, size: usize) {
        self.size = size;
        self.values.clear();
        self.col_indices.clear();
        self.row_start.clear();
        self.row_start.resize(size + 1, 0);
        self.current_row = None;
        self.rows_started = 0;
        self.finalized = false;
    }

    pub fn begin_row(&mut self, row: usize) -> Result<(), SparseMatrixError> {
        if self.finalized {
            return Err(SparseMatrixError::AlreadyFinalized);
        }
        if row >= self.size {
            return Err(SparseMatrixError::RowOutOfRange { row, size: self.size });
        }
        if let Some(previous) = self.current_row {
            if row <= previous {
                return Err(SparseMatrixError::RowOutOfOrder { previous, row });
            }
        }
        self.row_start[row] = self.values.len();
        self.current_row = Some(row);
        self.rows_started += 1;
        Ok(())
    }

    /// Appends `value` at `col` of the current row. Values below [`DROP_EPSILON`] are skipped.
    #[inline]
    pub fn add_entry(&mut self, col: usize, value: FT) -> Result<(), SparseMatrixError> {
        if self.finalized {
            return Err(SparseMatrixError::AlreadyFinalized);
        }
        let row = self.current_row.ok_or(SparseMatrixError::NoActiveRow)?;
        if col >= self.size {
            return Err(SparseMatrixError::ColumnOutOfRange {
                row,
                col,
                size: self.size,
            });
        }
        if value.abs() < DROP_EPSILON {
            return Ok(());
        }
        self.values.push(value);
        self.col_indices.push(col as u32);
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), SparseMatrixError> {
        if self.finalized {
            return Err(SparseMatrixError::AlreadyFinalized);
        }
        if self.rows_started != self.size {
            return Err(SparseMatrixError::MissingRows {
                started: self.rows_started,
                size: self.size,
            });
        }
        self.row_start[self.size] = self.values.len();
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn non_zeros(&self) -> usize {
        self.values.len()
    }

    fn check_finalized(&self) -> Result<(), SparseMatrixError> {
        if self.finalized {
            Ok(())
        } else {
            Err(SparseMatrixError::NotFinalized)
        }
    }

    /// `y = A x`
    pub fn multiply(&self, x: &[FT], y: &mut [FT]) -> Result<(), SparseMatrixError> {
        self.check_finalized()?;
        if x.len() != self.size || y.len() != self.size {
            return Err(SparseMatrixError::DimensionMismatch {
                size: self.size,
                x: x.len(),
                y: y.len(),
            });
        }

        let values = self.values.as_slice();
        let col_indices = self.col_indices.as_slice();
        for (row, y_row) in y.iter_mut().enumerate() {
            let mut acc = 0.;
            for k in self.row_start[row]..self.row_start[row + 1] {
                acc += values[k] * x[col_indices[k] as usize];
            }
            *y_row = acc;
        }
        Ok(())
    }

    /// Linear scan of `row`. Duplicate entries for `col` are summed, missing entries are zero.
    pub fn get(&self, row: usize, col: usize) -> Result<FT, SparseMatrixError> {
        self.check_finalized()?;
        if row >= self.size {
            return Err(SparseMatrixError::RowOutOfRange { row, size: self.size });
        }
        let values = self.values.as_slice();
        let col_indices = self.col_indices.as_slice();
        let mut value = 0.;
        for k in self.row_start[row]..self.row_start[row + 1] {
            if col_indices[k] as usize == col {
                value += values[k];
            }
        }
        Ok(value)
    }

    pub fn diagonal(&self, row: usize) -> Result<FT, SparseMatrixError> {
        self.get(row, row)
    }

    /// Writes the full diagonal into `out`.
    pub fn diagonal_into(&self, out: &mut [FT]) -> Result<(), SparseMatrixError> {
        if out.len() != self.size {
            return Err(SparseMatrixError::DimensionMismatch {
                size: self.size,
                x: out.len(),
                y: out.len(),
            });
        }
        for (row, d) in out.iter_mut().enumerate() {
            *d = self.diagonal(row)?;
        }
        Ok(())
    }

    /// Number of stored entries in `row`, duplicates included.
    pub fn row_len(&self, row: usize) -> Result<usize, SparseMatrixError> {
        self.check_finalized()?;
        if row >= self.size {
            return Err(SparseMatrixError::RowOutOfRange { row, size: self.size });
        }
        Ok(self.row_start[row + 1] - self.row_start[row])
    }

    pub fn stats(&self) -> SparseMatrixStats {
        let non_zeros = self.non_zeros();
        let dense_entries = (self.size * self.size).max(1);
        SparseMatrixStats {
            size: self.size,
            non_zeros,
            density_percent: non_zeros as FT / dense_entries as FT * 100.,
            memory_bytes: self.values.memory_bytes()
                + self.col_indices.memory_bytes()
                + self.row_start.capacity() * std::mem::size_of::<usize>(),
        }
    }
}

#[cfg(test)]
fn build_dense(dense: &[[FT; 3]; 3]) -> SparseMatrix {
    let mut m = SparseMatrix::new(3);
    for (row, entries) in dense.iter().enumerate() {
        m.begin_row(row).unwrap();
        for (col, &value) in entries.iter().enumerate() {
            m.add_entry(col, value).unwrap();
        }
    }
    m.finalize().unwrap();
    m
}

#[test]
fn multiply_matches_dense_product() {
    let dense = [[2., -1., 0.], [0.5, 3., 0.25], [0., 7., -4.]];
    let m = build_dense(&dense);

    assert_eq!(m.non_zeros(), 7);

    let x = [1.5, -2., 0.75];
    let mut y = [0.; 3];
    m.multiply(&x, &mut y).unwrap();

    for row in 0..3 {
        let expected: FT = (0..3).map(|col| dense[row][col] * x[col]).sum();
        crate::assert_ft_approx_eq(y[row], expected, 1e-6, || format!("row {}", row));
    }

    for row in 0..3 {
        for col in 0..3 {
            assert_eq!(m.get(row, col).unwrap(), dense[row][col]);
        }
    }
    assert_eq!(m.diagonal(1).unwrap(), 3.);

    let mut diag = [0.; 3];
    m.diagonal_into(&mut diag).unwrap();
    assert_eq!(diag, [2., 3., -4.]);
}

#[test]
fn tiny_entries_are_dropped() {
    let mut m = SparseMatrix::new(2);
    m.begin_row(0).unwrap();
    m.add_entry(0, 1.).unwrap();
    m.add_entry(1, 1e-13).unwrap();
    m.begin_row(1).unwrap();
    m.add_entry(1, -1e-20).unwrap();
    m.finalize().unwrap();
    assert_eq!(m.non_zeros(), 1);
    assert_eq!(m.row_len(1).unwrap(), 0);
    assert_eq!(m.get(0, 1).unwrap(), 0.);
}

#[test]
fn duplicate_entries_are_stored_separately_but_act_accumulated() {
    let mut m = SparseMatrix::new(2);
    m.begin_row(0).unwrap();
    m.add_entry(0, 1.).unwrap();
    m.add_entry(0, 2.).unwrap();
    m.begin_row(1).unwrap();
    m.add_entry(1, 5.).unwrap();
    m.finalize().unwrap();

    assert_eq!(m.non_zeros(), 3);
    assert_eq!(m.row_len(0).unwrap(), 2);
    assert_eq!(m.get(0, 0).unwrap(), 3.);

    let mut y = [0.; 2];
    m.multiply(&[1., 1.], &mut y).unwrap();
    assert_eq!(y, [3., 5.]);
}

#[test]
fn out_of_order_rows_are_rejected() {
    let mut m = SparseMatrix::new(3);
    m.begin_row(1).unwrap();
    assert_eq!(
        m.begin_row(1),
        Err(SparseMatrixError::RowOutOfOrder { previous: 1, row: 1 })
    );
    assert_eq!(
        m.begin_row(0),
        Err(SparseMatrixError::RowOutOfOrder { previous: 1, row: 0 })
    );
    assert_eq!(m.begin_row(3), Err(SparseMatrixError::RowOutOfRange { row: 3, size: 3 }));
}

#[test]
fn structural_misuse_is_reported() {
    let mut m = SparseMatrix::new(2);
    assert_eq!(m.add_entry(0, 1.), Err(SparseMatrixError::NoActiveRow));
    m.begin_row(0).unwrap();
    assert_eq!(
        m.add_entry(2, 1.),
        Err(SparseMatrixError::ColumnOutOfRange { row: 0, col: 2, size: 2 })
    );

    let mut y = [0.; 2];
    assert_eq!(m.multiply(&[0., 0.], &mut y), Err(SparseMatrixError::NotFinalized));
    assert_eq!(m.finalize(), Err(SparseMatrixError::MissingRows { started: 1, size: 2 }));

    m.begin_row(1).unwrap();
    m.finalize().unwrap();
    assert_eq!(m.begin_row(1), Err(SparseMatrixError::AlreadyFinalized));
    assert_eq!(
        m.multiply(&[0., 0., 0.], &mut y),
        Err(SparseMatrixError::DimensionMismatch { size: 2, x: 3, y: 2 })
    );
}

#[test]
fn reset_reuses_the_builder() {
    let mut m = build_dense(&[[1., 0., 0.], [0., 1., 0.], [0., 0., 1.]]);
    m.reset(2);
    assert!(!m.is_finalized());
    m.begin_row(0).unwrap();
    m.add_entry(1, 4.).unwrap();
    m.begin_row(1).unwrap();
    m.finalize().unwrap();
    assert_eq!(m.size(), 2);
    assert_eq!(m.get(0, 1).unwrap(), 4.);

    let stats = m.stats();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.non_zeros, 1);
    crate::assert_ft_approx_eq(stats.density_percent, 25., 1e-4, || format!("density"));
    assert!(stats.memory_bytes > 0);
}
