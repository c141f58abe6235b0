use faer::Mat;

/// Dense real matrix storage used by the small solves in the fitter and the
/// polynomial least-squares routines.
pub type DenseMatrix = Mat<f64>;

const SINGULAR_PIVOT_EPSILON: f64 = 1.0e-13;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LuError {
    #[error("LU factorization requires a square matrix, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("LU factorization requires a non-empty matrix")]
    EmptyMatrix,
    #[error("matrix is singular at pivot index {pivot_index}")]
    SingularMatrix { pivot_index: usize },
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone)]
pub struct LuDecomposition {
    lu: DenseMatrix,
    pivots: Vec<usize>,
}

impl LuDecomposition {
    pub fn dimension(&self) -> usize {
        self.lu.nrows()
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
        let dimension = self.dimension();
        if rhs.len() != dimension {
            return Err(LuError::RhsLengthMismatch {
                expected: dimension,
                actual: rhs.len(),
            });
        }

        let mut forward = vec![0.0; dimension];
        for row in 0..dimension {
            let mut value = rhs[self.pivots[row]];
            for col in 0..row {
                value -= self.lu[(row, col)] * forward[col];
            }
            forward[row] = value;
        }

        let mut solution = vec![0.0; dimension];
        for row in (0..dimension).rev() {
            let mut value = forward[row];
            for col in (row + 1)..dimension {
                value -= self.lu[(row, col)] * solution[col];
            }
            let diagonal = self.lu[(row, row)];
            if diagonal.abs() <= SINGULAR_PIVOT_EPSILON {
                return Err(LuError::SingularMatrix { pivot_index: row });
            }
            solution[row] = value / diagonal;
        }

        Ok(solution)
    }

    pub fn invert(&self) -> Result<DenseMatrix, LuError> {
        let dimension = self.dimension();
        let mut inverse = DenseMatrix::zeros(dimension, dimension);
        let mut basis = vec![0.0; dimension];

        for col in 0..dimension {
            basis.fill(0.0);
            basis[col] = 1.0;
            let solution = self.solve(&basis)?;
            for row in 0..dimension {
                inverse[(row, col)] = solution[row];
            }
        }

        Ok(inverse)
    }
}

pub fn lu_factorize(matrix: &DenseMatrix) -> Result<LuDecomposition, LuError> {
    let rows = matrix.nrows();
    let cols = matrix.ncols();
    if rows != cols {
        return Err(LuError::NonSquareMatrix { rows, cols });
    }
    if rows == 0 {
        return Err(LuError::EmptyMatrix);
    }

    let dimension = rows;
    let mut lu = matrix.clone();
    let mut pivots: Vec<usize> = (0..dimension).collect();

    for pivot_col in 0..dimension {
        let mut pivot_row = pivot_col;
        let mut pivot_abs = lu[(pivot_col, pivot_col)].abs();
        for row in (pivot_col + 1)..dimension {
            let candidate = lu[(row, pivot_col)].abs();
            if candidate > pivot_abs {
                pivot_abs = candidate;
                pivot_row = row;
            }
        }
        if pivot_abs <= SINGULAR_PIVOT_EPSILON {
            return Err(LuError::SingularMatrix {
                pivot_index: pivot_col,
            });
        }
        if pivot_row != pivot_col {
            for col in 0..dimension {
                let tmp = lu[(pivot_col, col)];
                lu[(pivot_col, col)] = lu[(pivot_row, col)];
                lu[(pivot_row, col)] = tmp;
            }
            pivots.swap(pivot_col, pivot_row);
        }

        let pivot = lu[(pivot_col, pivot_col)];
        for row in (pivot_col + 1)..dimension {
            let factor = lu[(row, pivot_col)] / pivot;
            lu[(row, pivot_col)] = factor;
            for col in (pivot_col + 1)..dimension {
                let subtrahend = factor * lu[(pivot_col, col)];
                lu[(row, col)] -= subtrahend;
            }
        }
    }

    Ok(LuDecomposition { lu, pivots })
}

/// Convenience: factorize and solve in one step.
pub fn lu_solve(matrix: &DenseMatrix, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
    lu_factorize(matrix)?.solve(rhs)
}
