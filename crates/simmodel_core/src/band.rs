//! Banded Jacobian storage.
//!
//! Nonzero locations (i, j) of the Jacobian satisfy
//! `-lower <= j - i <= upper`, where i is the equation (row) index.
//! The band is stored LAPACK-style: entry (i, j) lives at row `upper + i - j`
//! of column j in a `(lower + upper + 1) x n` matrix.

use log::warn;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::traits::JacobianMatrix;

/// Upper/lower half-bandwidths of a Jacobian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandWidth {
    pub upper: usize,
    pub lower: usize,
}

impl BandWidth {
    pub fn new(upper: usize, lower: usize) -> Self {
        Self { upper, lower }
    }

    /// Widens this band so that it also covers `other`.
    pub fn union(self, other: BandWidth) -> BandWidth {
        BandWidth {
            upper: self.upper.max(other.upper),
            lower: self.lower.max(other.lower),
        }
    }

    pub fn contains(&self, row: usize, column: usize) -> bool {
        if column >= row {
            column - row <= self.upper
        } else {
            row - column <= self.lower
        }
    }
}

#[derive(Debug, Clone)]
pub struct BandedJacobian {
    n: usize,
    width: BandWidth,
    band: DMatrix<f64>,
}

impl BandedJacobian {
    pub fn new(n: usize, width: BandWidth) -> Self {
        Self {
            n,
            width,
            band: DMatrix::zeros(width.lower + width.upper + 1, n),
        }
    }

    pub fn width(&self) -> BandWidth {
        self.width
    }

    /// Raw band storage, column-major as expected by banded LU solvers.
    pub fn band(&self) -> &DMatrix<f64> {
        &self.band
    }

    pub fn get(&self, row: usize, column: usize) -> f64 {
        if self.width.contains(row, column) {
            self.band[(self.width.upper + row - column, column)]
        } else {
            0.0
        }
    }

    pub fn clear(&mut self) {
        self.band.fill(0.0);
    }

    /// Expands the band into a dense matrix.
    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.n, self.n, |i, j| self.get(i, j))
    }
}

impl JacobianMatrix for BandedJacobian {
    fn dimension(&self) -> usize {
        self.n
    }

    fn add(&mut self, row: usize, column: usize, value: f64) {
        if !self.width.contains(row, column) {
            debug_assert!(false, "Jacobian entry ({row}, {column}) outside band {:?}", self.width);
            warn!("Dropping Jacobian entry ({row}, {column}) outside band {:?}", self.width);
            return;
        }
        self.band[(self.width.upper + row - column, column)] += value;
    }
}
