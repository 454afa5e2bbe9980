use nalgebra::DMatrix;
use nalgebra_sparse::CooMatrix;
use num_traits::{Float, FloatConst, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that formula functions can be evaluated in.
/// Must support the transcendental functions, debug printing, and conversion from f64.
pub trait Scalar: Float + FloatConst + FromPrimitive + Debug + 'static {}

impl<T: Float + FloatConst + FromPrimitive + Debug + 'static> Scalar for T {}

/// Right-hand side of an ODE system as seen by an external integrator.
pub trait DynamicalSystem<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt into
    fn apply(&self, t: T, x: &[T], out: &mut [T]);
}

/// Caller-owned Jacobian storage addressed by (equation index, dependency index).
///
/// Contributions are accumulated: several formula nodes may add to the same entry.
pub trait JacobianMatrix {
    fn dimension(&self) -> usize;

    /// Adds `value` to the entry (row, column).
    fn add(&mut self, row: usize, column: usize, value: f64);
}

impl JacobianMatrix for DMatrix<f64> {
    fn dimension(&self) -> usize {
        self.nrows()
    }

    fn add(&mut self, row: usize, column: usize, value: f64) {
        self[(row, column)] += value;
    }
}

/// Triplet storage; duplicate entries are summed on conversion to CSR/CSC.
impl JacobianMatrix for CooMatrix<f64> {
    fn dimension(&self) -> usize {
        self.nrows()
    }

    fn add(&mut self, row: usize, column: usize, value: f64) {
        self.push(row, column, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CsrMatrix;

    #[test]
    fn dense_matrix_accumulates() {
        let mut jac = DMatrix::<f64>::zeros(2, 2);
        jac.add(0, 1, 1.5);
        jac.add(0, 1, 0.5);
        assert_eq!(jac[(0, 1)], 2.0);
        assert_eq!(JacobianMatrix::dimension(&jac), 2);
    }

    #[test]
    fn coo_matrix_sums_duplicates_on_conversion() {
        let mut jac = CooMatrix::<f64>::new(3, 3);
        jac.add(2, 0, 1.0);
        jac.add(2, 0, -3.0);
        let csr = CsrMatrix::from(&jac);
        let row = csr.row(2);
        assert_eq!(row.col_indices(), &[0]);
        assert_eq!(row.values(), &[-2.0]);
    }
}
