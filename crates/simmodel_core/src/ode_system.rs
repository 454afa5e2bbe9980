use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::band::{BandWidth, BandedJacobian};
use crate::model::Model;
use crate::traits::{DynamicalSystem, JacobianMatrix};

/// Solver-facing view of a finalized [`Model`].
///
/// The state vector holds the integrated species in ODE index order.
#[derive(Debug, Clone, Copy)]
pub struct OdeSystem<'a> {
    model: &'a Model,
}

impl<'a> OdeSystem<'a> {
    pub fn new(model: &'a Model) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    /// Accumulates the Jacobian into caller-owned storage. The storage is
    /// expected to be zeroed.
    pub fn jacobian(&self, t: f64, y: &[f64], jacobian: &mut dyn JacobianMatrix) {
        debug_assert_eq!(jacobian.dimension(), self.dimension());
        let store = self.model.quantities();
        for species in self.model.active_species() {
            species.de_jacobian(store, jacobian, y, t);
        }
    }

    pub fn dense_jacobian(&self, t: f64, y: &[f64]) -> DMatrix<f64> {
        let n = self.dimension();
        let mut jacobian = DMatrix::zeros(n, n);
        self.jacobian(t, y, &mut jacobian);
        jacobian
    }

    pub fn banded_jacobian(&self, t: f64, y: &[f64]) -> BandedJacobian {
        let mut jacobian = BandedJacobian::new(self.dimension(), self.bandwidth());
        self.jacobian(t, y, &mut jacobian);
        jacobian
    }

    pub fn sparse_jacobian(&self, t: f64, y: &[f64]) -> CsrMatrix<f64> {
        let n = self.dimension();
        let mut jacobian = CooMatrix::new(n, n);
        self.jacobian(t, y, &mut jacobian);
        CsrMatrix::from(&jacobian)
    }

    pub fn bandwidth(&self) -> BandWidth {
        self.model.bandwidth()
    }

    /// Initial values of the integrated species, in the same units formulas
    /// read from the state vector. Scale factors only divide equation rows, so
    /// the state needs no rescaling in either direction.
    pub fn initial_state(&self) -> Vec<f64> {
        let store = self.model.quantities();
        self.model
            .active_species()
            .map(|species| species.initial_value(store))
            .collect()
    }

    pub fn negative_values_allowed(&self) -> Vec<bool> {
        self.model
            .active_species()
            .map(|species| species.negative_values_allowed())
            .collect()
    }
}

impl DynamicalSystem<f64> for OdeSystem<'_> {
    fn dimension(&self) -> usize {
        self.model.dimension()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        out.fill(0.0);
        let store = self.model.quantities();
        for species in self.model.active_species() {
            species.de_rhs(store, x, t, out);
        }
    }
}
