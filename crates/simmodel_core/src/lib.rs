//! The `simmodel_core` crate turns an XML-encoded pharmacokinetic model into
//! an ODE system an implicit solver can drive: right-hand side evaluation and
//! the analytic Jacobian, with per-species scaling and a banded sparsity layout.
//!
//! Key components:
//! - **Formula**: expression trees with evaluation, chain-rule Jacobians,
//!   used-variable analysis, constant folding and Matlab rendering.
//! - **QuantityReference**: deferred, typed binding of formula leaves to quantities.
//! - **Quantity**: parameters, observers and species (the ODE state variables).
//! - **Model**: load → resolve → simplify → index pipeline over one document.
//! - **OdeSystem**: the solver-facing `DynamicalSystem` with dense, banded and
//!   sparse Jacobians.
pub mod band;
pub mod error;
pub mod export;
pub mod formula;
pub mod model;
pub mod ode_system;
pub mod quantity;
pub mod quantity_reference;
pub mod settings;
pub mod traits;
pub mod xml;

pub use error::{ModelError, Result};
pub use model::{load_model_file, Model};
pub use ode_system::OdeSystem;
pub use settings::ModelSettings;
