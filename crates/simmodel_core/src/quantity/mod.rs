//! Named, identified model quantities: parameters, species and observers.
//!
//! Quantities live in a [`QuantityStore`] arena and are addressed by
//! [`QuantityHandle`]s; formulas hold handles, never owning pointers.

mod species;

pub use species::Species;

use std::collections::{BTreeSet, HashMap};

use crate::error::{ModelError, Result};
use crate::formula::{Formula, FormulaId, FormulaTable, ScaleFactorUsageMode};
use crate::traits::JacobianMatrix;
use crate::xml::{names, XmlNode};

pub type QuantityId = i64;

/// Id used when a quantity element carries no `Id` attribute.
pub const INVALID_QUANTITY_ID: QuantityId = -1;
/// Reserved id of the "Time" pseudo-quantity.
pub const TIME_QUANTITY_ID: QuantityId = -2;

/// Position of a quantity inside its [`QuantityStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuantityHandle(pub(crate) usize);

impl QuantityHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// State shared by every quantity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantityCore {
    id: QuantityId,
    name: String,
    path: String,
    value: f64,
    value_formula_id: Option<FormulaId>,
    value_formula: Option<Formula>,
    is_changed_by_switch: bool,
    values: Vec<f64>,
}

impl QuantityCore {
    pub fn new(id: QuantityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            path: String::new(),
            value: 0.0,
            value_formula_id: None,
            value_formula: None,
            is_changed_by_switch: false,
            values: Vec::new(),
        }
    }

    /// Reads id, name, path, literal value and the id of the value formula
    /// (attribute `formula_attribute`).
    pub fn load_from_xml_node(node: &XmlNode, formula_attribute: &str) -> Result<Self> {
        let id = node.attribute_or(names::ID, INVALID_QUANTITY_ID)?;
        if id == INVALID_QUANTITY_ID {
            return Err(ModelError::parse(
                "Quantity::load_from_xml_node",
                format!("<{}> without {} attribute", node.name(), names::ID),
            ));
        }

        let mut core = Self::new(id, node.attribute(names::NAME).unwrap_or_default());
        core.path = node.attribute(names::PATH).unwrap_or_default().to_string();
        core.value = node.attribute_or(names::VALUE, 0.0)?;
        core.value_formula_id = match node.attribute(formula_attribute) {
            Some(_) => Some(node.attribute_or(formula_attribute, 0)?),
            None => None,
        };
        Ok(core)
    }

    /// Attaches the value formula named during load.
    pub fn xml_finalize_instance(&mut self, formulas: &FormulaTable) -> Result<()> {
        if let Some(formula_id) = self.value_formula_id {
            let formula = formulas.get(formula_id).ok_or_else(|| {
                ModelError::resolution(
                    "Quantity::xml_finalize_instance",
                    format!(
                        "Formula with id={} not found (in quantity with id={})",
                        formula_id, self.id
                    ),
                )
            })?;
            self.value_formula = Some(formula.clone());
        }
        Ok(())
    }

    pub fn id(&self) -> QuantityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn literal_value(&self) -> f64 {
        self.value
    }

    pub fn value_formula(&self) -> Option<&Formula> {
        self.value_formula.as_ref()
    }

    pub fn value_formula_mut(&mut self) -> Option<&mut Formula> {
        self.value_formula.as_mut()
    }

    pub fn set_value_formula(&mut self, formula: Formula) {
        self.value_formula = Some(formula);
    }

    /// Folds the value formula in place. Returns whether it changed.
    pub fn simplify_value_formula(
        &mut self,
        store: &QuantityStore,
        start_time: f64,
        for_current_run_only: bool,
    ) -> bool {
        self.value_formula
            .as_mut()
            .map_or(false, |f| f.simplify(store, start_time, for_current_run_only))
    }

    /// Replaces the value formula with a literal.
    pub fn set_constant_value(&mut self, value: f64) {
        self.value_formula = None;
        self.value = value;
    }

    pub fn is_changed_by_switch(&self) -> bool {
        self.is_changed_by_switch
    }

    pub fn set_changed_by_switch(&mut self, changed: bool) {
        self.is_changed_by_switch = changed;
    }

    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        !self.is_changed_by_switch
            && self
                .value_formula
                .as_ref()
                .map_or(true, |f| f.is_constant(store, for_current_run_only))
    }

    pub fn value(
        &self,
        store: &QuantityStore,
        y: &[f64],
        time: f64,
        mode: ScaleFactorUsageMode,
    ) -> f64 {
        match &self.value_formula {
            Some(formula) => formula.de_compute(store, y, time, mode),
            None => self.value,
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn store_value(&mut self, value: f64) {
        self.values.push(value);
    }

    /// Collapses the stored output values to a single sample.
    pub fn set_the_only_value(&mut self, value: f64) {
        self.values.clear();
        self.values.push(value);
    }

    pub fn set_values_below_abs_tol_to_zero(&mut self, abs_tol: f64) {
        for value in self.values.iter_mut() {
            if value.abs() < abs_tol {
                *value = 0.0;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    core: QuantityCore,
    can_be_varied: bool,
}

impl Parameter {
    pub fn with_value(id: QuantityId, name: &str, value: f64) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.value = value;
        Self {
            core,
            can_be_varied: false,
        }
    }

    pub fn with_formula(id: QuantityId, name: &str, formula: Formula) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.value_formula = Some(formula);
        Self {
            core,
            can_be_varied: false,
        }
    }

    pub fn load_from_xml_node(node: &XmlNode) -> Result<Self> {
        Ok(Self {
            core: QuantityCore::load_from_xml_node(node, names::FORMULA_ID)?,
            can_be_varied: node.bool_attribute_or(names::CAN_BE_VARIED, false)?,
        })
    }

    pub fn core(&self) -> &QuantityCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut QuantityCore {
        &mut self.core
    }

    pub fn can_be_varied(&self) -> bool {
        self.can_be_varied
    }

    pub fn set_can_be_varied(&mut self, can_be_varied: bool) {
        self.can_be_varied = can_be_varied;
    }

    /// A parameter that may be varied between runs is constant for the current run only.
    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        self.core.is_constant(store, for_current_run_only)
            && (for_current_run_only || !self.can_be_varied)
    }

    /// Dependencies of the value formula; a parameter reassigned by a switch
    /// additionally depends on everything the switch assignments use.
    pub fn append_used_variables(
        &self,
        store: &QuantityStore,
        used: &mut BTreeSet<usize>,
        switch_assigned: &BTreeSet<usize>,
    ) {
        if let Some(formula) = &self.core.value_formula {
            formula.append_used_variables(store, used, switch_assigned);
        }
        if self.core.is_changed_by_switch {
            used.extend(switch_assigned.iter().copied());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observer {
    core: QuantityCore,
}

impl Observer {
    pub fn with_formula(id: QuantityId, name: &str, formula: Formula) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.value_formula = Some(formula);
        Self { core }
    }

    pub fn load_from_xml_node(node: &XmlNode) -> Result<Self> {
        let core = QuantityCore::load_from_xml_node(node, names::FORMULA_ID)?;
        if core.value_formula_id.is_none() {
            return Err(ModelError::parse(
                "Observer::load_from_xml_node",
                format!("Observer id={} has no {}", core.id, names::FORMULA_ID),
            ));
        }
        Ok(Self { core })
    }

    pub fn core(&self) -> &QuantityCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut QuantityCore {
        &mut self.core
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Quantity {
    Parameter(Parameter),
    Species(Species),
    Observer(Observer),
}

impl Quantity {
    pub fn core(&self) -> &QuantityCore {
        match self {
            Quantity::Parameter(p) => p.core(),
            Quantity::Species(s) => s.core(),
            Quantity::Observer(o) => o.core(),
        }
    }

    pub fn core_mut(&mut self) -> &mut QuantityCore {
        match self {
            Quantity::Parameter(p) => p.core_mut(),
            Quantity::Species(s) => s.core_mut(),
            Quantity::Observer(o) => o.core_mut(),
        }
    }

    pub fn id(&self) -> QuantityId {
        self.core().id()
    }

    pub fn as_species(&self) -> Option<&Species> {
        match self {
            Quantity::Species(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_species_mut(&mut self) -> Option<&mut Species> {
        match self {
            Quantity::Species(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_parameter(&self) -> Option<&Parameter> {
        match self {
            Quantity::Parameter(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_parameter_mut(&mut self) -> Option<&mut Parameter> {
        match self {
            Quantity::Parameter(p) => Some(p),
            _ => None,
        }
    }

    pub fn value(
        &self,
        store: &QuantityStore,
        y: &[f64],
        time: f64,
        mode: ScaleFactorUsageMode,
    ) -> f64 {
        match self {
            Quantity::Species(s) => s.value(store, y, time, mode),
            _ => self.core().value(store, y, time, mode),
        }
    }

    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        match self {
            Quantity::Parameter(p) => p.is_constant(store, for_current_run_only),
            Quantity::Species(s) => s.is_constant(store, for_current_run_only),
            Quantity::Observer(o) => o.core.is_constant(store, for_current_run_only),
        }
    }

    pub fn is_changed_by_switch(&self) -> bool {
        self.core().is_changed_by_switch()
    }

    /// Jacobian contribution of a quantity reached through a reference.
    /// Active species are handled by the referencing leaf itself.
    pub fn de_jacobian(
        &self,
        store: &QuantityStore,
        jacobian: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
        equation: usize,
        pre_factor: f64,
    ) {
        match self {
            Quantity::Species(s) => {
                debug_assert!(
                    s.is_constant_during_calculation(),
                    "species id={} reached through its quantity while being integrated",
                    s.core().id()
                );
            }
            _ => {
                if let Some(formula) = self.core().value_formula() {
                    formula.de_jacobian(store, jacobian, y, time, equation, pre_factor);
                }
            }
        }
    }

    pub fn append_used_variables(
        &self,
        store: &QuantityStore,
        used: &mut BTreeSet<usize>,
        switch_assigned: &BTreeSet<usize>,
    ) {
        match self {
            Quantity::Parameter(p) => p.append_used_variables(store, used, switch_assigned),
            Quantity::Observer(o) => {
                if let Some(formula) = o.core.value_formula() {
                    formula.append_used_variables(store, used, switch_assigned);
                }
            }
            Quantity::Species(_) => {}
        }
    }
}

/// Simulation-wide quantity registry: arena plus id lookup table.
#[derive(Debug, Clone, Default)]
pub struct QuantityStore {
    quantities: Vec<Quantity>,
    by_id: HashMap<QuantityId, QuantityHandle>,
}

impl QuantityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, quantity: Quantity) -> Result<QuantityHandle> {
        let id = quantity.id();
        if id == TIME_QUANTITY_ID {
            return Err(ModelError::configuration(
                "QuantityStore::insert",
                format!("id={id} is reserved for Time"),
            ));
        }
        if self.by_id.contains_key(&id) {
            return Err(ModelError::configuration(
                "QuantityStore::insert",
                format!("duplicate quantity id={id}"),
            ));
        }
        let handle = QuantityHandle(self.quantities.len());
        self.quantities.push(quantity);
        self.by_id.insert(id, handle);
        Ok(handle)
    }

    pub fn lookup(&self, id: QuantityId) -> Option<QuantityHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn get(&self, handle: QuantityHandle) -> &Quantity {
        &self.quantities[handle.0]
    }

    pub fn get_mut(&mut self, handle: QuantityHandle) -> &mut Quantity {
        &mut self.quantities[handle.0]
    }

    pub fn by_id(&self, id: QuantityId) -> Option<&Quantity> {
        self.lookup(id).map(|h| self.get(h))
    }

    pub fn len(&self) -> usize {
        self.quantities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quantities.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = QuantityHandle> {
        (0..self.quantities.len()).map(QuantityHandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (QuantityHandle, &Quantity)> {
        self.quantities
            .iter()
            .enumerate()
            .map(|(i, q)| (QuantityHandle(i), q))
    }
}
