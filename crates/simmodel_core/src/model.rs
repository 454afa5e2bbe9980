//! Model assembly: load, resolve, simplify and index a complete document.
//!
//! [`Model`] is the explicit context object that owns the quantity store, the
//! formula table and the switches. Construction runs every phase in a fixed
//! order and fails on the first error; a successfully built model is ready
//! for RHS and Jacobian evaluation through [`crate::ode_system::OdeSystem`].

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use log::{debug, info, warn};

use crate::band::BandWidth;
use crate::error::{ModelError, Result};
use crate::formula::{Formula, FormulaId, FormulaTable};
use crate::quantity::{
    Observer, Parameter, Quantity, QuantityHandle, QuantityId, QuantityStore, Species,
};
use crate::settings::ModelSettings;
use crate::xml::{names, XmlNode};

/// One assignment performed when a switch fires.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchChange {
    quantity_id: QuantityId,
    new_formula_id: FormulaId,
    new_formula: Option<Formula>,
}

impl SwitchChange {
    pub fn quantity_id(&self) -> QuantityId {
        self.quantity_id
    }

    pub fn new_formula_id(&self) -> FormulaId {
        self.new_formula_id
    }

    pub fn new_formula(&self) -> Option<&Formula> {
        self.new_formula.as_ref()
    }
}

/// Discrete event reassigning quantities. Only its targets and the state
/// indices its assignments use matter here; triggering belongs to the solver driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Switch {
    id: i64,
    changes: Vec<SwitchChange>,
}

impl Switch {
    pub fn load_from_xml_node(node: &XmlNode) -> Result<Self> {
        const ERROR_SOURCE: &str = "Switch::load_from_xml_node";

        let id = node.attribute_or(names::ID, 0)?;
        let mut changes = Vec::new();
        for change in node.children().iter().filter(|c| c.has_name(names::CHANGE)) {
            let (Some(_), Some(_)) = (
                change.attribute(names::QUANTITY_ID),
                change.attribute(names::NEW_FORMULA_ID),
            ) else {
                return Err(ModelError::parse(
                    ERROR_SOURCE,
                    format!(
                        "switch id={id}: <Change> needs {} and {}",
                        names::QUANTITY_ID,
                        names::NEW_FORMULA_ID
                    ),
                ));
            };
            changes.push(SwitchChange {
                quantity_id: change.attribute_or(names::QUANTITY_ID, 0)?,
                new_formula_id: change.attribute_or(names::NEW_FORMULA_ID, 0)?,
                new_formula: None,
            });
        }
        Ok(Self { id, changes })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn changes(&self) -> &[SwitchChange] {
        &self.changes
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    settings: ModelSettings,
    start_time: f64,
    quantities: QuantityStore,
    formulas: FormulaTable,
    switches: Vec<Switch>,
    species: Vec<QuantityHandle>,
    active_species: Vec<QuantityHandle>,
    switch_assigned_indices: BTreeSet<usize>,
    bandwidth: BandWidth,
}

impl Model {
    pub fn from_xml_str(input: &str, settings: ModelSettings) -> Result<Self> {
        let root = XmlNode::parse(input)?;
        Self::from_xml_node(&root, settings)
    }

    pub fn from_xml_node(root: &XmlNode, settings: ModelSettings) -> Result<Self> {
        settings.validate()?;
        if !root.has_name(names::SIMULATION) {
            return Err(ModelError::parse(
                "Model::from_xml_node",
                format!("expected <{}> root, found <{}>", names::SIMULATION, root.name()),
            ));
        }

        let mut model = Self::load(root, settings)?;
        model.finalize_instances()?;
        model.finalize()?;
        if model.settings.simplify {
            model.simplify();
        }
        model.assign_indices();
        model.cache_used_variables();
        if model.settings.remove_constant_species {
            model.remove_constant_species()?;
        }
        model.bandwidth = model.compute_bandwidth();

        info!(
            "model ready: {} quantities, {} of {} species integrated, bandwidth {:?}",
            model.quantities.len(),
            model.active_species.len(),
            model.species.len(),
            model.bandwidth
        );
        Ok(model)
    }

    fn load(root: &XmlNode, settings: ModelSettings) -> Result<Self> {
        let start_time = root.attribute_or(names::START_TIME, 0.0)?;
        let formulas = match root.child(names::FORMULA_LIST) {
            Some(list) => FormulaTable::load_from_xml_node(list)?,
            None => FormulaTable::new(),
        };

        let mut quantities = QuantityStore::new();
        let mut species = Vec::new();
        for node in list_items(root, names::PARAMETER_LIST, names::PARAMETER) {
            quantities.insert(Quantity::Parameter(Parameter::load_from_xml_node(node)?))?;
        }
        for node in list_items(root, names::VARIABLE_LIST, names::SPECIES) {
            let handle =
                quantities.insert(Quantity::Species(Species::load_from_xml_node(node, &settings)?))?;
            species.push(handle);
        }
        for node in list_items(root, names::OBSERVER_LIST, names::OBSERVER) {
            quantities.insert(Quantity::Observer(Observer::load_from_xml_node(node)?))?;
        }
        let switches = list_items(root, names::SWITCH_LIST, names::SWITCH)
            .map(Switch::load_from_xml_node)
            .collect::<Result<Vec<_>>>()?;

        info!(
            "loaded {} formulas, {} quantities ({} species), {} switches",
            formulas.len(),
            quantities.len(),
            species.len(),
            switches.len()
        );

        Ok(Self {
            settings,
            start_time,
            quantities,
            formulas,
            switches,
            species,
            active_species: Vec::new(),
            switch_assigned_indices: BTreeSet::new(),
            bandwidth: BandWidth::default(),
        })
    }

    /// Resolves formula references, then attaches formulas to quantities and switches.
    fn finalize_instances(&mut self) -> Result<()> {
        self.formulas.xml_finalize_instance(&self.quantities)?;

        let handles: Vec<QuantityHandle> = self.quantities.handles().collect();
        for handle in handles {
            match self.quantities.get_mut(handle) {
                Quantity::Species(species) => {
                    species.xml_finalize_instance(&self.formulas, self.start_time)?
                }
                other => other.core_mut().xml_finalize_instance(&self.formulas)?,
            }
        }

        for switch in self.switches.iter_mut() {
            for change in switch.changes.iter_mut() {
                let formula = self.formulas.get(change.new_formula_id).ok_or_else(|| {
                    ModelError::resolution(
                        "Switch::xml_finalize_instance",
                        format!(
                            "switch id={}: formula with id={} not found",
                            switch.id, change.new_formula_id
                        ),
                    )
                })?;
                change.new_formula = Some(formula.clone());

                let handle = self.quantities.lookup(change.quantity_id).ok_or_else(|| {
                    ModelError::resolution(
                        "Switch::xml_finalize_instance",
                        format!(
                            "switch id={}: target quantity id={} not found",
                            switch.id, change.quantity_id
                        ),
                    )
                })?;
                self.quantities
                    .get_mut(handle)
                    .core_mut()
                    .set_changed_by_switch(true);
            }
        }
        Ok(())
    }

    /// Every formula owned by a quantity or switch must be fully bound.
    fn finalize(&self) -> Result<()> {
        for (_, quantity) in self.quantities.iter() {
            if let Some(formula) = quantity.core().value_formula() {
                formula.finalize()?;
            }
            if let Some(species) = quantity.as_species() {
                species.rhs().iter().try_for_each(Formula::finalize)?;
            }
        }
        for change in self.switches.iter().flat_map(|s| s.changes.iter()) {
            if let Some(formula) = &change.new_formula {
                formula.finalize()?;
            }
        }
        Ok(())
    }

    /// Folds constant subtrees and prunes zero RHS terms until nothing changes.
    fn simplify(&mut self) {
        let handles: Vec<QuantityHandle> = self.quantities.handles().collect();
        for pass in 1..=self.settings.max_simplify_passes {
            let mut changed = false;
            for &handle in &handles {
                changed |= self.simplify_quantity(handle);
            }
            debug!("simplification pass {pass}: changed = {changed}");
            if !changed {
                info!("simplification converged after {pass} pass(es)");
                return;
            }
        }
        warn!(
            "simplification did not converge within {} passes",
            self.settings.max_simplify_passes
        );
    }

    fn simplify_quantity(&mut self, handle: QuantityHandle) -> bool {
        let store = &self.quantities;
        let mut quantity = store.get(handle).clone();
        let changed = match &mut quantity {
            Quantity::Species(species) => species.simplify(store, self.start_time, false),
            other => other
                .core_mut()
                .simplify_value_formula(store, self.start_time, false),
        };
        if changed {
            *self.quantities.get_mut(handle) = quantity;
        }
        changed
    }

    fn assign_indices(&mut self) {
        let mut next_index = 0;
        for &handle in &self.species {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                species.de_set_species_index(&mut next_index);
            }
        }
        self.active_species = self.species.clone();
        self.update_indices_of_referenced_variables();
        debug!("assigned {next_index} ODE indices");
    }

    /// Refreshes the species indices cached in every owned formula.
    fn update_indices_of_referenced_variables(&mut self) {
        let handles: Vec<QuantityHandle> = self.quantities.handles().collect();
        for handle in handles {
            let store = &self.quantities;
            let quantity = store.get(handle);
            let value_formula = quantity.core().value_formula().cloned().map(|mut f| {
                f.update_indices_of_referenced_variables(store);
                f
            });
            let rhs = quantity.as_species().map(|species| {
                let mut rhs = species.rhs().to_vec();
                for term in rhs.iter_mut() {
                    term.update_indices_of_referenced_variables(store);
                }
                rhs
            });

            let quantity = self.quantities.get_mut(handle);
            if let Some(formula) = value_formula {
                quantity.core_mut().set_value_formula(formula);
            }
            if let (Some(species), Some(rhs)) = (quantity.as_species_mut(), rhs) {
                species.set_rhs(rhs);
            }
        }

        for change in self.switches.iter_mut().flat_map(|s| s.changes.iter_mut()) {
            if let Some(formula) = change.new_formula.as_mut() {
                formula.update_indices_of_referenced_variables(&self.quantities);
            }
        }
        self.switch_assigned_indices = self.collect_switch_assigned_indices();
    }

    fn collect_switch_assigned_indices(&self) -> BTreeSet<usize> {
        let mut used = BTreeSet::new();
        let none = BTreeSet::new();
        for formula in self
            .switches
            .iter()
            .flat_map(|s| s.changes.iter())
            .filter_map(|c| c.new_formula.as_ref())
        {
            formula.append_used_variables(&self.quantities, &mut used, &none);
        }
        used
    }

    fn cache_used_variables(&mut self) {
        for &handle in &self.active_species {
            let used = match self.quantities.get(handle).as_species() {
                Some(species) => {
                    species.collect_rhs_used_variables(&self.quantities, &self.switch_assigned_indices)
                }
                None => continue,
            };
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                species.cache_rhs_used_variables(used);
            }
        }
    }

    /// Converts species that are constant for the current run into literals
    /// and compacts the indices of the remaining ones. A species without RHS
    /// terms whose initial value depends on non-constant quantities stays in
    /// the state vector with a zero derivative.
    fn remove_constant_species(&mut self) -> Result<()> {
        let mut constant = Vec::new();
        let mut kept = Vec::new();
        for &handle in &self.active_species {
            let Some(species) = self.quantities.get(handle).as_species() else {
                continue;
            };
            if species.is_constant(&self.quantities, true) {
                constant.push((handle, species.initial_value(&self.quantities)));
            } else {
                kept.push(handle);
            }
        }
        if constant.is_empty() {
            return Ok(());
        }

        for (handle, initial_value) in constant.iter().copied() {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                warn!(
                    "species id={} ({}) has no RHS terms, converted to constant {}",
                    species.core().id(),
                    species.core().path(),
                    initial_value
                );
                species.fill_with_initial_value(initial_value);
            }
        }

        let mut index_map = HashMap::new();
        for (new_index, &handle) in kept.iter().enumerate() {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                if let Some(old_index) = species.ode_index() {
                    index_map.insert(old_index, new_index);
                }
                species.set_ode_index(Some(new_index));
            }
        }
        for &handle in &kept {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                species.change_indices_of_rhs_used_variables(&index_map)?;
            }
        }

        self.active_species = kept;
        self.update_indices_of_referenced_variables();
        info!(
            "removed {} constant species, {} remain in the state vector",
            constant.len(),
            self.active_species.len()
        );
        Ok(())
    }

    fn compute_bandwidth(&self) -> BandWidth {
        self.active_species
            .iter()
            .filter_map(|&h| self.quantities.get(h).as_species())
            .fold(BandWidth::default(), |width, species| {
                width.union(species.get_rhs_used_band_range())
            })
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn quantities(&self) -> &QuantityStore {
        &self.quantities
    }

    pub fn formulas(&self) -> &FormulaTable {
        &self.formulas
    }

    pub fn switches(&self) -> &[Switch] {
        &self.switches
    }

    /// Number of integrated species.
    pub fn dimension(&self) -> usize {
        self.active_species.len()
    }

    /// Integrated species, ordered by ODE index.
    pub fn active_species(&self) -> impl Iterator<Item = &Species> {
        self.active_species
            .iter()
            .filter_map(|&h| self.quantities.get(h).as_species())
    }

    /// Every species of the document, integrated or not.
    pub fn all_species(&self) -> impl Iterator<Item = &Species> {
        self.species
            .iter()
            .filter_map(|&h| self.quantities.get(h).as_species())
    }

    pub fn species(&self, id: QuantityId) -> Option<&Species> {
        self.quantities.by_id(id).and_then(Quantity::as_species)
    }

    pub fn switch_assigned_indices(&self) -> &BTreeSet<usize> {
        &self.switch_assigned_indices
    }

    pub fn bandwidth(&self) -> BandWidth {
        self.bandwidth
    }

    /// Appends the current state to the stored values of every integrated
    /// species, unscaled.
    pub fn store_state(&mut self, y: &[f64]) {
        debug_assert_eq!(y.len(), self.active_species.len());
        for &handle in &self.active_species {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                species.store_value(y);
            }
        }
    }

    pub fn set_values_below_abs_tol_to_zero(&mut self, abs_tol: f64) {
        for &handle in &self.species {
            if let Some(species) = self.quantities.get_mut(handle).as_species_mut() {
                species.set_values_below_abs_tol_to_zero(abs_tol);
            }
        }
    }
}

fn list_items<'a>(
    root: &'a XmlNode,
    list: &str,
    item: &'a str,
) -> impl Iterator<Item = &'a XmlNode> + 'a {
    root.child(list)
        .map(XmlNode::children)
        .unwrap_or_default()
        .iter()
        .filter(move |c| c.has_name(item))
}

/// Reads and builds a model document from disk.
pub fn load_model_file(path: impl AsRef<Path>, settings: ModelSettings) -> anyhow::Result<Model> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        bail!("Model file path must not be empty.");
    }
    let input = fs::read_to_string(path)
        .with_context(|| format!("failed to read model file {}", path.display()))?;
    let model = Model::from_xml_str(&input, settings)
        .with_context(|| format!("failed to build model from {}", path.display()))?;
    Ok(model)
}
