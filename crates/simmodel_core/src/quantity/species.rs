use std::collections::{BTreeSet, HashMap};
use std::io::{self, Write};

use log::debug;

use crate::band::BandWidth;
use crate::error::{ModelError, Result};
use crate::formula::{Formula, FormulaId, FormulaTable, ScaleFactorUsageMode};
use crate::settings::ModelSettings;
use crate::traits::JacobianMatrix;
use crate::xml::{names, XmlNode};

use super::{QuantityCore, QuantityId, QuantityStore};

/// ODE state variable.
///
/// The derivative of a species is the sum of its RHS terms divided by its
/// scale factor. The sorted list of state indices those terms depend on is
/// cached once indices are final and drives the Jacobian band layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Species {
    core: QuantityCore,
    scale_factor: f64,
    inv_scale_factor: f64,
    ode_index: Option<usize>,
    rhs: Vec<Formula>,
    rhs_formula_ids: Vec<FormulaId>,
    rhs_used_variables: Vec<usize>,
    negative_values_allowed: bool,
    simulation_start_time: f64,
}

impl Species {
    fn from_core(core: QuantityCore) -> Self {
        Self {
            core,
            scale_factor: 1.0,
            inv_scale_factor: 1.0,
            ode_index: None,
            rhs: Vec::new(),
            rhs_formula_ids: Vec::new(),
            rhs_used_variables: Vec::new(),
            negative_values_allowed: true,
            simulation_start_time: 0.0,
        }
    }

    pub fn with_value(id: QuantityId, name: &str, value: f64) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.set_constant_value(value);
        Self::from_core(core)
    }

    pub fn with_initial_formula(id: QuantityId, name: &str, formula: Formula) -> Self {
        let mut core = QuantityCore::new(id, name);
        core.set_value_formula(formula);
        Self::from_core(core)
    }

    pub fn load_from_xml_node(node: &XmlNode, settings: &ModelSettings) -> Result<Self> {
        let core = QuantityCore::load_from_xml_node(node, names::INITIAL_VALUE_FORMULA_ID)?;
        let mut species = Self::from_core(core);

        let scale_factor = node.child_value_or(names::SCALE_FACTOR, 1.0)?;
        species.set_ode_scale_factor(scale_factor)?;

        species.negative_values_allowed =
            node.bool_attribute_or(names::NEGATIVE_VALUES_ALLOWED, species.negative_values_allowed)?;
        if settings.negative_values_forced(species.core.path()) {
            species.negative_values_allowed = true;
        }

        if let Some(list) = node.child(names::RHS_FORMULA_LIST) {
            for rhs_node in list.children().iter().filter(|c| c.has_name(names::RHS_FORMULA)) {
                let id = rhs_node.attribute_or(names::ID, FormulaId::MIN)?;
                if id == FormulaId::MIN {
                    return Err(ModelError::parse(
                        "Species::load_from_xml_node",
                        format!("species id={}: <{}> without Id", species.core.id(), names::RHS_FORMULA),
                    ));
                }
                species.rhs_formula_ids.push(id);
            }
        }
        Ok(species)
    }

    /// Attaches initial value and RHS formulas by id.
    pub fn xml_finalize_instance(&mut self, formulas: &FormulaTable, start_time: f64) -> Result<()> {
        self.core.xml_finalize_instance(formulas)?;
        self.simulation_start_time = start_time;

        self.rhs.clear();
        for &formula_id in &self.rhs_formula_ids {
            let formula = formulas.get(formula_id).ok_or_else(|| {
                ModelError::resolution(
                    "Species::xml_finalize_instance",
                    format!(
                        "RHS formula with id={} not found (in species with id={})",
                        formula_id,
                        self.core.id()
                    ),
                )
            })?;
            self.rhs.push(formula.clone());
        }
        debug!(
            "species id={} finalized with {} RHS terms",
            self.core.id(),
            self.rhs.len()
        );
        Ok(())
    }

    pub fn core(&self) -> &QuantityCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut QuantityCore {
        &mut self.core
    }

    pub fn set_ode_scale_factor(&mut self, scale_factor: f64) -> Result<()> {
        if !(scale_factor > 0.0) {
            return Err(ModelError::configuration(
                "Species::set_ode_scale_factor",
                format!(
                    "species id={}: Scale factor must be > 0 (got {})",
                    self.core.id(),
                    scale_factor
                ),
            ));
        }
        self.scale_factor = scale_factor;
        self.inv_scale_factor = 1.0 / scale_factor;
        Ok(())
    }

    pub fn ode_scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn inv_ode_scale_factor(&self) -> f64 {
        self.inv_scale_factor
    }

    pub fn ode_index(&self) -> Option<usize> {
        self.ode_index
    }

    pub fn set_ode_index(&mut self, index: Option<usize>) {
        self.ode_index = index;
    }

    /// Assigns the next free state slot and advances the counter.
    pub fn de_set_species_index(&mut self, next_index: &mut usize) {
        self.ode_index = Some(*next_index);
        *next_index += 1;
    }

    pub fn negative_values_allowed(&self) -> bool {
        self.negative_values_allowed
    }

    pub fn set_negative_values_allowed(&mut self, allowed: bool) {
        self.negative_values_allowed = allowed;
    }

    pub fn simulation_start_time(&self) -> f64 {
        self.simulation_start_time
    }

    pub fn set_simulation_start_time(&mut self, start_time: f64) {
        self.simulation_start_time = start_time;
    }

    pub fn rhs(&self) -> &[Formula] {
        &self.rhs
    }

    pub fn add_rhs_formula(&mut self, formula: Formula) {
        self.rhs.push(formula);
    }

    /// Replaces the RHS terms, e.g. with simplified or re-indexed copies.
    pub fn set_rhs(&mut self, rhs: Vec<Formula>) {
        self.rhs = rhs;
    }

    /// No RHS terms and never reassigned by a switch.
    pub fn is_constant_during_calculation(&self) -> bool {
        self.rhs.is_empty() && !self.core.is_changed_by_switch()
    }

    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        self.is_constant_during_calculation() && self.core.is_constant(store, for_current_run_only)
    }

    /// Current value. Integrated species read their state entry; initial value
    /// computation and lifted species never touch the state vector.
    pub fn value(
        &self,
        store: &QuantityStore,
        y: &[f64],
        _time: f64,
        mode: ScaleFactorUsageMode,
    ) -> f64 {
        match (mode, self.ode_index) {
            (ScaleFactorUsageMode::UseScaleFactor, Some(index)) if index < y.len() => y[index],
            _ => self.initial_value(store),
        }
    }

    /// Value formula evaluated at the simulation start time, scaling ignored.
    pub fn initial_value(&self, store: &QuantityStore) -> f64 {
        self.core.value(
            store,
            &[],
            self.simulation_start_time,
            ScaleFactorUsageMode::IgnoreScaleFactor,
        )
    }

    /// Folds the initial value formula and every RHS term, then drops the
    /// terms that became zero. Returns whether anything changed; the species
    /// is a lifting candidate afterwards when `is_constant` holds.
    pub fn simplify(
        &mut self,
        store: &QuantityStore,
        start_time: f64,
        for_current_run_only: bool,
    ) -> bool {
        let mut changed = self
            .core
            .simplify_value_formula(store, start_time, for_current_run_only);
        for term in self.rhs.iter_mut() {
            changed |= term.simplify(store, start_time, for_current_run_only);
        }
        changed |= self.simplify_rhs_list();
        changed
    }

    /// Removes RHS terms that are provably zero. Returns whether anything was removed.
    pub fn simplify_rhs_list(&mut self) -> bool {
        let before = self.rhs.len();
        self.rhs.retain(|term| !term.is_zero());
        self.rhs.len() != before
    }

    pub fn de_rhs(&self, store: &QuantityStore, y: &[f64], time: f64, ydot: &mut [f64]) {
        let Some(index) = self.ode_index else {
            return;
        };
        let mut sum = 0.0;
        for term in &self.rhs {
            sum += term.de_compute(store, y, time, ScaleFactorUsageMode::UseScaleFactor);
        }
        ydot[index] = sum * self.inv_scale_factor;
    }

    pub fn de_jacobian(
        &self,
        store: &QuantityStore,
        jacobian: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
    ) {
        let Some(index) = self.ode_index else {
            return;
        };
        for term in &self.rhs {
            term.de_jacobian(store, jacobian, y, time, index, self.inv_scale_factor);
        }
    }

    /// Union of the state indices used by all RHS terms.
    pub fn collect_rhs_used_variables(
        &self,
        store: &QuantityStore,
        switch_assigned: &BTreeSet<usize>,
    ) -> BTreeSet<usize> {
        let mut used = BTreeSet::new();
        for term in &self.rhs {
            term.append_used_variables(store, &mut used, switch_assigned);
        }
        used
    }

    pub fn cache_rhs_used_variables(&mut self, used: BTreeSet<usize>) {
        self.rhs_used_variables = used.into_iter().collect();
    }

    /// Sorted ascending, no duplicates.
    pub fn rhs_used_variables(&self) -> &[usize] {
        &self.rhs_used_variables
    }

    pub fn rhs_depends_on(&self, index: usize) -> bool {
        match (self.rhs_used_variables.first(), self.rhs_used_variables.last()) {
            (Some(&first), Some(&last)) if index >= first && index <= last => {
                self.rhs_used_variables.binary_search(&index).is_ok()
            }
            _ => false,
        }
    }

    /// Dense 0/1 dependency row over a state of dimension `n`.
    pub fn rhs_dependency_vector(&self, n: usize) -> Vec<bool> {
        let mut row = vec![false; n];
        for &index in self.rhs_used_variables.iter().filter(|&&i| i < n) {
            row[index] = true;
        }
        row
    }

    /// Half-bandwidths of this species' Jacobian row.
    pub fn get_rhs_used_band_range(&self) -> BandWidth {
        let Some(own) = self.ode_index else {
            return BandWidth::default();
        };
        self.rhs_used_variables
            .iter()
            .fold(BandWidth::default(), |width, &used| {
                if used >= own {
                    BandWidth::new(width.upper.max(used - own), width.lower)
                } else {
                    BandWidth::new(width.upper, width.lower.max(own - used))
                }
            })
    }

    /// Remaps the cached dependency indices after index compaction.
    pub fn change_indices_of_rhs_used_variables(
        &mut self,
        index_map: &HashMap<usize, usize>,
    ) -> Result<()> {
        const ERROR_SOURCE: &str = "Species::change_indices_of_rhs_used_variables";

        let mut remapped = BTreeSet::new();
        for old in &self.rhs_used_variables {
            let new = index_map.get(old).ok_or_else(|| {
                ModelError::configuration(
                    ERROR_SOURCE,
                    format!("species id={}: no new index for old index {}", self.core.id(), old),
                )
            })?;
            remapped.insert(*new);
        }
        if remapped.len() != self.rhs_used_variables.len() {
            return Err(ModelError::configuration(
                ERROR_SOURCE,
                format!(
                    "species id={}: Number of new indices does not match number of old indices ({} != {})",
                    self.core.id(),
                    remapped.len(),
                    self.rhs_used_variables.len()
                ),
            ));
        }
        self.rhs_used_variables = remapped.into_iter().collect();
        Ok(())
    }

    /// Turns the species into a literal holding `initial_value` and takes it
    /// out of the state vector.
    pub fn fill_with_initial_value(&mut self, initial_value: f64) {
        self.core.set_constant_value(initial_value);
        self.core.set_the_only_value(initial_value);
        self.ode_index = None;
        self.rhs_used_variables.clear();
    }

    /// Records this species' state entry as an output value. State entries are
    /// stored as-is; the scale factor never applies to them.
    pub fn store_value(&mut self, y: &[f64]) {
        if let Some(index) = self.ode_index {
            self.core.store_value(y[index]);
        }
    }

    pub fn values(&self) -> &[f64] {
        self.core.values()
    }

    /// Zeroes stored outputs whose magnitude is below `abs_tol`, regardless of
    /// `negative_values_allowed`.
    pub fn set_values_below_abs_tol_to_zero(&mut self, abs_tol: f64) {
        self.core.set_values_below_abs_tol_to_zero(abs_tol);
    }

    /// `dy(i) = (term + ...) / scale;`
    pub fn write_matlab_code(&self, out: &mut dyn Write) -> io::Result<()> {
        let Some(index) = self.ode_index else {
            return Ok(());
        };
        write!(out, "dy({}) = ", index + 1)?;
        if self.rhs.is_empty() {
            return writeln!(out, "0;");
        }
        let scaled = self.scale_factor != 1.0;
        if scaled {
            write!(out, "(")?;
        }
        for (i, term) in self.rhs.iter().enumerate() {
            if i > 0 {
                write!(out, " + ")?;
            }
            term.write_matlab_code(out)?;
        }
        if scaled {
            write!(out, ") / {}", self.scale_factor)?;
        }
        writeln!(out, ";")
    }
}
