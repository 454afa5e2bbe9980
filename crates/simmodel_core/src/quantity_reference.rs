//! Typed, deferred-resolution handle from a formula leaf to a quantity.
//!
//! A reference is created unresolved during load (id, alias and a kind hint
//! taken from the element name) and bound to a [`QuantityHandle`] during
//! finalize, once every quantity of the document exists. "Time" is a
//! pseudo-quantity that is never bound and always yields the solver time.

use std::collections::BTreeSet;

use log::debug;

use crate::error::{ModelError, Result};
use crate::formula::ScaleFactorUsageMode;
use crate::quantity::{
    Quantity, QuantityHandle, QuantityId, QuantityStore, Species, INVALID_QUANTITY_ID,
    TIME_QUANTITY_ID,
};
use crate::traits::JacobianMatrix;
use crate::xml::{names, XmlNode};

/// What a reference points at. `Pending` only exists between load and finalize
/// for references taken from a generic `<Reference>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Pending,
    Time,
    Parameter,
    Observer,
    Species,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantityReference {
    quantity_id: QuantityId,
    alias: String,
    kind: ReferenceKind,
    quantity: Option<QuantityHandle>,
    parent_formula_info: String,
}

impl QuantityReference {
    fn unresolved(quantity_id: QuantityId, kind: ReferenceKind) -> Self {
        Self {
            quantity_id,
            alias: String::new(),
            kind,
            quantity: None,
            parent_formula_info: String::new(),
        }
    }

    pub fn time() -> Self {
        Self::unresolved(TIME_QUANTITY_ID, ReferenceKind::Time)
    }

    pub fn parameter(quantity_id: QuantityId) -> Self {
        Self::unresolved(quantity_id, ReferenceKind::Parameter)
    }

    pub fn species(quantity_id: QuantityId) -> Self {
        Self::unresolved(quantity_id, ReferenceKind::Species)
    }

    pub fn observer(quantity_id: QuantityId) -> Self {
        Self::unresolved(quantity_id, ReferenceKind::Observer)
    }

    /// Reference whose kind is inferred from the registry at finalize time.
    pub fn pending(quantity_id: QuantityId) -> Self {
        Self::unresolved(quantity_id, ReferenceKind::Pending)
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Already-resolved reference to a known parameter.
    pub fn setup_from_parameter(handle: QuantityHandle, id: QuantityId, alias: &str) -> Self {
        Self {
            quantity_id: id,
            alias: alias.to_string(),
            kind: ReferenceKind::Parameter,
            quantity: Some(handle),
            parent_formula_info: String::new(),
        }
    }

    pub fn load_from_xml_node(node: &XmlNode) -> Result<Self> {
        let quantity_id = node.attribute_or(names::ID, INVALID_QUANTITY_ID)?;
        let is_time = quantity_id == TIME_QUANTITY_ID;

        let kind = match node.name() {
            names::PARAMETER if is_time => ReferenceKind::Time,
            names::PARAMETER => ReferenceKind::Parameter,
            names::OBSERVER => ReferenceKind::Observer,
            names::VARIABLE => ReferenceKind::Species,
            names::REFERENCE if is_time => ReferenceKind::Time,
            names::REFERENCE => ReferenceKind::Pending,
            other => {
                return Err(ModelError::parse(
                    "QuantityReference::load_from_xml_node",
                    format!("Unknown object reference <{other}>"),
                ))
            }
        };

        let mut reference = Self::unresolved(quantity_id, kind);
        if let Some(alias) = node.attribute(names::ALIAS) {
            reference.alias = alias.to_string();
        }
        Ok(reference)
    }

    /// Binds the reference against the quantity registry, inferring the kind
    /// for pending references and verifying it for declared ones.
    pub fn xml_finalize_instance(&mut self, store: &QuantityStore) -> Result<()> {
        const ERROR_SOURCE: &str = "QuantityReference::xml_finalize_instance";

        if self.is_time() {
            return Ok(());
        }

        let handle = store.lookup(self.quantity_id).ok_or_else(|| {
            ModelError::resolution(
                ERROR_SOURCE,
                format!("{}: object with id={} not found", self.info(), self.quantity_id),
            )
        })?;
        let quantity = store.get(handle);

        if self.kind == ReferenceKind::Pending {
            self.kind = match quantity {
                Quantity::Species(_) => ReferenceKind::Species,
                Quantity::Parameter(_) => ReferenceKind::Parameter,
                Quantity::Observer(_) => ReferenceKind::Observer,
            };
            debug!(
                "{}: reference to id={} resolved as {:?}",
                self.info(),
                self.quantity_id,
                self.kind
            );
        } else {
            let expected = match self.kind {
                ReferenceKind::Species if !matches!(quantity, Quantity::Species(_)) => {
                    Some("species")
                }
                ReferenceKind::Parameter if !matches!(quantity, Quantity::Parameter(_)) => {
                    Some("parameter")
                }
                ReferenceKind::Observer if !matches!(quantity, Quantity::Observer(_)) => {
                    Some("observer")
                }
                _ => None,
            };
            if let Some(expected) = expected {
                return Err(ModelError::resolution(
                    ERROR_SOURCE,
                    format!(
                        "{}: object with id={} should be a {}",
                        self.info(),
                        self.quantity_id,
                        expected
                    ),
                ));
            }
        }

        self.quantity = Some(handle);
        Ok(())
    }

    fn info(&self) -> &str {
        if self.parent_formula_info.is_empty() {
            "formula"
        } else {
            &self.parent_formula_info
        }
    }

    pub fn set_parent_formula_info(&mut self, info: &str) {
        self.parent_formula_info = info.to_string();
    }

    pub fn quantity_id(&self) -> QuantityId {
        self.quantity_id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn handle(&self) -> Option<QuantityHandle> {
        self.quantity
    }

    pub fn is_time(&self) -> bool {
        self.kind == ReferenceKind::Time
    }

    pub fn is_parameter(&self) -> bool {
        self.kind == ReferenceKind::Parameter
    }

    pub fn is_observer(&self) -> bool {
        self.kind == ReferenceKind::Observer
    }

    pub fn is_species(&self) -> bool {
        self.kind == ReferenceKind::Species
    }

    /// Time needs no binding; every other kind needs a handle.
    pub fn is_resolved(&self) -> bool {
        self.is_time() || (self.kind != ReferenceKind::Pending && self.quantity.is_some())
    }

    fn quantity<'a>(&self, store: &'a QuantityStore) -> Option<&'a Quantity> {
        debug_assert!(self.is_resolved(), "reference to id={} used before finalize", self.quantity_id);
        self.quantity.map(|h| store.get(h))
    }

    pub fn get_species<'a>(&self, store: &'a QuantityStore) -> Option<&'a Species> {
        self.quantity(store).and_then(Quantity::as_species)
    }

    pub fn get_value(
        &self,
        store: &QuantityStore,
        y: &[f64],
        time: f64,
        mode: ScaleFactorUsageMode,
    ) -> f64 {
        if self.is_time() {
            return time;
        }
        match self.quantity(store) {
            Some(quantity) => quantity.value(store, y, time, mode),
            None => f64::NAN,
        }
    }

    pub fn de_jacobian(
        &self,
        store: &QuantityStore,
        jacobian: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
        equation: usize,
        pre_factor: f64,
    ) {
        if pre_factor == 0.0 || self.is_time() {
            return;
        }
        if let Some(quantity) = self.quantity(store) {
            quantity.de_jacobian(store, jacobian, y, time, equation, pre_factor);
        }
    }

    /// ODE index of the referenced species; `None` for every other kind.
    pub fn ode_index(&self, store: &QuantityStore) -> Option<usize> {
        debug_assert!(self.is_species());
        self.get_species(store).and_then(Species::ode_index)
    }

    pub fn ode_scale_factor(&self, store: &QuantityStore) -> Option<f64> {
        debug_assert!(self.is_species());
        self.get_species(store).map(Species::ode_scale_factor)
    }

    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        if self.is_time() {
            return false;
        }
        self.quantity(store)
            .map_or(false, |q| q.is_constant(store, for_current_run_only))
    }

    pub fn is_changed_by_switch(&self, store: &QuantityStore) -> bool {
        if self.is_time() {
            return false;
        }
        self.quantity(store).map_or(false, Quantity::is_changed_by_switch)
    }

    /// Parameter and observer references carry dependencies further through
    /// their formulas, matching what `de_jacobian` differentiates.
    pub fn append_used_variables(
        &self,
        store: &QuantityStore,
        used: &mut BTreeSet<usize>,
        switch_assigned: &BTreeSet<usize>,
    ) {
        if !(self.is_parameter() || self.is_observer()) {
            return;
        }
        if let Some(quantity) = self.quantity(store) {
            quantity.append_used_variables(store, used, switch_assigned);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::{Observer, Parameter};

    fn store() -> QuantityStore {
        let mut store = QuantityStore::new();
        store
            .insert(Quantity::Parameter(Parameter::with_value(1, "k", 2.0)))
            .unwrap();
        store
            .insert(Quantity::Species(Species::with_value(2, "x", 3.0)))
            .unwrap();
        store
            .insert(Quantity::Observer(Observer::with_formula(
                3,
                "obs",
                crate::formula::Formula::constant(1.0),
            )))
            .unwrap();
        store
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn kind_is_taken_from_element_name() {
        let node = XmlNode::new("Variable").with_attribute("Id", 2).with_attribute("Alias", "x");
        let reference = QuantityReference::load_from_xml_node(&node).unwrap();
        assert!(reference.is_species());
        assert_eq!(reference.alias(), "x");
        assert!(!reference.is_resolved());

        let node = XmlNode::new("Reference").with_attribute("Id", TIME_QUANTITY_ID);
        assert!(QuantityReference::load_from_xml_node(&node).unwrap().is_time());

        let node = XmlNode::new("Parameter").with_attribute("Id", TIME_QUANTITY_ID);
        assert!(QuantityReference::load_from_xml_node(&node).unwrap().is_time());
    }

    #[test]
    fn unknown_element_is_a_parse_error() {
        let node = XmlNode::new("Container").with_attribute("Id", 1);
        let err = QuantityReference::load_from_xml_node(&node).unwrap_err();
        assert!(matches!(err, ModelError::Parse { .. }));
    }

    #[test]
    fn pending_reference_infers_kind() {
        let store = store();
        for (id, expected) in [
            (1, ReferenceKind::Parameter),
            (2, ReferenceKind::Species),
            (3, ReferenceKind::Observer),
        ] {
            let mut reference = QuantityReference::pending(id);
            reference.xml_finalize_instance(&store).unwrap();
            assert_eq!(reference.kind(), expected);
            assert!(reference.is_resolved());
        }
    }

    #[test]
    fn unknown_id_fails_resolution() {
        let store = store();
        let mut reference = QuantityReference::parameter(42);
        reference.set_parent_formula_info("Formula id=7");
        let result = reference.xml_finalize_instance(&store);
        assert!(matches!(result, Err(ModelError::Resolution { .. })));
        assert_err_contains(result, "Formula id=7: object with id=42 not found");
    }

    #[test]
    fn declared_kind_must_match_registry_object() {
        let store = store();
        let mut reference = QuantityReference::species(1);
        assert_err_contains(reference.xml_finalize_instance(&store), "should be a species");

        let mut reference = QuantityReference::parameter(2);
        assert_err_contains(reference.xml_finalize_instance(&store), "should be a parameter");

        let mut reference = QuantityReference::observer(1);
        assert_err_contains(reference.xml_finalize_instance(&store), "should be a observer");
    }

    #[test]
    fn time_yields_solver_time_and_is_never_constant() {
        let store = store();
        let mut reference = QuantityReference::time();
        reference.xml_finalize_instance(&store).unwrap();
        assert_eq!(
            reference.get_value(&store, &[], 12.5, ScaleFactorUsageMode::UseScaleFactor),
            12.5
        );
        assert!(!reference.is_constant(&store, true));
        assert!(!reference.is_changed_by_switch(&store));
    }

    #[test]
    fn resolved_reference_delegates_value_and_constancy() {
        let store = store();
        let mut reference = QuantityReference::parameter(1);
        reference.xml_finalize_instance(&store).unwrap();
        assert_eq!(
            reference.get_value(&store, &[], 0.0, ScaleFactorUsageMode::UseScaleFactor),
            2.0
        );
        assert!(reference.is_constant(&store, true));

        let mut species = QuantityReference::species(2);
        species.xml_finalize_instance(&store).unwrap();
        assert_eq!(species.ode_scale_factor(&store), Some(1.0));
        assert_eq!(species.ode_index(&store), None);
    }

    #[test]
    fn observer_forwards_dependencies_of_its_formula() {
        let mut store = QuantityStore::new();
        let mut species = Species::with_value(2, "x", 3.0);
        species.add_rhs_formula(crate::formula::Formula::constant(1.0));
        species.set_ode_index(Some(4));
        store.insert(Quantity::Species(species)).unwrap();

        let mut formula = crate::formula::Formula::reference(QuantityReference::species(2));
        formula.xml_finalize_instance(&store).unwrap();
        formula.update_indices_of_referenced_variables(&store);
        store
            .insert(Quantity::Observer(Observer::with_formula(3, "obs", formula)))
            .unwrap();

        let mut observer = QuantityReference::observer(3);
        observer.xml_finalize_instance(&store).unwrap();
        let mut used = BTreeSet::new();
        observer.append_used_variables(&store, &mut used, &BTreeSet::new());
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn species_references_forward_nothing() {
        let store = store();
        let mut used = BTreeSet::new();
        let switch: BTreeSet<usize> = [4, 5].into_iter().collect();

        let mut species = QuantityReference::species(2);
        species.xml_finalize_instance(&store).unwrap();
        species.append_used_variables(&store, &mut used, &switch);
        assert!(used.is_empty());

        let mut parameter = QuantityReference::parameter(1);
        parameter.xml_finalize_instance(&store).unwrap();
        parameter.append_used_variables(&store, &mut used, &switch);
        assert!(used.is_empty());
    }
}
