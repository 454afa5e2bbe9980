//! Formula expression trees.
//!
//! A [`Formula`] is a strict tree: every composite node owns its children.
//! Trees are loaded from the model document in two phases. `load_from_xml_node`
//! builds the structure with unresolved quantity references, and
//! `xml_finalize_instance` binds those references once every quantity exists.
//! After that the tree supports value evaluation, analytic Jacobian
//! accumulation by the chain rule, dependency analysis and constant folding.

mod unary;

pub use unary::{UnaryFunction, UnaryFunctionFormula};

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};

use log::debug;

use crate::error::{ModelError, Result};
use crate::quantity::{QuantityId, QuantityStore};
use crate::quantity_reference::QuantityReference;
use crate::traits::JacobianMatrix;
use crate::xml::{names, XmlNode};

pub type FormulaId = i64;

/// How species leaves are read during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleFactorUsageMode {
    /// Regular RHS evaluation: species read the solver state.
    UseScaleFactor,
    /// Initial value computation: species yield their own initial value.
    IgnoreScaleFactor,
}

mod tags {
    pub const CONSTANT: &str = "CONSTANT";
    pub const SUM: &str = "SUM";
    pub const PRODUCT: &str = "PRODUCT";
    pub const DIFF: &str = "DIFF";
    pub const DIV: &str = "DIV";
    pub const POWER: &str = "POWER";
    pub const MINUS: &str = "MINUS";
    pub const MAX: &str = "MAX";
    pub const MIN: &str = "MIN";
}

/// Leaf holding a quantity reference and, for species, the cached state index.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceFormula {
    reference: QuantityReference,
    ode_index: Option<usize>,
}

impl ReferenceFormula {
    pub fn new(reference: QuantityReference) -> Self {
        Self {
            reference,
            ode_index: None,
        }
    }

    pub fn reference(&self) -> &QuantityReference {
        &self.reference
    }

    pub fn ode_index(&self) -> Option<usize> {
        self.ode_index
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Formula {
    Constant(f64),
    Reference(ReferenceFormula),
    Unary(UnaryFunctionFormula),
    /// Negation.
    Minus(Box<Formula>),
    Sum(Vec<Formula>),
    Product(Vec<Formula>),
    Diff(Box<Formula>, Box<Formula>),
    Div(Box<Formula>, Box<Formula>),
    Power(Box<Formula>, Box<Formula>),
    Max(Box<Formula>, Box<Formula>),
    Min(Box<Formula>, Box<Formula>),
}

impl Formula {
    pub fn constant(value: f64) -> Self {
        Formula::Constant(value)
    }

    pub fn reference(reference: QuantityReference) -> Self {
        Formula::Reference(ReferenceFormula::new(reference))
    }

    pub fn unary(function: UnaryFunction, argument: Formula) -> Self {
        Formula::Unary(UnaryFunctionFormula::new(function, argument))
    }

    pub fn minus(argument: Formula) -> Self {
        Formula::Minus(Box::new(argument))
    }

    pub fn sum(terms: Vec<Formula>) -> Self {
        Formula::Sum(terms)
    }

    pub fn product(factors: Vec<Formula>) -> Self {
        Formula::Product(factors)
    }

    pub fn diff(a: Formula, b: Formula) -> Self {
        Formula::Diff(Box::new(a), Box::new(b))
    }

    pub fn div(a: Formula, b: Formula) -> Self {
        Formula::Div(Box::new(a), Box::new(b))
    }

    pub fn power(base: Formula, exponent: Formula) -> Self {
        Formula::Power(Box::new(base), Box::new(exponent))
    }

    pub fn max(a: Formula, b: Formula) -> Self {
        Formula::Max(Box::new(a), Box::new(b))
    }

    pub fn min(a: Formula, b: Formula) -> Self {
        Formula::Min(Box::new(a), Box::new(b))
    }

    /// Builds the variant named by the element tag and loads its children.
    pub fn load_from_xml_node(node: &XmlNode) -> Result<Formula> {
        const ERROR_SOURCE: &str = "Formula::load_from_xml_node";

        let arguments = |expected: usize| -> Result<Vec<Formula>> {
            if node.children().len() != expected {
                return Err(ModelError::parse(
                    ERROR_SOURCE,
                    format!(
                        "<{}> expects {} argument(s), found {}",
                        node.name(),
                        expected,
                        node.children().len()
                    ),
                ));
            }
            load_all(node.children())
        };
        let binary = |make: fn(Formula, Formula) -> Formula| -> Result<Formula> {
            let mut args = arguments(2)?.into_iter();
            match (args.next(), args.next()) {
                (Some(a), Some(b)) => Ok(make(a, b)),
                _ => Err(ModelError::parse(ERROR_SOURCE, "missing argument")),
            }
        };

        let formula = match node.name() {
            tags::CONSTANT => {
                if node.attribute(names::VALUE).is_none() {
                    return Err(ModelError::parse(
                        ERROR_SOURCE,
                        format!("<{}> without Value", tags::CONSTANT),
                    ));
                }
                Formula::Constant(node.attribute_or(names::VALUE, 0.0)?)
            }
            names::PARAMETER | names::OBSERVER | names::VARIABLE | names::REFERENCE => {
                Formula::reference(QuantityReference::load_from_xml_node(node)?)
            }
            tags::SUM => Formula::Sum(load_all(node.children())?),
            tags::PRODUCT => Formula::Product(load_all(node.children())?),
            tags::MINUS => {
                let argument = arguments(1)?.into_iter().next();
                Formula::minus(argument.ok_or_else(|| ModelError::parse(ERROR_SOURCE, "missing argument"))?)
            }
            tags::DIFF => binary(Formula::diff)?,
            tags::DIV => binary(Formula::div)?,
            tags::POWER => binary(Formula::power)?,
            tags::MAX => binary(Formula::max)?,
            tags::MIN => binary(Formula::min)?,
            tag => match UnaryFunction::from_tag(tag) {
                Some(function) => {
                    let argument = arguments(1)?.into_iter().next();
                    Formula::unary(
                        function,
                        argument.ok_or_else(|| ModelError::parse(ERROR_SOURCE, "missing argument"))?,
                    )
                }
                None => {
                    return Err(ModelError::parse(
                        ERROR_SOURCE,
                        format!("Unknown formula element <{tag}>"),
                    ))
                }
            },
        };
        Ok(formula)
    }

    fn children(&self) -> Vec<&Formula> {
        match self {
            Formula::Constant(_) | Formula::Reference(_) => Vec::new(),
            Formula::Unary(u) => vec![u.argument()],
            Formula::Minus(a) => vec![a.as_ref()],
            Formula::Sum(terms) | Formula::Product(terms) => terms.iter().collect(),
            Formula::Diff(a, b)
            | Formula::Div(a, b)
            | Formula::Power(a, b)
            | Formula::Max(a, b)
            | Formula::Min(a, b) => vec![a.as_ref(), b.as_ref()],
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Formula> {
        match self {
            Formula::Constant(_) | Formula::Reference(_) => Vec::new(),
            Formula::Unary(u) => vec![u.argument_mut()],
            Formula::Minus(a) => vec![a.as_mut()],
            Formula::Sum(terms) | Formula::Product(terms) => terms.iter_mut().collect(),
            Formula::Diff(a, b)
            | Formula::Div(a, b)
            | Formula::Power(a, b)
            | Formula::Max(a, b)
            | Formula::Min(a, b) => vec![a.as_mut(), b.as_mut()],
        }
    }

    /// Binds every quantity reference against the registry.
    pub fn xml_finalize_instance(&mut self, store: &QuantityStore) -> Result<()> {
        if let Formula::Reference(leaf) = self {
            return leaf.reference.xml_finalize_instance(store);
        }
        for child in self.children_mut() {
            child.xml_finalize_instance(store)?;
        }
        Ok(())
    }

    /// Replaces the reference of every leaf carrying the same alias.
    pub fn set_quantity_reference(&mut self, reference: &QuantityReference) {
        if let Formula::Reference(leaf) = self {
            if leaf.reference.alias() == reference.alias() {
                leaf.reference = reference.clone();
                leaf.ode_index = None;
            }
            return;
        }
        for child in self.children_mut() {
            child.set_quantity_reference(reference);
        }
    }

    pub fn set_parent_formula_info(&mut self, info: &str) {
        if let Formula::Reference(leaf) = self {
            leaf.reference.set_parent_formula_info(info);
            return;
        }
        for child in self.children_mut() {
            child.set_parent_formula_info(info);
        }
    }

    /// Consistency pass after resolution: every reference must be bound.
    pub fn finalize(&self) -> Result<()> {
        if let Formula::Reference(leaf) = self {
            if !leaf.reference.is_resolved() {
                return Err(ModelError::resolution(
                    "Formula::finalize",
                    format!(
                        "unresolved reference to quantity id={}",
                        leaf.reference.quantity_id()
                    ),
                ));
            }
            return Ok(());
        }
        self.children().into_iter().try_for_each(Formula::finalize)
    }

    pub fn de_compute(
        &self,
        store: &QuantityStore,
        y: &[f64],
        time: f64,
        mode: ScaleFactorUsageMode,
    ) -> f64 {
        let eval = |f: &Formula| f.de_compute(store, y, time, mode);
        match self {
            Formula::Constant(value) => *value,
            Formula::Reference(leaf) => match (mode, leaf.ode_index) {
                (ScaleFactorUsageMode::UseScaleFactor, Some(index)) => y[index],
                _ => leaf.reference.get_value(store, y, time, mode),
            },
            Formula::Unary(u) => u.function().eval(eval(u.argument())),
            Formula::Minus(a) => -eval(a),
            Formula::Sum(terms) => terms.iter().map(eval).sum(),
            Formula::Product(factors) => factors.iter().map(eval).product(),
            Formula::Diff(a, b) => eval(a) - eval(b),
            Formula::Div(a, b) => eval(a) / eval(b),
            Formula::Power(a, b) => eval(a).powf(eval(b)),
            Formula::Max(a, b) => {
                let (va, vb) = (eval(a), eval(b));
                if va >= vb {
                    va
                } else {
                    vb
                }
            }
            Formula::Min(a, b) => {
                let (va, vb) = (eval(a), eval(b));
                if va <= vb {
                    va
                } else {
                    vb
                }
            }
        }
    }

    /// Adds `pre_factor * d(self)/d(y)` to row `equation` of the Jacobian.
    pub fn de_jacobian(
        &self,
        store: &QuantityStore,
        jacobian: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
        equation: usize,
        pre_factor: f64,
    ) {
        if pre_factor == 0.0 {
            return;
        }
        let value = |f: &Formula| f.de_compute(store, y, time, ScaleFactorUsageMode::UseScaleFactor);

        match self {
            Formula::Constant(_) => {}
            Formula::Reference(leaf) => {
                if leaf.reference.is_species() {
                    if let Some(index) = leaf.ode_index {
                        jacobian.add(equation, index, pre_factor);
                    }
                } else {
                    leaf.reference
                        .de_jacobian(store, jacobian, y, time, equation, pre_factor);
                }
            }
            Formula::Unary(u) => {
                let multiplier = u.function().jacobian_multiplier(value(u.argument()));
                if multiplier != 0.0 {
                    u.argument()
                        .de_jacobian(store, jacobian, y, time, equation, pre_factor * multiplier);
                }
            }
            Formula::Minus(a) => a.de_jacobian(store, jacobian, y, time, equation, -pre_factor),
            Formula::Sum(terms) => {
                for term in terms {
                    term.de_jacobian(store, jacobian, y, time, equation, pre_factor);
                }
            }
            Formula::Diff(a, b) => {
                a.de_jacobian(store, jacobian, y, time, equation, pre_factor);
                b.de_jacobian(store, jacobian, y, time, equation, -pre_factor);
            }
            Formula::Product(factors) => {
                let values: Vec<f64> = factors.iter().map(value).collect();
                for (i, factor) in factors.iter().enumerate() {
                    let others: f64 = values
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, v)| *v)
                        .product();
                    factor.de_jacobian(store, jacobian, y, time, equation, pre_factor * others);
                }
            }
            Formula::Div(a, b) => {
                let (va, vb) = (value(a), value(b));
                a.de_jacobian(store, jacobian, y, time, equation, pre_factor / vb);
                b.de_jacobian(store, jacobian, y, time, equation, -pre_factor * va / (vb * vb));
            }
            Formula::Power(base, exponent) => {
                let (vb, ve) = (value(base), value(exponent));
                base.de_jacobian(
                    store,
                    jacobian,
                    y,
                    time,
                    equation,
                    pre_factor * ve * vb.powf(ve - 1.0),
                );
                if !matches!(exponent.as_ref(), Formula::Constant(_)) {
                    exponent.de_jacobian(
                        store,
                        jacobian,
                        y,
                        time,
                        equation,
                        pre_factor * vb.powf(ve) * vb.ln(),
                    );
                }
            }
            // Ties propagate the first argument.
            Formula::Max(a, b) => {
                let active = if value(a) >= value(b) { a } else { b };
                active.de_jacobian(store, jacobian, y, time, equation, pre_factor);
            }
            Formula::Min(a, b) => {
                let active = if value(a) <= value(b) { a } else { b };
                active.de_jacobian(store, jacobian, y, time, equation, pre_factor);
            }
        }
    }

    /// Conservative zero test: true only when provable without evaluation.
    pub fn is_zero(&self) -> bool {
        match self {
            Formula::Constant(value) => *value == 0.0,
            Formula::Reference(_) | Formula::Unary(_) | Formula::Max(..) | Formula::Min(..) => false,
            Formula::Minus(a) => a.is_zero(),
            Formula::Sum(terms) => terms.iter().all(Formula::is_zero),
            Formula::Product(factors) => factors.iter().any(Formula::is_zero),
            Formula::Diff(a, b) => a.is_zero() && b.is_zero(),
            Formula::Div(a, b) => {
                a.is_zero() && matches!(b.as_ref(), Formula::Constant(d) if *d != 0.0 && !d.is_nan())
            }
            Formula::Power(base, exponent) => {
                base.is_zero() && matches!(exponent.as_ref(), Formula::Constant(e) if *e > 0.0)
            }
        }
    }

    pub fn is_constant(&self, store: &QuantityStore, for_current_run_only: bool) -> bool {
        match self {
            Formula::Constant(_) => true,
            Formula::Reference(leaf) => leaf.reference.is_constant(store, for_current_run_only),
            _ => self
                .children()
                .into_iter()
                .all(|c| c.is_constant(store, for_current_run_only)),
        }
    }

    /// Folds constant subtrees into literals evaluated at `start_time` and
    /// drops zero summands. Returns whether the tree changed.
    pub fn simplify(&mut self, store: &QuantityStore, start_time: f64, for_current_run_only: bool) -> bool {
        if matches!(self, Formula::Constant(_)) {
            return false;
        }
        if self.is_constant(store, for_current_run_only) {
            let value = self.de_compute(store, &[], start_time, ScaleFactorUsageMode::IgnoreScaleFactor);
            *self = Formula::Constant(value);
            return true;
        }

        let mut changed = false;
        for child in self.children_mut() {
            changed |= child.simplify(store, start_time, for_current_run_only);
        }

        if let Formula::Sum(terms) = self {
            let before = terms.len();
            terms.retain(|t| !t.is_zero());
            changed |= terms.len() != before;
            if terms.is_empty() {
                *self = Formula::Constant(0.0);
            }
        } else if self.is_zero() {
            *self = Formula::Constant(0.0);
            changed = true;
        }
        changed
    }

    /// Collects the state indices this subtree depends on.
    pub fn append_used_variables(
        &self,
        store: &QuantityStore,
        used: &mut BTreeSet<usize>,
        switch_assigned: &BTreeSet<usize>,
    ) {
        if let Formula::Reference(leaf) = self {
            match leaf.ode_index {
                Some(index) => {
                    used.insert(index);
                }
                None => leaf.reference.append_used_variables(store, used, switch_assigned),
            }
            return;
        }
        for child in self.children() {
            child.append_used_variables(store, used, switch_assigned);
        }
    }

    /// Refreshes the state index cached in species leaves. Species that are
    /// not integrated (no RHS, never switched) cache no index.
    pub fn update_indices_of_referenced_variables(&mut self, store: &QuantityStore) {
        if let Formula::Reference(leaf) = self {
            if leaf.reference.is_species() {
                leaf.ode_index = leaf
                    .reference
                    .get_species(store)
                    .filter(|s| !s.is_constant_during_calculation())
                    .and_then(|s| s.ode_index());
            }
            return;
        }
        for child in self.children_mut() {
            child.update_indices_of_referenced_variables(store);
        }
    }

    /// Renders the subtree in Matlab syntax. Integrated species are `y(i)`,
    /// other quantities `Q<id>`.
    pub fn write_matlab_code(&self, out: &mut dyn Write) -> io::Result<()> {
        match self {
            Formula::Constant(value) => write!(out, "{value}"),
            Formula::Reference(leaf) => {
                let reference = &leaf.reference;
                if reference.is_time() {
                    write!(out, "Time")
                } else if let Some(index) = leaf.ode_index {
                    write!(out, "y({})", index + 1)
                } else {
                    write!(out, "Q{}", reference.quantity_id())
                }
            }
            Formula::Unary(u) => {
                write!(out, "{}(", u.function().matlab_name())?;
                u.argument().write_matlab_code(out)?;
                write!(out, ")")
            }
            Formula::Minus(a) => {
                write!(out, "(-")?;
                a.write_matlab_code(out)?;
                write!(out, ")")
            }
            Formula::Sum(terms) => write_infix(out, "+", &terms.iter().collect::<Vec<_>>(), "0"),
            Formula::Product(factors) => write_infix(out, "*", &factors.iter().collect::<Vec<_>>(), "1"),
            Formula::Diff(a, b) => write_infix(out, "-", &[a.as_ref(), b.as_ref()], ""),
            Formula::Div(a, b) => write_infix(out, "/", &[a.as_ref(), b.as_ref()], ""),
            Formula::Power(a, b) => write_infix(out, "^", &[a.as_ref(), b.as_ref()], ""),
            Formula::Max(a, b) | Formula::Min(a, b) => {
                let name = if matches!(self, Formula::Max(..)) { "max" } else { "min" };
                write!(out, "{name}(")?;
                a.write_matlab_code(out)?;
                write!(out, ", ")?;
                b.write_matlab_code(out)?;
                write!(out, ")")
            }
        }
    }

    /// Ids of the quantities rendered as `Q<id>`: everything except Time and
    /// integrated species.
    pub fn referenced_quantity_ids(&self, ids: &mut BTreeSet<QuantityId>) {
        if let Formula::Reference(leaf) = self {
            if !leaf.reference.is_time() && leaf.ode_index.is_none() {
                ids.insert(leaf.reference.quantity_id());
            }
            return;
        }
        for child in self.children() {
            child.referenced_quantity_ids(ids);
        }
    }

    pub fn matlab_code(&self) -> String {
        let mut out = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_matlab_code(&mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

fn load_all(nodes: &[XmlNode]) -> Result<Vec<Formula>> {
    nodes.iter().map(Formula::load_from_xml_node).collect()
}

fn write_infix(out: &mut dyn Write, operator: &str, operands: &[&Formula], empty: &str) -> io::Result<()> {
    if operands.is_empty() {
        return write!(out, "{empty}");
    }
    write!(out, "(")?;
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            write!(out, " {operator} ")?;
        }
        operand.write_matlab_code(out)?;
    }
    write!(out, ")")
}

/// Formulas of the document's `<FormulaList>`, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FormulaTable {
    formulas: BTreeMap<FormulaId, Formula>,
}

impl FormulaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `<Formula Id="..">` child; each wraps exactly one expression element.
    pub fn load_from_xml_node(list: &XmlNode) -> Result<Self> {
        const ERROR_SOURCE: &str = "FormulaTable::load_from_xml_node";

        let mut table = Self::new();
        for node in list.children().iter().filter(|c| c.has_name(names::FORMULA)) {
            let id = node.attribute_or(names::ID, FormulaId::MIN)?;
            if id == FormulaId::MIN {
                return Err(ModelError::parse(ERROR_SOURCE, "<Formula> without Id"));
            }
            let expression = match node.children() {
                [expression] => expression,
                children => {
                    return Err(ModelError::parse(
                        ERROR_SOURCE,
                        format!(
                            "Formula id={id} must contain exactly one expression, found {}",
                            children.len()
                        ),
                    ))
                }
            };
            let mut formula = Formula::load_from_xml_node(expression)?;
            formula.set_parent_formula_info(&format!("Formula id={id}"));
            table.insert(id, formula)?;
        }
        debug!("loaded {} formulas", table.len());
        Ok(table)
    }

    /// Resolves the references of all formulas, then runs the consistency pass.
    pub fn xml_finalize_instance(&mut self, store: &QuantityStore) -> Result<()> {
        for formula in self.formulas.values_mut() {
            formula.xml_finalize_instance(store)?;
            formula.finalize()?;
        }
        Ok(())
    }

    pub fn insert(&mut self, id: FormulaId, formula: Formula) -> Result<()> {
        if self.formulas.contains_key(&id) {
            return Err(ModelError::configuration(
                "FormulaTable::insert",
                format!("duplicate formula id={id}"),
            ));
        }
        self.formulas.insert(id, formula);
        Ok(())
    }

    pub fn get(&self, id: FormulaId) -> Option<&Formula> {
        self.formulas.get(&id)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FormulaId, &Formula)> {
        self.formulas.iter().map(|(id, f)| (*id, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::{Observer, Parameter, Quantity, QuantityHandle, Species};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    /// Store with parameter id 1 = 2.0 and integrated species with ids 10.. at indices 0..
    fn store_with_species(count: usize) -> (QuantityStore, QuantityHandle) {
        let mut store = QuantityStore::new();
        let k = store
            .insert(Quantity::Parameter(Parameter::with_value(1, "k", 2.0)))
            .unwrap();
        for i in 0..count {
            let mut species = Species::with_value(10 + i as i64, "s", 1.0);
            species.set_ode_index(Some(i));
            species.add_rhs_formula(Formula::constant(1.0));
            store.insert(Quantity::Species(species)).unwrap();
        }
        (store, k)
    }

    fn species_leaf(store: &QuantityStore, id: i64) -> Formula {
        let mut leaf = Formula::reference(QuantityReference::species(id));
        leaf.xml_finalize_instance(store).unwrap();
        leaf.update_indices_of_referenced_variables(store);
        leaf
    }

    fn jacobian_row(formula: &Formula, store: &QuantityStore, y: &[f64]) -> Vec<f64> {
        let mut jacobian = DMatrix::<f64>::zeros(y.len(), y.len());
        formula.de_jacobian(store, &mut jacobian, y, 0.0, 0, 1.0);
        jacobian.row(0).iter().copied().collect()
    }

    fn numeric_row(formula: &Formula, store: &QuantityStore, y: &[f64]) -> Vec<f64> {
        let h = 1e-6;
        (0..y.len())
            .map(|j| {
                let mut plus = y.to_vec();
                let mut minus = y.to_vec();
                plus[j] += h;
                minus[j] -= h;
                let mode = ScaleFactorUsageMode::UseScaleFactor;
                (formula.de_compute(store, &plus, 0.0, mode) - formula.de_compute(store, &minus, 0.0, mode))
                    / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn loads_nested_expression() {
        let xml = r#"<SUM>
                <CONSTANT Value="1.5"/>
                <PRODUCT><Parameter Id="1" Alias="k"/><Variable Id="10" Alias="x"/></PRODUCT>
                <LOG><CONSTANT Value="1"/></LOG>
            </SUM>"#;
        let node = XmlNode::parse(xml).unwrap();
        let mut formula = Formula::load_from_xml_node(&node).unwrap();
        let (store, _) = store_with_species(1);
        formula.xml_finalize_instance(&store).unwrap();
        formula.finalize().unwrap();
        formula.update_indices_of_referenced_variables(&store);

        let value = formula.de_compute(&store, &[3.0], 0.0, ScaleFactorUsageMode::UseScaleFactor);
        assert_relative_eq!(value, 1.5 + 2.0 * 3.0);
    }

    #[test]
    fn malformed_expressions_are_parse_errors() {
        let unknown = XmlNode::new("ABS").with_child(XmlNode::new("CONSTANT").with_attribute("Value", 1));
        assert_err_contains(Formula::load_from_xml_node(&unknown), "Unknown formula element <ABS>");

        let missing = XmlNode::new("DIV").with_child(XmlNode::new("CONSTANT").with_attribute("Value", 1));
        assert_err_contains(Formula::load_from_xml_node(&missing), "expects 2 argument(s), found 1");

        let no_value = XmlNode::new("CONSTANT");
        assert!(matches!(
            Formula::load_from_xml_node(&no_value),
            Err(ModelError::Parse { .. })
        ));
    }

    #[test]
    fn unresolved_reference_fails_finalize() {
        let formula = Formula::reference(QuantityReference::parameter(5));
        assert!(matches!(formula.finalize(), Err(ModelError::Resolution { .. })));
    }

    #[test]
    fn used_variables_are_deduplicated_and_sorted() {
        let (store, _) = store_with_species(10);
        let formula = Formula::sum(vec![
            species_leaf(&store, 19),
            species_leaf(&store, 12),
            Formula::product(vec![species_leaf(&store, 15), species_leaf(&store, 15)]),
        ]);
        let mut used = BTreeSet::new();
        formula.append_used_variables(&store, &mut used, &BTreeSet::new());
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![2, 5, 9]);
    }

    #[test]
    fn parameter_formula_dependencies_are_followed() {
        let (mut store, _) = store_with_species(3);
        let mut formula = Formula::reference(QuantityReference::species(12));
        formula.xml_finalize_instance(&store).unwrap();
        formula.update_indices_of_referenced_variables(&store);
        store
            .insert(Quantity::Parameter(Parameter::with_formula(2, "p", formula)))
            .unwrap();

        let mut leaf = Formula::reference(QuantityReference::parameter(2));
        leaf.xml_finalize_instance(&store).unwrap();
        let mut used = BTreeSet::new();
        leaf.append_used_variables(&store, &mut used, &BTreeSet::new());
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![2]);

        let mut jacobian = DMatrix::<f64>::zeros(3, 3);
        leaf.de_jacobian(&store, &mut jacobian, &[0.0; 3], 0.0, 1, 0.5);
        assert_eq!(jacobian[(1, 2)], 0.5);
    }

    #[test]
    fn composite_jacobians_match_central_differences() {
        let (store, _) = store_with_species(3);
        let x = || species_leaf(&store, 10);
        let y = || species_leaf(&store, 11);
        let z = || species_leaf(&store, 12);
        let k = || {
            let mut leaf = Formula::reference(QuantityReference::parameter(1));
            leaf.xml_finalize_instance(&store).unwrap();
            leaf
        };

        let formulas = vec![
            Formula::product(vec![k(), x(), y()]),
            Formula::div(x(), Formula::sum(vec![y(), z()])),
            Formula::power(x(), Formula::constant(2.5)),
            Formula::power(y(), x()),
            Formula::diff(Formula::unary(UnaryFunction::Exp, x()), Formula::minus(z())),
            Formula::unary(UnaryFunction::Sqrt, Formula::product(vec![x(), z()])),
            Formula::max(x(), y()),
            Formula::min(x(), y()),
        ];
        let state = [1.3, 0.7, 2.1];
        for formula in &formulas {
            let analytic = jacobian_row(formula, &store, &state);
            let numeric = numeric_row(formula, &store, &state);
            for (a, n) in analytic.iter().zip(&numeric) {
                assert_relative_eq!(*a, *n, epsilon = 1e-6, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn max_and_min_ties_propagate_first_argument() {
        let (store, _) = store_with_species(2);
        let tie = [1.0, 1.0];
        let max = Formula::max(species_leaf(&store, 10), species_leaf(&store, 11));
        assert_eq!(jacobian_row(&max, &store, &tie), vec![1.0, 0.0]);
        let min = Formula::min(species_leaf(&store, 10), species_leaf(&store, 11));
        assert_eq!(jacobian_row(&min, &store, &tie), vec![1.0, 0.0]);
        assert_eq!(jacobian_row(&max, &store, &[0.0, 1.0]), vec![0.0, 1.0]);
    }

    #[test]
    fn zero_pre_factor_contributes_nothing() {
        let (store, _) = store_with_species(1);
        let formula = Formula::unary(UnaryFunction::Exp, species_leaf(&store, 10));
        let mut jacobian = DMatrix::<f64>::zeros(1, 1);
        formula.de_jacobian(&store, &mut jacobian, &[1.0], 0.0, 0, 0.0);
        assert_eq!(jacobian[(0, 0)], 0.0);
    }

    #[test]
    fn time_is_read_from_solver() {
        let (store, _) = store_with_species(0);
        let mut formula = Formula::product(vec![Formula::constant(2.0), Formula::reference(QuantityReference::time())]);
        formula.xml_finalize_instance(&store).unwrap();
        assert!(!formula.is_constant(&store, true));
        assert_eq!(formula.de_compute(&store, &[], 4.0, ScaleFactorUsageMode::UseScaleFactor), 8.0);
    }

    #[test]
    fn is_zero_is_conservative() {
        assert!(Formula::constant(0.0).is_zero());
        assert!(Formula::product(vec![Formula::constant(3.0), Formula::constant(0.0)]).is_zero());
        assert!(Formula::sum(vec![]).is_zero());
        assert!(!Formula::unary(UnaryFunction::Sin, Formula::constant(0.0)).is_zero());
        assert!(!Formula::reference(QuantityReference::parameter(1)).is_zero());
    }

    #[test]
    fn zero_quotient_needs_a_nonzero_constant_denominator() {
        assert!(Formula::div(Formula::constant(0.0), Formula::constant(4.0)).is_zero());
        assert!(!Formula::div(Formula::constant(0.0), Formula::constant(0.0)).is_zero());
        assert!(!Formula::div(
            Formula::constant(0.0),
            Formula::reference(QuantityReference::parameter(1))
        )
        .is_zero());
    }

    #[test]
    fn simplify_folds_constant_subtrees() {
        let (store, _) = store_with_species(1);
        let mut k = Formula::reference(QuantityReference::parameter(1));
        k.xml_finalize_instance(&store).unwrap();

        let mut formula = Formula::sum(vec![
            Formula::product(vec![k, Formula::constant(3.0)]),
            Formula::product(vec![species_leaf(&store, 10), Formula::constant(0.0)]),
            species_leaf(&store, 10),
        ]);
        assert!(formula.simplify(&store, 0.0, true));
        match &formula {
            Formula::Sum(terms) => {
                assert_eq!(terms.len(), 2);
                assert_eq!(terms[0], Formula::Constant(6.0));
            }
            other => panic!("expected a sum, got {other:?}"),
        }
        assert!(!formula.simplify(&store, 0.0, true));

        let mut folded = Formula::unary(UnaryFunction::Cos, Formula::constant(0.0));
        assert!(folded.simplify(&store, 0.0, true));
        assert_eq!(folded, Formula::Constant(1.0));
    }

    #[test]
    fn variable_parameter_folds_only_for_current_run() {
        let mut store = QuantityStore::new();
        let mut parameter = Parameter::with_value(1, "k", 2.0);
        parameter.set_can_be_varied(true);
        store.insert(Quantity::Parameter(parameter)).unwrap();

        let mut leaf = Formula::reference(QuantityReference::parameter(1));
        leaf.xml_finalize_instance(&store).unwrap();
        let mut kept = leaf.clone();
        assert!(!kept.simplify(&store, 0.0, false));
        assert!(leaf.simplify(&store, 0.0, true));
    }

    #[test]
    fn observer_reference_evaluates_its_formula() {
        let mut store = QuantityStore::new();
        store
            .insert(Quantity::Observer(Observer::with_formula(3, "obs", Formula::constant(4.0))))
            .unwrap();
        let mut leaf = Formula::reference(QuantityReference::pending(3));
        leaf.xml_finalize_instance(&store).unwrap();
        assert_eq!(leaf.de_compute(&store, &[], 0.0, ScaleFactorUsageMode::UseScaleFactor), 4.0);
    }

    #[test]
    fn set_quantity_reference_rebinds_by_alias() {
        let (store, _) = store_with_species(2);
        let mut formula = Formula::sum(vec![
            Formula::reference(QuantityReference::species(10).with_alias("a")),
            Formula::reference(QuantityReference::species(11).with_alias("b")),
        ]);
        formula.set_quantity_reference(&QuantityReference::species(11).with_alias("a"));
        formula.xml_finalize_instance(&store).unwrap();
        formula.update_indices_of_referenced_variables(&store);
        let mut used = BTreeSet::new();
        formula.append_used_variables(&store, &mut used, &BTreeSet::new());
        assert_eq!(used.into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn matlab_rendering() {
        let (store, _) = store_with_species(2);
        let mut k = Formula::reference(QuantityReference::parameter(1));
        k.xml_finalize_instance(&store).unwrap();
        let formula = Formula::diff(
            Formula::product(vec![k, Formula::unary(UnaryFunction::Ln, species_leaf(&store, 11))]),
            Formula::max(Formula::reference(QuantityReference::time()), Formula::constant(0.5)),
        );
        assert_eq!(formula.matlab_code(), "((Q1 * log(y(2))) - max(Time, 0.5))");
    }

    #[test]
    fn formula_table_rejects_wrapper_without_single_expression() {
        let list = XmlNode::new("FormulaList").with_child(
            XmlNode::new("Formula")
                .with_attribute("Id", 3)
                .with_child(XmlNode::new("CONSTANT").with_attribute("Value", 1))
                .with_child(XmlNode::new("CONSTANT").with_attribute("Value", 2)),
        );
        assert_err_contains(FormulaTable::load_from_xml_node(&list), "exactly one expression");

        let duplicate = XmlNode::new("FormulaList")
            .with_child(
                XmlNode::new("Formula")
                    .with_attribute("Id", 3)
                    .with_child(XmlNode::new("CONSTANT").with_attribute("Value", 1)),
            )
            .with_child(
                XmlNode::new("Formula")
                    .with_attribute("Id", 3)
                    .with_child(XmlNode::new("CONSTANT").with_attribute("Value", 2)),
            );
        assert_err_contains(FormulaTable::load_from_xml_node(&duplicate), "duplicate formula id=3");
    }

    #[test]
    fn formula_table_reports_owner_of_bad_reference() {
        let list = XmlNode::new("FormulaList").with_child(
            XmlNode::new("Formula")
                .with_attribute("Id", 8)
                .with_child(XmlNode::new("Parameter").with_attribute("Id", 99)),
        );
        let mut table = FormulaTable::load_from_xml_node(&list).unwrap();
        assert_err_contains(
            table.xml_finalize_instance(&QuantityStore::new()),
            "Formula id=8: object with id=99 not found",
        );
    }
}
