//! Matlab rendering of a finalized model's right-hand side.

use std::collections::BTreeSet;
use std::io::{self, Write};

use crate::model::Model;
use crate::quantity::{Quantity, QuantityId};

/// Writes `function dy = ode_rhs(Time, y)` computing the derivative vector.
///
/// Quantities referenced by the RHS are defined as `Q<id>` before use, in
/// dependency order.
pub fn write_matlab_ode_function(model: &Model, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "function dy = ode_rhs(Time, y)")?;
    writeln!(out, "% {} integrated species", model.dimension())?;

    let mut referenced = BTreeSet::new();
    for species in model.active_species() {
        for term in species.rhs() {
            term.referenced_quantity_ids(&mut referenced);
        }
    }
    let mut emitted = BTreeSet::new();
    for id in referenced {
        write_definition(model, id, out, &mut emitted)?;
    }

    writeln!(out, "dy = zeros({}, 1);", model.dimension())?;
    for species in model.active_species() {
        species.write_matlab_code(out)?;
    }
    writeln!(out, "end")
}

fn write_definition(
    model: &Model,
    id: QuantityId,
    out: &mut dyn Write,
    emitted: &mut BTreeSet<QuantityId>,
) -> io::Result<()> {
    if !emitted.insert(id) {
        return Ok(());
    }
    let store = model.quantities();
    let Some(quantity) = store.by_id(id) else {
        return Ok(());
    };

    match (quantity, quantity.core().value_formula()) {
        (Quantity::Species(species), _) => {
            writeln!(out, "Q{id} = {};", species.initial_value(store))
        }
        (_, Some(formula)) => {
            let mut dependencies = BTreeSet::new();
            formula.referenced_quantity_ids(&mut dependencies);
            for dependency in dependencies {
                write_definition(model, dependency, out, emitted)?;
            }
            write!(out, "Q{id} = ")?;
            formula.write_matlab_code(out)?;
            writeln!(out, ";")
        }
        (_, None) => writeln!(out, "Q{id} = {};", quantity.core().literal_value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ModelSettings;

    #[test]
    fn definitions_precede_their_use() {
        let xml = r#"
            <Simulation>
              <FormulaList>
                <Formula Id="1"><PRODUCT><Parameter Id="2"/><Variable Id="10"/></PRODUCT></Formula>
                <Formula Id="2"><PRODUCT><Parameter Id="1"/><Reference Id="-2"/></PRODUCT></Formula>
              </FormulaList>
              <ParameterList>
                <Parameter Id="1" Value="0.5"/>
                <Parameter Id="2" FormulaId="2"/>
              </ParameterList>
              <VariableList>
                <Species Id="10" Value="1"><RHSFormulaList><RHSFormula Id="1"/></RHSFormulaList></Species>
              </VariableList>
            </Simulation>"#;
        let model = Model::from_xml_str(xml, ModelSettings::default()).unwrap();
        let mut out = Vec::new();
        write_matlab_ode_function(&model, &mut out).unwrap();
        let code = String::from_utf8(out).unwrap();

        assert_eq!(
            code,
            "function dy = ode_rhs(Time, y)\n\
             % 1 integrated species\n\
             Q2 = (0.5 * Time);\n\
             dy = zeros(1, 1);\n\
             dy(1) = (Q2 * y(1));\n\
             end\n"
        );
    }
}
