use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Path fragments of containers whose species may become negative
/// (gland compartments, source containers, particle bins, application sites).
pub const DEFAULT_NEGATIVE_VALUES_ALLOWED_PATTERNS: [&str; 4] =
    ["SalivaGland", "IgG_Source", "ParticleBin_", "|Applications|"];

/// Options controlling how a loaded model is turned into an ODE system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Fold constant subtrees and prune zero RHS terms after finalize.
    pub simplify: bool,
    /// Lift species that stay constant for the whole run out of the state vector.
    pub remove_constant_species: bool,
    pub max_simplify_passes: usize,
    pub negative_values_allowed_path_patterns: Vec<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            simplify: true,
            remove_constant_species: true,
            max_simplify_passes: 100,
            negative_values_allowed_path_patterns: DEFAULT_NEGATIVE_VALUES_ALLOWED_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ModelSettings {
    pub fn from_json(input: &str) -> Result<Self> {
        let settings: ModelSettings = serde_json::from_str(input).map_err(|e| {
            ModelError::configuration("ModelSettings::from_json", format!("invalid settings: {e}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.simplify && self.max_simplify_passes == 0 {
            return Err(ModelError::configuration(
                "ModelSettings::validate",
                "max_simplify_passes must be greater than zero when simplification is enabled",
            ));
        }
        Ok(())
    }

    /// Whether species under `path` are exempt from the non-negativity constraint.
    pub fn negative_values_forced(&self, path: &str) -> bool {
        self.negative_values_allowed_path_patterns
            .iter()
            .any(|pattern| path.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_anatomical_patterns() {
        let settings = ModelSettings::default();
        assert!(settings.negative_values_forced("Organism|SalivaGland|Plasma"));
        assert!(settings.negative_values_forced("Organism|ParticleBin_3|Drug"));
        assert!(settings.negative_values_forced("Sim|Applications|Bolus|Drug"));
        assert!(!settings.negative_values_forced("Organism|Liver|Cells"));
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let settings = ModelSettings::from_json(r#"{ "remove_constant_species": false }"#)
            .expect("settings should parse");
        assert!(!settings.remove_constant_species);
        assert!(settings.simplify);
        assert_eq!(settings.max_simplify_passes, 100);
    }

    #[test]
    fn zero_passes_is_rejected() {
        let err = ModelSettings::from_json(r#"{ "max_simplify_passes": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("max_simplify_passes"));
    }

    #[test]
    fn malformed_json_is_a_configuration_error() {
        let err = ModelSettings::from_json("{ simplify: yes").unwrap_err();
        assert!(matches!(err, ModelError::Configuration { .. }));
    }
}
