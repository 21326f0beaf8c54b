//! Case analysis type definitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseTypeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageDef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub kind: StageKind,
    /// Remote app submitted to run this stage.
    pub app: String,
    /// Paths relative to the case folder produced by this stage. The stage is
    /// finished once all of them exist.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Mesh,
    Solve,
    Post,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Mesh => "mesh",
            StageKind::Solve => "solve",
            StageKind::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterDef {
    pub name: String,
    /// Stage whose run consumes this parameter.
    pub stage: String,
    pub default: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterKind {
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Int {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Choice {
        options: Vec<String>,
    },
    Text,
    File,
}

impl StageDef {
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }

    /// Marker file a failed run leaves in the case folder.
    pub fn error_marker(&self) -> String {
        format!("{}.err", self.id)
    }
}

impl ParameterDef {
    /// Check a candidate value against this parameter's kind.
    pub fn check(&self, value: &str) -> Result<(), String> {
        match &self.kind {
            ParameterKind::Float { min, max } => {
                let v: f64 = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("'{value}' is not a number"))?;
                if !v.is_finite() {
                    return Err(format!("'{value}' is not finite"));
                }
                if let Some(min) = min
                    && v < *min
                {
                    return Err(format!("{v} is below minimum {min}"));
                }
                if let Some(max) = max
                    && v > *max
                {
                    return Err(format!("{v} is above maximum {max}"));
                }
                Ok(())
            }
            ParameterKind::Int { min, max } => {
                let v: i64 = value
                    .trim()
                    .parse()
                    .map_err(|_| format!("'{value}' is not an integer"))?;
                if let Some(min) = min
                    && v < *min
                {
                    return Err(format!("{v} is below minimum {min}"));
                }
                if let Some(max) = max
                    && v > *max
                {
                    return Err(format!("{v} is above maximum {max}"));
                }
                Ok(())
            }
            ParameterKind::Choice { options } => {
                if options.iter().any(|o| o == value) {
                    Ok(())
                } else {
                    Err(format!("'{value}' is not one of {options:?}"))
                }
            }
            ParameterKind::Text | ParameterKind::File => Ok(()),
        }
    }
}

impl CaseTypeDef {
    pub fn stage(&self, id: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    pub fn stage_of_kind(&self, kind: StageKind) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// The named stage and every stage after it, in pipeline order.
    pub fn stages_from(&self, id: &str) -> &[StageDef] {
        match self.stage_index(id) {
            Some(idx) => &self.stages[idx..],
            None => &[],
        }
    }

    /// Stages strictly before the named one.
    pub fn stages_before(&self, id: &str) -> &[StageDef] {
        match self.stage_index(id) {
            Some(idx) => &self.stages[..idx],
            None => &[],
        }
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn default_params(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.default.clone()))
            .collect()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn int_check_matches_bounds(v in -1000i64..1000, lo in -500i64..0, hi in 0i64..500) {
            let p = ParameterDef {
                name: "n".into(),
                stage: "mesh".into(),
                default: "0".into(),
                label: None,
                kind: ParameterKind::Int { min: Some(lo), max: Some(hi) },
            };
            prop_assert_eq!(p.check(&v.to_string()).is_ok(), lo <= v && v <= hi);
        }

        #[test]
        fn float_check_rejects_below_minimum(min in -1.0e6f64..1.0e6, below in 1.0e-3f64..1.0e3) {
            let p = ParameterDef {
                name: "u".into(),
                stage: "sim".into(),
                default: "1.0".into(),
                label: None,
                kind: ParameterKind::Float { min: Some(min), max: None },
            };
            prop_assert!(p.check(&min.to_string()).is_ok());
            prop_assert!(p.check(&(min - below).to_string()).is_err());
        }
    }
}
