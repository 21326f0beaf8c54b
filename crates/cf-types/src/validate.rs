//! Case type validation logic.

use std::collections::HashSet;

use crate::schema::CaseTypeDef;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Duplicate ID: {id} in {context}")]
    DuplicateId { id: String, context: String },

    #[error("Missing reference: {id} in {context}")]
    MissingReference { id: String, context: String },

    #[error("Invalid value: {field} = {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Case type '{name}' is empty: {reason}")]
    Empty { name: String, reason: String },
}

pub fn validate_case_type(def: &CaseTypeDef) -> Result<(), ValidationError> {
    if def.name.trim().is_empty() {
        return Err(ValidationError::InvalidValue {
            field: "name".to_string(),
            value: def.name.clone(),
            reason: "case type name must not be blank".to_string(),
        });
    }

    if def.stages.is_empty() {
        return Err(ValidationError::Empty {
            name: def.name.clone(),
            reason: "at least one stage is required".to_string(),
        });
    }

    let mut stage_ids = HashSet::new();
    let mut kinds = HashSet::new();
    for stage in &def.stages {
        if stage.id.is_empty() || stage.id.contains('/') {
            return Err(ValidationError::InvalidValue {
                field: "stage.id".to_string(),
                value: stage.id.clone(),
                reason: "stage ids must be non-empty and contain no '/'".to_string(),
            });
        }
        if !stage_ids.insert(stage.id.as_str()) {
            return Err(ValidationError::DuplicateId {
                id: stage.id.clone(),
                context: format!("stages of '{}'", def.name),
            });
        }
        if !kinds.insert(stage.kind) {
            return Err(ValidationError::DuplicateId {
                id: format!("{:?}", stage.kind),
                context: format!("stage kinds of '{}'", def.name),
            });
        }
        if stage.app.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: format!("stages.{}.app", stage.id),
                value: stage.app.clone(),
                reason: "app must not be blank".to_string(),
            });
        }
        if stage.outputs.is_empty() {
            return Err(ValidationError::Empty {
                name: def.name.clone(),
                reason: format!("stage '{}' declares no outputs", stage.id),
            });
        }
        for output in &stage.outputs {
            if output.is_empty() || output.split('/').any(|p| p == ".." || p == ".") {
                return Err(ValidationError::InvalidValue {
                    field: format!("stages.{}.outputs", stage.id),
                    value: output.clone(),
                    reason: "outputs must be relative paths inside the case folder".to_string(),
                });
            }
        }
    }

    let mut param_names = HashSet::new();
    for param in &def.parameters {
        if !param_names.insert(param.name.as_str()) {
            return Err(ValidationError::DuplicateId {
                id: param.name.clone(),
                context: format!("parameters of '{}'", def.name),
            });
        }
        if !stage_ids.contains(param.stage.as_str()) {
            return Err(ValidationError::MissingReference {
                id: param.stage.clone(),
                context: format!("parameter '{}' stage", param.name),
            });
        }
        param
            .check(&param.default)
            .map_err(|reason| ValidationError::InvalidValue {
                field: format!("parameters.{}.default", param.name),
                value: param.default.clone(),
                reason,
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ParameterDef, ParameterKind, StageDef, StageKind};

    fn base() -> CaseTypeDef {
        CaseTypeDef {
            name: "t".into(),
            description: String::new(),
            stages: vec![
                StageDef {
                    id: "mesh".into(),
                    label: None,
                    kind: StageKind::Mesh,
                    app: "mesh".into(),
                    outputs: vec!["constant/polyMesh".into()],
                },
                StageDef {
                    id: "sim".into(),
                    label: None,
                    kind: StageKind::Solve,
                    app: "solve".into(),
                    outputs: vec!["processor0".into()],
                },
            ],
            parameters: vec![ParameterDef {
                name: "u".into(),
                stage: "sim".into(),
                default: "1".into(),
                label: None,
                kind: ParameterKind::Float {
                    min: None,
                    max: None,
                },
            }],
        }
    }

    #[test]
    fn valid_type_passes() {
        assert!(validate_case_type(&base()).is_ok());
    }

    #[test]
    fn duplicate_stage_kind_fails() {
        let mut def = base();
        def.stages[1].kind = StageKind::Mesh;
        assert!(matches!(
            validate_case_type(&def),
            Err(ValidationError::DuplicateId { .. })
        ));
    }

    #[test]
    fn parameter_stage_must_exist() {
        let mut def = base();
        def.parameters[0].stage = "post".into();
        assert!(matches!(
            validate_case_type(&def),
            Err(ValidationError::MissingReference { .. })
        ));
    }

    #[test]
    fn bad_default_fails() {
        let mut def = base();
        def.parameters[0].default = "fast".into();
        assert!(matches!(
            validate_case_type(&def),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn escaping_output_fails() {
        let mut def = base();
        def.stages[0].outputs = vec!["../mesh".into()];
        assert!(validate_case_type(&def).is_err());
    }
}
