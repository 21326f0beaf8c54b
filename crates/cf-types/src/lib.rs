//! cf-types: case analysis templates, their file format and validation.

pub mod registry;
pub mod schema;
pub mod validate;

pub use registry::CaseTypeRegistry;
pub use schema::*;
pub use validate::{ValidationError, validate_case_type};

pub type TypeResult<T> = Result<T, TypeError>;

#[derive(thiserror::Error, Debug)]
pub enum TypeError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Duplicate case type: {name}")]
    DuplicateType { name: String },

    #[error("Unsupported case type file: {path}")]
    UnsupportedFile { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn load_yaml(path: &std::path::Path) -> TypeResult<CaseTypeDef> {
    let content = std::fs::read_to_string(path)?;
    let def: CaseTypeDef = serde_yaml::from_str(&content)?;
    validate_case_type(&def)?;
    Ok(def)
}

pub fn load_json(path: &std::path::Path) -> TypeResult<CaseTypeDef> {
    let content = std::fs::read_to_string(path)?;
    let def: CaseTypeDef = serde_json::from_str(&content)?;
    validate_case_type(&def)?;
    Ok(def)
}

pub fn save_yaml(path: &std::path::Path, def: &CaseTypeDef) -> TypeResult<()> {
    validate_case_type(def)?;
    let content = serde_yaml::to_string(def)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load a definition, choosing the format from the file extension.
pub fn load_file(path: &std::path::Path) -> TypeResult<CaseTypeDef> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => load_yaml(path),
        Some("json") => load_json(path),
        _ => Err(TypeError::UnsupportedFile {
            path: path.display().to_string(),
        }),
    }
}
