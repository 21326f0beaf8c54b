//! Parameter file stored in every case folder.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::RemoteResult;

pub const PARAM_FILE_NAME: &str = ".caseParams";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDocument {
    #[serde(rename = "type")]
    pub case_type: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl ParamDocument {
    pub fn new(case_type: impl Into<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            case_type: case_type.into(),
            vars,
        }
    }

    pub fn to_json_bytes(&self) -> RemoteResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json_bytes(data: &[u8]) -> RemoteResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_field_is_named_type() {
        let doc = ParamDocument::new("2D Shape", BTreeMap::from([("a".into(), "1".into())]));
        let json = String::from_utf8(doc.to_json_bytes().unwrap()).unwrap();
        assert!(json.contains("\"type\": \"2D Shape\""));
    }

    #[test]
    fn vars_default_to_empty() {
        let doc = ParamDocument::from_json_bytes(br#"{"type": "x"}"#).unwrap();
        assert!(doc.vars.is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = ParamDocument::from_json_bytes(b"not json").unwrap_err();
        assert!(matches!(err, crate::RemoteError::Malformed { .. }));
    }
}
