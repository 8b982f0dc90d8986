//! Step response returned to the coordinator.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};

/// Outcome of one build step.
///
/// Exactly one of `diff` and `error` is present, matching `success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub success: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_base64"
    )]
    pub diff: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResponse {
    pub fn ok(diff: Vec<u8>) -> Self {
        Self {
            success: true,
            diff: Some(diff),
            error: None,
        }
    }

    pub fn failed(error: &BuildError) -> Self {
        Self {
            success: false,
            diff: None,
            error: Some(error.to_string()),
        }
    }

    pub fn from_result(result: &Result<Vec<u8>>) -> Self {
        match result {
            Ok(diff) => Self::ok(diff.clone()),
            Err(e) => Self::failed(e),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

mod optional_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shape() {
        let json = serde_json::to_value(StepResponse::ok(b"abc".to_vec())).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["diff"], "YWJj");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_empty_diff_still_present() {
        let json = serde_json::to_value(StepResponse::ok(Vec::new())).unwrap();
        assert_eq!(json["diff"], "");
    }

    #[test]
    fn test_failure_shape() {
        let resp = StepResponse::failed(&BuildError::MissingInstruction);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no instruction specified");
        assert!(json.get("diff").is_none());
    }

    #[test]
    fn test_from_result() {
        let ok: Result<Vec<u8>> = Ok(vec![1, 2]);
        assert_eq!(StepResponse::from_result(&ok), StepResponse::ok(vec![1, 2]));

        let err: Result<Vec<u8>> = Err(BuildError::Execute("exit status 1".into()));
        let resp = StepResponse::from_result(&err);
        assert!(!resp.success);
        assert_eq!(
            resp.error.as_deref(),
            Some("could not execute step: exit status 1")
        );
    }

    #[test]
    fn test_response_parses_back() {
        let bytes = StepResponse::ok(vec![9, 8, 7]).to_json().unwrap();
        let parsed: StepResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.diff, Some(vec![9, 8, 7]));
    }
}
