use serde::{Deserialize, Serialize};

/// Domain-level failure of a lifecycle operation.
///
/// Faults are serializable so a worker can send them back through the
/// transport as a structured reply instead of failing the call itself.
/// `NotFound` is deliberately ambiguous: a caller cannot tell "never
/// reserved", "already confirmed" and "already reclaimed" apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Fault {
    #[error("{0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

impl Fault {
    pub fn validation(msg: impl Into<String>) -> Self {
        Fault::Validation(msg.into())
    }

    pub fn unavailable(msg: impl std::fmt::Display) -> Self {
        Fault::Unavailable(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_round_trips_as_json() {
        let fault = Fault::Validation("content type not allowed".to_string());
        let bytes = serde_json::to_vec(&fault).unwrap();
        let decoded: Fault = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, fault);
    }

    #[test]
    fn not_found_carries_no_detail() {
        let json = serde_json::to_value(Fault::NotFound).unwrap();
        assert_eq!(json["kind"], "not_found");
        assert!(json.get("detail").is_none());
    }
}
