//! Template identifiers and per-key operation results.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Identifies a query template registered with a provider.
///
/// Rdb subscriptions are keyed by a table URI combined with one of these, so
/// the ordering here (subscriber id first, then bundle name) is part of the
/// key ordering contract.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct TemplateId {
    /// Id of the subscriber that owns the template.
    pub subscriber_id: i64,
    /// Bundle name of the template owner.
    pub bundle_name: String,
}

impl TemplateId {
    /// Create a new template id.
    pub fn new(subscriber_id: i64, bundle_name: impl Into<String>) -> Self {
        Self {
            subscriber_id,
            bundle_name: bundle_name.into(),
        }
    }
}

/// Outcome of a subscribe/unsubscribe style operation for one key.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub enum ResultCode {
    /// The operation succeeded.
    Ok,
    /// The provider does not know the target URI.
    UriNotExist,
    /// The caller lacks permission for the target.
    NoPermission,
    /// The provider refused because a capacity limit was reached.
    OverLimit,
    /// The provider or the transport failed internally.
    InnerError,
    /// Enable/disable referenced a key or observer that is not registered.
    SubscriberNotExist,
    /// Remove referenced a key with no registered observers.
    UnregisteredEmpty,
}

impl ResultCode {
    /// Check if this code means success.
    pub fn is_ok(self) -> bool {
        matches!(self, ResultCode::Ok)
    }

    /// Stable numeric code surfaced to application callers.
    pub fn code(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::UriNotExist => 1,
            ResultCode::NoPermission => 2,
            ResultCode::OverLimit => 3,
            ResultCode::InnerError => 4,
            ResultCode::SubscriberNotExist => 5,
            ResultCode::UnregisteredEmpty => 6,
        }
    }

    /// Map a numeric code back to a result code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::UriNotExist),
            2 => Some(ResultCode::NoPermission),
            3 => Some(ResultCode::OverLimit),
            4 => Some(ResultCode::InnerError),
            5 => Some(ResultCode::SubscriberNotExist),
            6 => Some(ResultCode::UnregisteredEmpty),
            _ => None,
        }
    }
}

/// Result of an operation on a single key, identified by its URI.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Archive,
    Serialize,
    Deserialize,
    SerdeSerialize,
    SerdeDeserialize,
)]
pub struct OperationResult {
    /// URI the result refers to.
    pub key: String,
    /// Outcome for that URI.
    pub code: ResultCode,
}

impl OperationResult {
    /// Create a result with an explicit code.
    pub fn new(key: impl Into<String>, code: ResultCode) -> Self {
        Self {
            key: key.into(),
            code,
        }
    }

    /// Create a successful result.
    pub fn ok(key: impl Into<String>) -> Self {
        Self::new(key, ResultCode::Ok)
    }

    /// Check if this result is a success.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }
}

/// Check that no result recorded for `uri` is a failure.
///
/// A URI without any result counts as succeeded.
pub fn all_succeeded(results: &[OperationResult], uri: &str) -> bool {
    results
        .iter()
        .filter(|result| result.key == uri)
        .all(OperationResult::is_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_id_ordering() {
        let a = TemplateId::new(1, "com.example.b");
        let b = TemplateId::new(2, "com.example.a");
        let c = TemplateId::new(2, "com.example.b");

        assert!(a < b);
        assert!(b < c);
        assert_eq!(c, TemplateId::new(2, "com.example.b"));
    }

    #[test]
    fn test_result_code_numeric_mapping() {
        for code in 0..=6 {
            let result = ResultCode::from_code(code).unwrap();
            assert_eq!(result.code(), code);
        }
        assert_eq!(ResultCode::from_code(7), None);
        assert!(ResultCode::Ok.is_ok());
        assert!(!ResultCode::OverLimit.is_ok());
    }

    #[test]
    fn test_all_succeeded() {
        let uri1 = "datashare:///com.acts.datasharetest1";
        let uri2 = "datashare:///com.acts.datasharetest2";

        let mut results = Vec::new();
        assert!(all_succeeded(&results, uri1));

        results.push(OperationResult::ok(uri1));
        assert!(all_succeeded(&results, uri1));

        results.push(OperationResult::new(uri2, ResultCode::InnerError));
        assert!(!all_succeeded(&results, uri2));
        assert!(all_succeeded(&results, uri1));
        assert!(all_succeeded(&results, ""));
    }

    #[test]
    fn test_operation_result_json() {
        let result = OperationResult::new("datashare:///table", ResultCode::NoPermission);
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"key":"datashare:///table","code":"NoPermission"}"#);

        let back: OperationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
