//! The uniform request interface.
//!
//! Every operation the engine offers is a [`Request`] addressed by
//! namespace, path and [`Operation`], carrying a JSON payload and an
//! optional bearer token. Administrative actions are requests against
//! well-known paths (`sys/namespaces/<name>`, `sys/policies/acl/<name>`,
//! `sys/mounts/<path>`, `auth/<mount>/...`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RequestError;

/// Request payload and response data.
pub type Payload = serde_json::Map<String, Value>;

/// The four request verbs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Read a value.
    #[default]
    Read,
    /// Create, update, or trigger an action.
    Write,
    /// Delete a value.
    Delete,
    /// List keys under a path.
    List,
}

impl Operation {
    /// Lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }

    /// Whether the operation changes state.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Write | Self::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to the engine.
#[derive(Clone, Default)]
pub struct Request {
    /// Namespace path the request is evaluated in (empty = root).
    pub namespace: String,
    /// Path inside the namespace, e.g. `secret/data/app`.
    pub path: String,
    /// The verb.
    pub operation: Operation,
    /// JSON payload (empty for reads).
    pub data: Payload,
    /// Bearer token.
    pub token: Option<String>,
}

impl Request {
    /// A request with an empty payload in the root namespace.
    #[must_use]
    pub fn new(operation: Operation, path: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            path: path.into(),
            operation,
            data: Payload::new(),
            token: None,
        }
    }

    /// Shorthand for a read.
    #[must_use]
    pub fn read(path: impl Into<String>) -> Self {
        Self::new(Operation::Read, path)
    }

    /// Shorthand for a write.
    #[must_use]
    pub fn write(path: impl Into<String>) -> Self {
        Self::new(Operation::Write, path)
    }

    /// Shorthand for a delete.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Operation::Delete, path)
    }

    /// Shorthand for a list.
    #[must_use]
    pub fn list(path: impl Into<String>) -> Self {
        Self::new(Operation::List, path)
    }

    /// Evaluate in the given namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Replace the payload. Non-object values yield an empty payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = match data {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        self
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("namespace", &self.namespace)
            .field("path", &self.path)
            .field("operation", &self.operation)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

/// Token information returned by logins and token creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    /// The plaintext token.
    pub client_token: String,
    /// Token accessor (the token hash prefix).
    pub accessor: String,
    /// Normalized policy names.
    pub policies: Vec<String>,
    /// Same as `policies`.
    pub token_policies: Vec<String>,
    /// Token metadata.
    pub metadata: BTreeMap<String, String>,
    /// Seconds until expiry (0 = never).
    pub lease_duration: i64,
    /// Whether the token can be renewed.
    pub renewable: bool,
    /// Path of the namespace the token belongs to (empty for root).
    pub namespace_path: String,
}

/// Result of a successful request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Response {
    /// Response data, `None` when there is nothing to return.
    pub data: Option<Payload>,
    /// Token information for logins and token creation.
    pub auth: Option<AuthResponse>,
}

impl Response {
    /// An empty response.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A response carrying `data`. Non-object values yield no data.
    #[must_use]
    pub fn with_data(data: Value) -> Self {
        Self {
            data: match data {
                Value::Object(map) => Some(map),
                _ => None,
            },
            auth: None,
        }
    }

    /// A listing. An empty key set is reported as no data.
    #[must_use]
    pub fn list(keys: Vec<String>) -> Self {
        if keys.is_empty() {
            Self::empty()
        } else {
            Self::with_data(serde_json::json!({ "keys": keys }))
        }
    }

    /// A field of the response data.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// The `keys` of a listing (empty when there is no data).
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.get("keys")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Payload field helpers
// ---------------------------------------------------------------------------

/// An optional string field.
pub(crate) fn opt_str<'a>(data: &'a Payload, key: &str) -> Result<Option<&'a str>, RequestError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(RequestError::invalid(format!("'{key}' must be a string"))),
    }
}

/// A required, non-empty string field.
pub(crate) fn req_str<'a>(data: &'a Payload, key: &str) -> Result<&'a str, RequestError> {
    opt_str(data, key)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RequestError::invalid(format!("missing required field '{key}'")))
}

/// A list of strings, given either as an array or as a comma-separated
/// string.
pub(crate) fn opt_str_list(data: &Payload, key: &str) -> Result<Option<Vec<String>>, RequestError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_owned())
                    .ok_or_else(|| RequestError::invalid(format!("'{key}' must contain strings")))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(RequestError::invalid(format!("'{key}' must be a list of strings"))),
    }
}

/// A boolean field, also accepting `"true"`/`"false"`.
pub(crate) fn opt_bool(data: &Payload, key: &str) -> Result<Option<bool>, RequestError> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| RequestError::invalid(format!("'{key}' must be a boolean"))),
        Some(_) => Err(RequestError::invalid(format!("'{key}' must be a boolean"))),
    }
}

/// A non-negative integer field, also accepting numeric strings.
pub(crate) fn opt_u32(data: &Payload, key: &str) -> Result<Option<u32>, RequestError> {
    let err = || RequestError::invalid(format!("'{key}' must be a non-negative integer"));
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(err),
        Some(Value::String(s)) => s.parse().map(Some).map_err(|_| err()),
        Some(_) => Err(err()),
    }
}

/// A duration in seconds, given as a number or a string such as `"90"`,
/// `"30s"`, `"15m"`, `"768h"` or `"7d"`.
pub(crate) fn opt_duration_secs(data: &Payload, key: &str) -> Result<Option<i64>, RequestError> {
    let err = || RequestError::invalid(format!("'{key}' must be a duration"));
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().filter(|n| *n >= 0).map(Some).ok_or_else(err),
        Some(Value::String(s)) => parse_duration_secs(s).map(Some).ok_or_else(err),
        Some(_) => Err(err()),
    }
}

/// An object of string values, such as token metadata.
pub(crate) fn opt_string_map(
    data: &Payload,
    key: &str,
) -> Result<Option<BTreeMap<String, String>>, RequestError> {
    let err = || RequestError::invalid(format!("'{key}' must be an object of strings"));
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_owned())).ok_or_else(err))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(Some),
        Some(_) => Err(err()),
    }
}

/// Parse `"90"`, `"30s"`, `"15m"`, `"768h"`, `"7d"` into seconds.
#[must_use]
pub fn parse_duration_secs(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: i64 = digits.parse().ok()?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(v: Value) -> Payload {
        match v {
            Value::Object(m) => m,
            _ => Payload::new(),
        }
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration_secs("90"), Some(90));
        assert_eq!(parse_duration_secs("30s"), Some(30));
        assert_eq!(parse_duration_secs("15m"), Some(900));
        assert_eq!(parse_duration_secs("768h"), Some(2_764_800));
        assert_eq!(parse_duration_secs("7d"), Some(604_800));
        assert_eq!(parse_duration_secs("1w"), None);
        assert_eq!(parse_duration_secs("h"), None);
    }

    #[test]
    fn string_lists_accept_arrays_and_csv() {
        let data = payload(json!({"a": ["x", "y"], "b": "x, y,", "c": 3}));
        assert_eq!(opt_str_list(&data, "a").unwrap().unwrap(), vec!["x", "y"]);
        assert_eq!(opt_str_list(&data, "b").unwrap().unwrap(), vec!["x", "y"]);
        assert!(opt_str_list(&data, "c").is_err());
        assert!(opt_str_list(&data, "missing").unwrap().is_none());
    }

    #[test]
    fn required_strings_must_be_present_and_non_empty() {
        let data = payload(json!({"a": "", "b": "v"}));
        assert!(req_str(&data, "a").is_err());
        assert!(req_str(&data, "missing").is_err());
        assert_eq!(req_str(&data, "b").unwrap(), "v");
    }

    #[test]
    fn empty_listing_has_no_data() {
        assert!(Response::list(Vec::new()).data.is_none());
        let r = Response::list(vec!["a/".to_owned()]);
        assert_eq!(r.keys(), vec!["a/"]);
    }

    #[test]
    fn numbers_and_bools_accept_strings() {
        let data = payload(json!({"n": "5", "b": "true", "bad": -1}));
        assert_eq!(opt_u32(&data, "n").unwrap(), Some(5));
        assert_eq!(opt_bool(&data, "b").unwrap(), Some(true));
        assert!(opt_u32(&data, "bad").is_err());
    }

    #[test]
    fn metadata_must_hold_strings() {
        let data = payload(json!({"meta": {"team": "ops"}, "bad": {"n": 1}}));
        let meta = opt_string_map(&data, "meta").unwrap().unwrap();
        assert_eq!(meta["team"], "ops");
        assert!(opt_string_map(&data, "bad").is_err());
    }
}
