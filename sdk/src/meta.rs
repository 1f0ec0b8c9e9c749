//! Request metadata keys and the multi-valued metadata map carried by calls
use std::collections::HashMap;

/// Application key
pub const KEY_APP_KEY: &str = "plinth-app-key";

/// Request source - client, external domain, third party API
pub const KEY_SOURCE: &str = "plinth-source";

/// Tenant id
pub const KEY_TID: &str = "plinth-tid";

/// User id
pub const KEY_UID: &str = "plinth-uid";

/// Comma separated role ids
pub const KEY_ROLE_IDS: &str = "plinth-role-ids";

/// Trace / session id
pub const KEY_TRACE_ID: &str = "plinth-trace-id";

/// Incoming or outgoing call metadata, as the sidecar carries it
pub type Metadata = HashMap<String, Vec<String>>;

/// First value of a key, if present
pub fn first_value<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key)
        .and_then(|values| values.first())
        .map(String::as_str)
}

/// Parse a comma separated list of ids, skipping anything unparseable
pub fn parse_ids(csv: &str) -> Vec<i64> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}
