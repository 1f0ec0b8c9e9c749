//! Deployment namespace prefixing of app ids and pubsub names
use std::env;

/// Environment variable holding the namespace
pub const ENV_NAMESPACE: &str = "PLINTH_NAMESPACE";

const SEPARATOR: &str = "-";

/// `<namespace>-<name>` when a namespace is set, `name` otherwise
pub fn encapsulate(name: &str) -> String {
    encapsulate_in(env::var(ENV_NAMESPACE).ok().as_deref(), name)
}

/// As `encapsulate` with an explicit namespace.  Empty counts as unset.
pub fn encapsulate_in(namespace: Option<&str>, name: &str) -> String {
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => [ns, SEPARATOR, name].concat(),
        None => name.to_string(),
    }
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_when_set() {
        assert_eq!(encapsulate_in(Some("staging"), "orders"), "staging-orders");
    }

    #[test]
    fn unchanged_when_unset_or_empty() {
        assert_eq!(encapsulate_in(None, "orders"), "orders");
        assert_eq!(encapsulate_in(Some(""), "orders"), "orders");
    }
}
