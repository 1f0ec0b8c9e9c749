//! Canonical invocation addresses: v<version>:<module>:<handler>[:<origin>]
use std::fmt;
use crate::error::SdkError;

const SEPARATOR: char = ':';

/// Build the canonical address for a handler.  An empty origin is the same
/// as none.  The result is lower case.
pub fn resolve(api_version: u32, module: &str, handler: &str, origin: Option<&str>)
               -> Result<String, SdkError> {
    check_segment("module", module)?;
    check_segment("handler", handler)?;
    let origin = origin.filter(|o| !o.is_empty());
    if let Some(origin) = origin {
        check_segment("origin", origin)?;
    }

    // v + digits + 3 separators
    let mut address = String::with_capacity(
        14 + module.len() + handler.len() + origin.map_or(0, str::len));
    address.push('v');
    address.push_str(&api_version.to_string());
    for segment in [Some(module), Some(handler), origin].into_iter().flatten() {
        address.push(SEPARATOR);
        address.push_str(segment);
    }

    Ok(address.to_lowercase())
}

fn check_segment(what: &str, segment: &str) -> Result<(), SdkError> {
    if segment.is_empty() {
        return Err(SdkError::InvalidAddress(format!("{what} must not be empty")));
    }
    if segment.contains(SEPARATOR) {
        return Err(SdkError::InvalidAddress(
            format!("{what} '{segment}' must not contain '{SEPARATOR}'")));
    }
    Ok(())
}

/// Parsed canonical address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub api_version: u32,
    pub module: String,
    pub handler: String,
    pub origin: Option<String>,
}

impl Address {
    pub fn new(api_version: u32, module: &str, handler: &str, origin: Option<&str>)
               -> Result<Self, SdkError> {
        // Validate through the same path as resolve
        resolve(api_version, module, handler, origin)?;
        Ok(Self {
            api_version,
            module: module.to_lowercase(),
            handler: handler.to_lowercase(),
            origin: origin.filter(|o| !o.is_empty()).map(str::to_lowercase),
        })
    }

    /// Parse an address string back into its parts
    pub fn parse(address: &str) -> Result<Self, SdkError> {
        let invalid = || SdkError::InvalidAddress(address.to_string());
        let parts: Vec<&str> = address.split(SEPARATOR).collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(invalid());
        }

        let api_version = parts[0]
            .strip_prefix(['v', 'V'])
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(invalid)?;

        let origin = parts.get(3).copied();
        if origin == Some("") {
            return Err(invalid());
        }
        Self::new(api_version, parts[1], parts[2], origin)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}{SEPARATOR}{}{SEPARATOR}{}", self.api_version, self.module, self.handler)?;
        if let Some(origin) = &self.origin {
            write!(f, "{SEPARATOR}{origin}")?;
        }
        Ok(())
    }
}
