// Per-request context passed to every handler

use std::fmt;
use std::sync::Arc;
use rand::Rng;
use crate::meta::{self, Metadata};
use crate::transactor::Transactor;

/// Business context for one logical request.
///
/// Cloning is cheap and shares the same Transactor, so nested calls within
/// one request see one transaction.
#[derive(Clone)]
pub struct BizContext {
    tid: i64,
    uid: i64,
    app_key: String,
    source: String,
    role_ids: Vec<i64>,
    trace_id: String,
    transactor: Arc<Transactor>,
}

impl BizContext {

    /// Fresh context with no identity and a new trace id
    pub fn new() -> Self {
        Self {
            tid: 0,
            uid: 0,
            app_key: String::new(),
            source: String::new(),
            role_ids: Vec::new(),
            trace_id: new_trace_id(),
            transactor: Arc::new(Transactor::new()),
        }
    }

    /// Build from inbound call metadata.  Missing or malformed ids are zero.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let int = |key: &str| meta::first_value(metadata, key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default();
        let string = |key: &str| meta::first_value(metadata, key)
            .unwrap_or_default()
            .to_string();

        let mut ctx = Self::new();
        ctx.tid = int(meta::KEY_TID);
        ctx.uid = int(meta::KEY_UID);
        ctx.app_key = string(meta::KEY_APP_KEY);
        ctx.source = string(meta::KEY_SOURCE);
        ctx.role_ids = meta::first_value(metadata, meta::KEY_ROLE_IDS)
            .map(meta::parse_ids)
            .unwrap_or_default();
        if let Some(trace_id) = meta::first_value(metadata, meta::KEY_TRACE_ID) {
            if !trace_id.is_empty() {
                ctx.trace_id = trace_id.to_string();
            }
        }
        ctx
    }

    /// Metadata to carry on an outbound call
    pub fn to_metadata(&self) -> Metadata {
        let mut md = Metadata::new();
        let mut put = |key: &str, value: String| {
            if !value.is_empty() {
                md.insert(key.to_string(), vec![value]);
            }
        };

        if self.tid != 0 {
            put(meta::KEY_TID, self.tid.to_string());
        }
        if self.uid != 0 {
            put(meta::KEY_UID, self.uid.to_string());
        }
        put(meta::KEY_APP_KEY, self.app_key.clone());
        put(meta::KEY_SOURCE, self.source.clone());
        put(meta::KEY_ROLE_IDS, self.role_ids.iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(","));
        put(meta::KEY_TRACE_ID, self.trace_id.clone());
        md
    }

    pub fn with_tenant(mut self, tid: i64) -> Self {
        self.tid = tid;
        self
    }

    pub fn with_user(mut self, uid: i64) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_app_key(mut self, app_key: &str) -> Self {
        self.app_key = app_key.to_string();
        self
    }

    pub fn tid(&self) -> i64 { self.tid }
    pub fn uid(&self) -> i64 { self.uid }
    pub fn app_key(&self) -> &str { &self.app_key }
    pub fn source(&self) -> &str { &self.source }
    pub fn role_ids(&self) -> &[i64] { &self.role_ids }
    pub fn trace_id(&self) -> &str { &self.trace_id }

    /// Shared transaction holder for this request
    pub fn transactor(&self) -> Arc<Transactor> {
        self.transactor.clone()
    }
}

impl Default for BizContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal implementation of Debug for tracing
impl fmt::Debug for BizContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BizContext")
            .field("tid", &self.tid)
            .field("uid", &self.uid)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

/// Generate a 64-bit trace ID
fn new_trace_id() -> String {
    let random_bytes: [u8; 8] = rand::rng().random();
    hex::encode(random_bytes)
}

// -- Tests --
#[cfg(test)]
mod tests {
    use super::*;

    fn md(pairs: &[(&str, &str)]) -> Metadata {
        pairs.iter()
            .map(|(k, v)| (k.to_string(), vec![v.to_string()]))
            .collect()
    }

    #[test]
    fn from_metadata_reads_identity() {
        let ctx = BizContext::from_metadata(&md(&[
            (meta::KEY_TID, "42"),
            (meta::KEY_UID, "7"),
            (meta::KEY_APP_KEY, "shop"),
            (meta::KEY_ROLE_IDS, "1,2,3"),
            (meta::KEY_TRACE_ID, "abc"),
        ]));

        assert_eq!(ctx.tid(), 42);
        assert_eq!(ctx.uid(), 7);
        assert_eq!(ctx.app_key(), "shop");
        assert_eq!(ctx.role_ids(), &[1, 2, 3]);
        assert_eq!(ctx.trace_id(), "abc");
    }

    #[test]
    fn malformed_ids_are_zero_and_trace_is_generated() {
        let ctx = BizContext::from_metadata(&md(&[(meta::KEY_TID, "nope")]));
        assert_eq!(ctx.tid(), 0);
        assert_eq!(ctx.trace_id().len(), 16);
    }

    #[test]
    fn metadata_round_trips_through_outbound_call() {
        let ctx = BizContext::new().with_tenant(3).with_user(9).with_app_key("crm");
        let back = BizContext::from_metadata(&ctx.to_metadata());
        assert_eq!(back.tid(), 3);
        assert_eq!(back.uid(), 9);
        assert_eq!(back.app_key(), "crm");
        assert_eq!(back.trace_id(), ctx.trace_id());
    }

    #[test]
    fn clones_share_transactor() {
        let ctx = BizContext::new();
        let nested = ctx.clone();
        nested.transactor().add_ref(Arc::new(1u8));
        assert_eq!(ctx.transactor().count(), 1);
    }
}
