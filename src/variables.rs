//! Per-transaction variable store.
//!
//! Rules read from the store; write-actions append into the `Tx` collection.
//! Collections are backed by ordered maps so that enumeration order is stable
//! across runs on identical input, which rule evaluation depends on for
//! reproducible decisions.

use std::collections::BTreeMap;

/// The named collections a variable can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// Connection metadata (addresses and ports).
    Connection,
    /// URI, method, protocol version and query arguments.
    Uri,
    /// Request headers, keyed by lowercased header name.
    RequestHeaders,
    /// Variables extracted from the request body.
    RequestBody,
    /// Response headers, keyed by lowercased header name.
    ResponseHeaders,
    /// Variables extracted from the response body.
    ResponseBody,
    /// Transaction-local variables written by rule actions.
    Tx,
}

impl Collection {
    /// Stable name used in diagnostics and audit output.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Uri => "uri",
            Self::RequestHeaders => "request_headers",
            Self::RequestBody => "request_body",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
            Self::Tx => "tx",
        }
    }
}

/// Key/value store scoped to one transaction.
///
/// A key maps to one or more string values; repeated appends to the same key
/// accumulate. Enumeration within a collection is ordered by key, values in
/// insertion order.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    collections: BTreeMap<Collection, BTreeMap<String, Vec<String>>>,
}

impl VariableStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`, keeping any existing values.
    pub fn append(
        &mut self,
        collection: Collection,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.collections
            .entry(collection)
            .or_default()
            .entry(key.into())
            .or_default()
            .push(value.into());
    }

    /// Replace all values under `key` with a single value.
    pub fn set(
        &mut self,
        collection: Collection,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.collections
            .entry(collection)
            .or_default()
            .insert(key.into(), vec![value.into()]);
    }

    /// Get all values for a key.
    #[must_use]
    pub fn get(&self, collection: Collection, key: &str) -> Option<&[String]> {
        self.collections
            .get(&collection)
            .and_then(|c| c.get(key))
            .map(Vec::as_slice)
    }

    /// Get the first value for a key.
    #[must_use]
    pub fn first(&self, collection: Collection, key: &str) -> Option<&str> {
        self.get(collection, key)
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// Iterate `(key, value)` pairs of one collection in stable order.
    pub fn iter_collection(
        &self,
        collection: Collection,
    ) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.collections
            .get(&collection)
            .into_iter()
            .flat_map(|c| {
                c.iter()
                    .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
            })
    }

    /// Number of keys in a collection.
    #[must_use]
    pub fn len(&self, collection: Collection) -> usize {
        self.collections.get(&collection).map_or(0, BTreeMap::len)
    }

    /// Check if a collection holds no variables.
    #[must_use]
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    /// Drop all variables in all collections.
    pub fn clear(&mut self) {
        self.collections.clear();
    }
}
