//! The CRDT document contract a `Room` relies on.
//!
//! `yrs` is treated as the external collaborative-editing library: the core
//! only reaches for named shared containers, full-state/update encoding,
//! apply-with-origin, and an update observer. Nothing in this module
//! interprets document *content* beyond what the persistence gateway needs
//! for tree-walk and tombstone bookkeeping (`persistence::tree`).

mod origin;
pub mod presence;

pub use origin::{ConnOrigin, SYSTEM_ORIGIN};
pub use presence::{Presence, PresenceChange};

use yrs::types::text::TextPrelim;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, Map, MapRef, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, TransactionMut,
    Update, Value,
};

/// Names of the shared containers the contract hangs application data off of.
pub mod containers {
    pub const FILES: &str = "editor:files";
    pub const FILE_TREE_NODES: &str = "file-tree:nodes";
    pub const FILE_TREE_ROOTS: &str = "file-tree:roots";
    pub const SUGGESTIONS: &str = "editor:suggestions";
    pub const COMMENTS: &str = "editor:comments";
    pub const CONTRIB_CHARS: &str = "editor:contrib:chars";
}

/// Wraps a `yrs::Doc` with the accessors the collaboration core needs.
///
/// Cloning is cheap: `yrs::Doc` is itself a reference-counted handle, so a
/// `CrdtDoc` can be freely shared across the tasks that make up a `Room`
/// without an extra `Arc`.
#[derive(Clone)]
pub struct CrdtDoc {
    doc: Doc,
}

impl CrdtDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// `editor:files` — file-id -> shared text.
    pub fn files(&self) -> MapRef {
        self.doc.get_or_insert_map(containers::FILES)
    }

    /// Fetch (or lazily create) the shared text for one file-id inside the
    /// `editor:files` map. Each file's content is its own nested CRDT text
    /// branch, merged independently of its siblings.
    pub fn file_text(
        &self,
        files: &MapRef,
        file_id: &str,
        txn: &mut TransactionMut,
    ) -> TextRef {
        match files.get(txn, file_id) {
            Some(Value::YText(text)) => text,
            _ => files.insert(txn, file_id.to_string(), TextPrelim::new("")),
        }
    }

    /// `file-tree:nodes` — node-id -> node map.
    pub fn file_tree_nodes(&self) -> MapRef {
        self.doc.get_or_insert_map(containers::FILE_TREE_NODES)
    }

    /// `file-tree:roots` — array of root node-ids.
    pub fn file_tree_roots(&self) -> yrs::ArrayRef {
        self.doc.get_or_insert_array(containers::FILE_TREE_ROOTS)
    }

    /// `editor:suggestions` — suggestion-id -> suggestion map.
    pub fn suggestions(&self) -> MapRef {
        self.doc.get_or_insert_map(containers::SUGGESTIONS)
    }

    /// `editor:comments` — comment-id -> comment map.
    pub fn comments(&self) -> MapRef {
        self.doc.get_or_insert_map(containers::COMMENTS)
    }

    /// `editor:contrib:chars` — userId -> character-typed counter.
    pub fn contrib_chars(&self) -> MapRef {
        self.doc.get_or_insert_map(containers::CONTRIB_CHARS)
    }

    /// Full-state encode (sent as the initial SYNC frame on connect).
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply a remote update, tagging the transaction with `origin` so the
    /// doc's update observer can skip re-broadcasting to the socket that
    /// sent it.
    pub fn apply_update_with_origin(
        &self,
        bytes: &[u8],
        origin: ConnOrigin,
    ) -> Result<(), yrs::error::Error> {
        let update = Update::decode_v1(bytes)?;
        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(update)?;
        Ok(())
    }

    /// Register the doc-wide update observer. The callback receives the
    /// encoded update and the origin that produced it (`None` for updates
    /// the core makes directly, e.g. suggestion approval).
    pub fn observe_update<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(Option<ConnOrigin>, Vec<u8>) + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().and_then(ConnOrigin::from_origin_ref);
                callback(origin, event.update.to_owned());
            })
            .expect("doc update observer registration")
    }

    /// Run a closure inside a single write transaction tagged with `origin`.
    /// Used by the REST surface (suggestion approval, tree rewrites) so a
    /// multi-field mutation is one atomic update for observers.
    pub fn with_transaction<R>(
        &self,
        origin: ConnOrigin,
        f: impl FnOnce(&mut TransactionMut) -> R,
    ) -> R {
        let mut txn = self.doc.transact_mut_with(origin);
        f(&mut txn)
    }

    pub fn read(&self) -> impl ReadTxn + '_ {
        self.doc.transact()
    }

    pub fn get_text(&self, text: &TextRef, txn: &impl ReadTxn) -> String {
        text.get_string(txn)
    }
}

impl Default for CrdtDoc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_update_round_trips_between_two_docs() {
        let a = CrdtDoc::new();
        {
            let files = a.files();
            let mut txn = a.doc.transact_mut();
            let text = a.file_text(&files, "f1", &mut txn);
            text.push(&mut txn, "hello");
        }
        let update = a.encode_state_as_update();

        let b = CrdtDoc::new();
        b.apply_update_with_origin(&update, ConnOrigin::new(1))
            .unwrap();

        let mut txn = b.doc.transact_mut();
        let files = b.files();
        let text = b.file_text(&files, "f1", &mut txn);
        assert_eq!(text.get_string(&txn), "hello");
    }

    #[test]
    fn observer_reports_non_origin_updates() {
        let doc = CrdtDoc::new();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = doc.observe_update(move |origin, _bytes| {
            seen2.lock().unwrap().push(origin);
        });

        doc.with_transaction(ConnOrigin::new(42), |txn| {
            let files = doc.files();
            let text = doc.file_text(&files, "f1", txn);
            text.push(txn, "hi");
        });

        let captured = seen.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0], Some(ConnOrigin::new(42)));
    }
}
