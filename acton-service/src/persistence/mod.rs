//! Persistence Gateway — load/store a room's CRDT state and
//! permissions against an external document store (MongoDB), with every
//! operation safe to call when no store is configured or reachable.

pub mod tree;

use crate::crdt::{CrdtDoc, SYSTEM_ORIGIN};
use crate::persistence::tree::{build_file_path_from_tree, fallback_path, TreeNode};
use crate::role::Role;
use bson::{doc, Bson, Document};
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::options::UpdateOptions;
use mongodb::{Client, Collection};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::OnceCell;
use yrs::types::map::MapPrelim;
use yrs::{Map, MapRef, ReadTxn, Text, TransactionMut};

/// Gateway to the external document store. All operations degrade to
/// no-ops (and report unavailability) rather than propagating to callers —
/// store failures are a logged, swallowed concern.2/§7.
pub struct PersistenceGateway {
    uri: Option<String>,
    client: OnceCell<Option<Client>>,
}

impl PersistenceGateway {
    pub fn new(mongodb_uri: Option<String>) -> Self {
        Self {
            uri: mongodb_uri,
            client: OnceCell::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Whether a store URI was configured at all. `false` means the
    /// service is running in ephemeral mode — [`Self::ensure_connection`]
    /// will always report unavailable, by design rather than failure.
    pub fn is_configured(&self) -> bool {
        self.uri.is_some()
    }

    /// Establish and cache a single connection. Safe to call repeatedly;
    /// once the store is unreachable or unconfigured, every subsequent call
    /// returns `false` without retrying.
    pub async fn ensure_connection(&self) -> bool {
        let cached = self
            .client
            .get_or_init(|| async {
                let Some(uri) = self.uri.as_ref() else {
                    return None;
                };
                match Client::with_uri_str(uri).await {
                    Ok(client) => Some(client),
                    Err(err) => {
                        tracing::error!(error = %err, "failed to connect to document store");
                        None
                    }
                }
            })
            .await;
        cached.is_some()
    }

    fn database(&self) -> Option<mongodb::Database> {
        self.client
            .get()
            .and_then(|c| c.as_ref())
            .map(|c| c.database("collab"))
    }

    /// Upsert the project record, load its files and suggestions, and
    /// rebuild the doc's shared containers in one transaction. Returns the
    /// persisted permission map (empty if the store is unavailable).
    pub async fn load_project_state(&self, room_id: &str, doc: &CrdtDoc) -> HashMap<String, Role> {
        if !self.ensure_connection().await {
            return HashMap::new();
        }
        let Some(db) = self.database() else {
            return HashMap::new();
        };

        let projects: Collection<Document> = db.collection("projects");
        let now = Bson::String(Utc::now().to_rfc3339());
        let upsert = projects
            .update_one(
                doc! { "_id": room_id },
                doc! {
                    "$setOnInsert": {
                        "_id": room_id,
                        "name": room_id,
                        "createdAt": now.clone(),
                        "permissions": {},
                    },
                    "$set": { "updatedAt": now },
                },
            )
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await;
        if let Err(err) = upsert {
            tracing::error!(error = %err, room_id, "failed to upsert project record");
            return HashMap::new();
        }

        let project = match projects.find_one(doc! { "_id": room_id }).await {
            Ok(project) => project,
            Err(err) => {
                tracing::error!(error = %err, room_id, "failed to load project record");
                return HashMap::new();
            }
        };
        let perms = project.as_ref().map(parse_permissions).unwrap_or_default();

        let files: Collection<Document> = db.collection("files");
        let file_records = fetch_all(&files, doc! { "projectId": room_id }, "files", room_id).await;

        let suggestions: Collection<Document> = db.collection("suggestions");
        let suggestion_records = fetch_all(
            &suggestions,
            doc! { "projectId": room_id },
            "suggestions",
            room_id,
        )
        .await;

        doc.with_transaction(SYSTEM_ORIGIN, |txn| {
            let files_map = doc.files();
            for record in &file_records {
                let Ok(id) = record.get_str("_id") else {
                    continue;
                };
                let content = record.get_str("content").unwrap_or_default();
                let text = doc.file_text(&files_map, id, txn);
                let existing_len = text.len(txn);
                if existing_len > 0 {
                    text.remove_range(txn, 0, existing_len);
                }
                text.insert(txn, 0, content);
            }

            let suggestions_map = doc.suggestions();
            for record in &suggestion_records {
                let Ok(id) = record.get_str("_id") else {
                    continue;
                };
                let nested: MapRef = suggestions_map.insert(txn, id.to_string(), MapPrelim::default());
                populate_suggestion_map(&nested, txn, record);
            }
        });

        perms
    }

    /// Write the doc's current file contents and suggestions back,
    /// upserting by id and deleting store-side records absent from the doc.
    pub async fn persist_project_state(
        &self,
        room_id: &str,
        doc: &CrdtDoc,
    ) -> Result<(), PersistError> {
        if !self.ensure_connection().await {
            return Err(PersistError::Unavailable);
        }
        let Some(db) = self.database() else {
            return Err(PersistError::Unavailable);
        };

        let (file_contents, suggestion_docs, tree_nodes) = {
            let txn = doc.read();
            let files_map = doc.files();
            let mut file_contents = HashMap::new();
            for (id, value) in files_map.iter(&txn) {
                if let yrs::Value::YText(text) = value {
                    file_contents.insert(id.to_string(), text.get_string(&txn));
                }
            }

            let suggestions_map = doc.suggestions();
            let mut suggestion_docs = Vec::new();
            for (id, value) in suggestions_map.iter(&txn) {
                if let yrs::Value::YMap(map) = value {
                    suggestion_docs.push((id.to_string(), suggestion_map_to_bson(&map, &txn)));
                }
            }

            let tree_nodes = read_tree_nodes(&doc.file_tree_nodes(), &txn);
            (file_contents, suggestion_docs, tree_nodes)
        };

        let files: Collection<Document> = db.collection("files");
        for (id, content) in &file_contents {
            let path = build_file_path_from_tree(id, &tree_nodes).unwrap_or_else(|| fallback_path(id));
            let result = files
                .update_one(
                    doc! { "_id": id.as_str() },
                    doc! { "$set": { "projectId": room_id, "path": path, "content": content } },
                )
                .with_options(UpdateOptions::builder().upsert(true).build())
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, room_id, file_id = %id, "failed to persist file");
                return Err(PersistError::Store);
            }
        }
        let keep_file_ids: Vec<&str> = file_contents.keys().map(String::as_str).collect();
        if let Err(err) = files
            .delete_many(doc! { "projectId": room_id, "_id": { "$nin": keep_file_ids } })
            .await
        {
            tracing::error!(error = %err, room_id, "failed to tombstone removed files");
            return Err(PersistError::Store);
        }

        let suggestions: Collection<Document> = db.collection("suggestions");
        for (id, body) in &suggestion_docs {
            let mut set_doc = body.clone();
            set_doc.insert("projectId", room_id);
            let result = suggestions
                .update_one(doc! { "_id": id.as_str() }, doc! { "$set": set_doc })
                .with_options(UpdateOptions::builder().upsert(true).build())
                .await;
            if let Err(err) = result {
                tracing::error!(error = %err, room_id, suggestion_id = %id, "failed to persist suggestion");
                return Err(PersistError::Store);
            }
        }
        let keep_suggestion_ids: Vec<&str> =
            suggestion_docs.iter().map(|(id, _)| id.as_str()).collect();
        if let Err(err) = suggestions
            .delete_many(doc! { "projectId": room_id, "_id": { "$nin": keep_suggestion_ids } })
            .await
        {
            tracing::error!(error = %err, room_id, "failed to tombstone removed suggestions");
            return Err(PersistError::Store);
        }

        Ok(())
    }

    /// Set one entry of the project's permission map.
    pub async fn set_project_permission(
        &self,
        room_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), PersistError> {
        if !self.ensure_connection().await {
            return Err(PersistError::Unavailable);
        }
        let Some(db) = self.database() else {
            return Err(PersistError::Unavailable);
        };
        let projects: Collection<Document> = db.collection("projects");
        let field = format!("permissions.{user_id}");
        let result = projects
            .update_one(
                doc! { "_id": room_id },
                doc! { "$set": { field: role.to_string() } },
            )
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await;
        result.map(|_| ()).map_err(|err| {
            tracing::error!(error = %err, room_id, user_id, "failed to persist permission");
            PersistError::Store
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("document store unavailable")]
    Unavailable,
    #[error("document store operation failed")]
    Store,
}

async fn fetch_all(
    collection: &Collection<Document>,
    filter: Document,
    kind: &str,
    room_id: &str,
) -> Vec<Document> {
    let cursor = match collection.find(filter).await {
        Ok(cursor) => cursor,
        Err(err) => {
            tracing::error!(error = %err, room_id, kind, "failed to query document store");
            return Vec::new();
        }
    };
    match cursor.try_collect().await {
        Ok(records) => records,
        Err(err) => {
            tracing::error!(error = %err, room_id, kind, "failed to read cursor");
            Vec::new()
        }
    }
}

/// Snapshot `file-tree:nodes` into the plain `name`/`parentId` view the
/// tree-walk in `persistence::tree` operates on.
fn read_tree_nodes(nodes: &MapRef, txn: &impl ReadTxn) -> HashMap<String, TreeNode> {
    let mut out = HashMap::new();
    for (id, value) in nodes.iter(txn) {
        let yrs::Value::YMap(node) = value else {
            continue;
        };
        let name = match node.get(txn, "name") {
            Some(yrs::Value::Any(yrs::Any::String(s))) => s.to_string(),
            _ => continue,
        };
        let parent_id = match node.get(txn, "parentId") {
            Some(yrs::Value::Any(yrs::Any::String(s))) => Some(s.to_string()),
            _ => None,
        };
        out.insert(id.to_string(), TreeNode { name, parent_id });
    }
    out
}

fn parse_permissions(project: &Document) -> HashMap<String, Role> {
    let mut perms = HashMap::new();
    if let Ok(map) = project.get_document("permissions") {
        for (user_id, value) in map.iter() {
            if let Some(role_str) = value.as_str() {
                if let Ok(role) = Role::from_str(role_str) {
                    perms.insert(user_id.clone(), role);
                }
            }
        }
    }
    perms
}

fn populate_suggestion_map(nested: &MapRef, txn: &mut TransactionMut, record: &Document) {
    for key in ["fileId", "text", "authorName", "approvedBy", "approvedAt"] {
        if let Ok(value) = record.get_str(key) {
            nested.insert(txn, key, value.to_string());
        }
    }
    // Store schema names the suggestion's author `creatorId`; the CRDT
    // container schema names the same field `authorId`.
    if let Ok(value) = record.get_str("creatorId") {
        nested.insert(txn, "authorId", value.to_string());
    }
    for key in ["startLine", "endLine"] {
        if let Ok(value) = record.get_i32(key) {
            nested.insert(txn, key, value as f64);
        }
    }
    if let Ok(value) = record.get_bool("approved") {
        nested.insert(txn, "approved", value);
    }
    if let Ok(votes) = record.get_document("votes") {
        let votes_map: MapRef = nested.insert(txn, "votes", MapPrelim::default());
        for (user_id, vote) in votes.iter() {
            if let Some(vote) = vote.as_i32() {
                votes_map.insert(txn, user_id.clone(), vote as f64);
            }
        }
    }
}

fn suggestion_map_to_bson(map: &MapRef, txn: &impl ReadTxn) -> Document {
    let mut out = Document::new();
    for (key, value) in map.iter(txn) {
        match (key, value) {
            // CRDT container schema names the author `authorId`; the store
            // schema names the same field `creatorId`.
            ("authorId", yrs::Value::Any(yrs::Any::String(s))) => {
                out.insert("creatorId", s.to_string());
            }
            (_, yrs::Value::Any(yrs::Any::String(s))) => {
                out.insert(key.to_string(), s.to_string());
            }
            (_, yrs::Value::Any(yrs::Any::Number(n))) => {
                out.insert(key.to_string(), n);
            }
            (_, yrs::Value::Any(yrs::Any::Bool(b))) => {
                out.insert(key.to_string(), b);
            }
            ("votes", yrs::Value::YMap(votes)) => {
                let mut votes_doc = Document::new();
                for (user_id, vote) in votes.iter(txn) {
                    if let yrs::Value::Any(yrs::Any::Number(n)) = vote {
                        votes_doc.insert(user_id.to_string(), n as i32);
                    }
                }
                out.insert("votes", votes_doc);
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gateway_never_connects() {
        let gateway = PersistenceGateway::disabled();
        assert!(!gateway.ensure_connection().await);
        let doc = CrdtDoc::new();
        let perms = gateway.load_project_state("room-1", &doc).await;
        assert!(perms.is_empty());
        assert!(matches!(
            gateway.persist_project_state("room-1", &doc).await,
            Err(PersistError::Unavailable)
        ));
    }

    #[test]
    fn suggestion_field_and_votes_round_trip_through_the_store_schema() {
        let doc = CrdtDoc::new();
        let record = doc! {
            "_id": "sugg-1",
            "fileId": "file-1",
            "text": "consider renaming this",
            "creatorId": "user:alice",
            "authorName": "alice",
            "startLine": 10,
            "endLine": 12,
            "votes": { "user:alice": 1, "user:bob": -1 },
        };

        let nested = doc.with_transaction(SYSTEM_ORIGIN, |txn| {
            let suggestions = doc.suggestions();
            let nested: MapRef = suggestions.insert(txn, "sugg-1".to_string(), MapPrelim::default());
            populate_suggestion_map(&nested, txn, &record);
            nested
        });

        let txn = doc.read();
        match nested.get(&txn, "authorId") {
            Some(yrs::Value::Any(yrs::Any::String(s))) => assert_eq!(s.to_string(), "user:alice"),
            other => panic!("expected authorId to be a string, got {other:?}"),
        }
        assert!(nested.get(&txn, "creatorId").is_none());

        let bson = suggestion_map_to_bson(&nested, &txn);
        assert_eq!(bson.get_str("creatorId").unwrap(), "user:alice");
        assert!(bson.get_str("authorId").is_err());
        let votes = bson.get_document("votes").unwrap();
        assert_eq!(votes.get_i32("user:alice").unwrap(), 1);
        assert_eq!(votes.get_i32("user:bob").unwrap(), -1);
    }
}
