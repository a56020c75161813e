//! Backlog item store.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use cadre_store_core::{KeySpace, KvWrite, Substrate};
use cadre_types::{BacklogItem, ItemStatus};

use crate::StateError;

//─────────────────────────────
//  Store
//─────────────────────────────

/// Persists backlog items keyed by `(project_id, item_id)`.
///
/// Invariant: an item is a member of its project's all-items index and of
/// exactly one per-status index at a time; the project is in the registry
/// iff at least one of its items exists. Re-indexing happens inside a single
/// substrate batch.
#[derive(Clone)]
pub struct BacklogStore {
    substrate: Arc<dyn Substrate>,
    keys: KeySpace,
}

impl BacklogStore {
    /// Create a store over `substrate` with the given key space.
    pub fn new(substrate: Arc<dyn Substrate>, keys: KeySpace) -> Self {
        Self { substrate, keys }
    }

    /// Upsert `item`, moving it between status indices when its status
    /// changed and registering its project.
    pub async fn put_item(&self, item: &BacklogItem) -> Result<(), StateError> {
        let doc_key = self.keys.backlog_item(&item.project_id, &item.item_id);
        let previous = self.load(&doc_key).await?;

        let doc = serde_json::to_string(item).map_err(|e| StateError::Corrupt {
            kind: "backlog item",
            key: doc_key.clone(),
            message: e.to_string(),
        })?;

        let mut batch = vec![
            KvWrite::Set {
                key: doc_key,
                value: doc,
            },
            KvWrite::SetAdd {
                key: self.keys.backlog_index(&item.project_id),
                member: item.item_id.clone(),
            },
            KvWrite::SetAdd {
                key: self
                    .keys
                    .backlog_status(&item.project_id, &item.status.to_string()),
                member: item.item_id.clone(),
            },
            KvWrite::SetAdd {
                key: self.keys.project_registry(),
                member: item.project_id.clone(),
            },
        ];
        if let Some(previous) = previous {
            if previous.status != item.status {
                batch.push(KvWrite::SetRemove {
                    key: self
                        .keys
                        .backlog_status(&item.project_id, &previous.status.to_string()),
                    member: item.item_id.clone(),
                });
            }
        }

        self.substrate.run_batch(batch).await?;
        debug!(
            project_id = %item.project_id,
            item_id = %item.item_id,
            status = %item.status,
            "backlog item stored"
        );
        Ok(())
    }

    /// Change the status of an existing item and reindex it.
    ///
    /// The caller is responsible for checking the transition against the
    /// state machine first; this operation is mechanical.
    pub async fn set_status(
        &self,
        project_id: &str,
        item_id: &str,
        new_status: ItemStatus,
    ) -> Result<BacklogItem, StateError> {
        let mut item = self.require(project_id, item_id).await?;
        item.status = new_status;
        item.updated_at = Utc::now();
        self.put_item(&item).await?;
        Ok(item)
    }

    /// Read an item, if present.
    pub async fn get_item(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> Result<Option<BacklogItem>, StateError> {
        self.load(&self.keys.backlog_item(project_id, item_id)).await
    }

    /// Read an item, erroring when absent.
    pub async fn require(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> Result<BacklogItem, StateError> {
        self.get_item(project_id, item_id)
            .await?
            .ok_or_else(|| StateError::NotFound {
                kind: "backlog item",
                project_id: project_id.to_string(),
                id: item_id.to_string(),
            })
    }

    /// All item ids of a project, sorted.
    pub async fn list_item_ids(&self, project_id: &str) -> Result<Vec<String>, StateError> {
        let mut ids = self
            .substrate
            .set_members(&self.keys.backlog_index(project_id))
            .await?;
        ids.sort();
        Ok(ids)
    }

    /// Item ids of a project in one status, sorted.
    pub async fn list_item_ids_by_status(
        &self,
        project_id: &str,
        status: ItemStatus,
    ) -> Result<Vec<String>, StateError> {
        let mut ids = self
            .substrate
            .set_members(&self.keys.backlog_status(project_id, &status.to_string()))
            .await?;
        ids.sort();
        Ok(ids)
    }

    /// All registered project ids, sorted.
    pub async fn list_project_ids(&self) -> Result<Vec<String>, StateError> {
        let mut ids = self
            .substrate
            .set_members(&self.keys.project_registry())
            .await?;
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, key: &str) -> Result<Option<BacklogItem>, StateError> {
        match self.substrate.get(key).await? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StateError::Corrupt {
                    kind: "backlog item",
                    key: key.to_string(),
                    message: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_store_memory::MemorySubstrate;
    use cadre_types::ItemType;

    fn store() -> (BacklogStore, Arc<MemorySubstrate>) {
        let substrate = Arc::new(MemorySubstrate::new());
        (
            BacklogStore::new(substrate.clone(), KeySpace::default()),
            substrate,
        )
    }

    #[tokio::test]
    async fn put_indexes_item_and_project() {
        let (store, _) = store();
        let item = BacklogItem::new("P1", "B1", ItemType::GenericTask, ItemStatus::Ready);
        store.put_item(&item).await.unwrap();

        assert_eq!(store.list_project_ids().await.unwrap(), vec!["P1"]);
        assert_eq!(store.list_item_ids("P1").await.unwrap(), vec!["B1"]);
        assert_eq!(
            store
                .list_item_ids_by_status("P1", ItemStatus::Ready)
                .await
                .unwrap(),
            vec!["B1"]
        );
        assert_eq!(
            store.get_item("P1", "B1").await.unwrap().unwrap().status,
            ItemStatus::Ready
        );
    }

    #[tokio::test]
    async fn status_change_moves_exactly_one_index() {
        let (store, _) = store();
        let item = BacklogItem::new("P1", "B1", ItemType::GenericTask, ItemStatus::Ready);
        store.put_item(&item).await.unwrap();

        store
            .set_status("P1", "B1", ItemStatus::InProgress)
            .await
            .unwrap();

        for status in ItemStatus::all() {
            let ids = store.list_item_ids_by_status("P1", *status).await.unwrap();
            if *status == ItemStatus::InProgress {
                assert_eq!(ids, vec!["B1"]);
            } else {
                assert!(ids.is_empty(), "stale index for {status}");
            }
        }
        // Still in the all-items index and registry.
        assert_eq!(store.list_item_ids("P1").await.unwrap(), vec!["B1"]);
        assert_eq!(store.list_project_ids().await.unwrap(), vec!["P1"]);
    }

    #[tokio::test]
    async fn set_status_on_missing_item_is_not_found() {
        let (store, _) = store();
        let err = store
            .set_status("P1", "ghost", ItemStatus::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn listings_are_sorted() {
        let (store, _) = store();
        for id in ["B3", "B1", "B2"] {
            let item = BacklogItem::new("P1", id, ItemType::GenericTask, ItemStatus::Ready);
            store.put_item(&item).await.unwrap();
        }
        assert_eq!(store.list_item_ids("P1").await.unwrap(), vec!["B1", "B2", "B3"]);
        assert_eq!(
            store
                .list_item_ids_by_status("P1", ItemStatus::Ready)
                .await
                .unwrap(),
            vec!["B1", "B2", "B3"]
        );
    }
}
