// Entity Snapshots - PostgreSQL-backed entity store
//
// Domain entities publish their JSON snapshot into `entity_snapshots`; the
// workflow engine reads guards from it and writes `update_field` actions back.

use async_trait::async_trait;
use chrono::Utc;
use flowdesk_shared::EntityRef;
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::workflows::conditions::resolve_parent_mut;
use crate::workflows::{CollaboratorError, CollaboratorResult, EntityStore};

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Publish the current snapshot of an entity
    pub async fn upsert(&self, entity: &EntityRef, snapshot: &Value) -> CollaboratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_snapshots (entity_type, entity_id, data, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_type, entity_id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(Json(snapshot))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, entity: &EntityRef) -> CollaboratorResult<bool> {
        let result = sqlx::query("DELETE FROM entity_snapshots WHERE entity_type = $1 AND entity_id = $2")
            .bind(&entity.entity_type)
            .bind(&entity.entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Turn `{"client.tier": "gold"}` into `{"client": {"tier": "gold"}}` for a
/// JSONB containment query
fn containment_document(filters: &Map<String, Value>) -> Value {
    let mut document = Map::new();
    for (path, expected) in filters {
        let segments: Vec<&str> = path.split('.').collect();
        insert_nested(&mut document, &segments, expected.clone());
    }
    Value::Object(document)
}

fn insert_nested(map: &mut Map<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [leaf] => {
            map.insert(leaf.to_string(), value);
        }
        [head, rest @ ..] => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(inner) = child {
                insert_nested(inner, rest, value);
            }
        }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn snapshot(&self, entity: &EntityRef) -> CollaboratorResult<Value> {
        let row = sqlx::query("SELECT data FROM entity_snapshots WHERE entity_type = $1 AND entity_id = $2")
            .bind(&entity.entity_type)
            .bind(&entity.entity_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CollaboratorError::NotFound(entity.to_string()))?;

        let data: Json<Value> = row.try_get("data")?;
        Ok(data.0)
    }

    async fn set_field(&self, entity: &EntityRef, path: &str, value: Value) -> CollaboratorResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT data FROM entity_snapshots WHERE entity_type = $1 AND entity_id = $2 FOR UPDATE",
        )
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CollaboratorError::NotFound(entity.to_string()))?;

        let mut data: Json<Value> = row.try_get("data")?;
        let (parent, leaf) = resolve_parent_mut(&mut data.0, path)
            .ok_or_else(|| CollaboratorError::NotFound(format!("{} on {}", path, entity)))?;
        parent.insert(leaf.to_string(), value);

        sqlx::query(
            "UPDATE entity_snapshots SET data = $3, updated_at = $4 WHERE entity_type = $1 AND entity_id = $2",
        )
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .bind(&data)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Set {} on {}", path, entity);
        Ok(())
    }

    async fn exists(&self, entity_type: &str, entity_id: &str) -> CollaboratorResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM entity_snapshots WHERE entity_type = $1 AND entity_id = $2)",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find(&self, entity_type: &str, filters: &Map<String, Value>) -> CollaboratorResult<Vec<EntityRef>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id FROM entity_snapshots
            WHERE entity_type = $1 AND data @> $2
            ORDER BY entity_id
            "#,
        )
        .bind(entity_type)
        .bind(Json(containment_document(filters)))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EntityRef::new(
                    row.try_get::<String, _>("entity_type")?,
                    row.try_get::<String, _>("entity_id")?,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_filters_nest_into_one_document() {
        let filters = json!({"status": "open", "client.tier": "gold", "client.region": "eu"});
        let document = containment_document(filters.as_object().unwrap());
        assert_eq!(
            document,
            json!({"status": "open", "client": {"tier": "gold", "region": "eu"}})
        );
    }

    #[test]
    fn test_deep_paths_share_parents_and_replace_scalars() {
        let filters = json!({"sla": "none", "sla.policy.name": "gold", "sla.policy.hours": 4});
        let document = containment_document(filters.as_object().unwrap());
        assert_eq!(document, json!({"sla": {"policy": {"name": "gold", "hours": 4}}}));
    }

    #[test]
    fn test_no_filters_match_everything() {
        assert_eq!(containment_document(&Map::new()), json!({}));
    }
}
