use std::collections::HashSet;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::{
    CacheEntry, CacheIndex, ContentUnitId, EntryId, IndexError, RequestIdentity, SiteId,
};

use super::{PostgresCacheIndex, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: i64,
    uid: Uuid,
    uri: String,
    site_id: i32,
    created_at: OffsetDateTime,
}

impl From<EntryRow> for CacheEntry {
    fn from(row: EntryRow) -> Self {
        Self {
            id: EntryId(row.id),
            uid: row.uid,
            identity: RequestIdentity::new(row.uri, SiteId(row.site_id)),
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl CacheIndex for PostgresCacheIndex {
    async fn find_entry(
        &self,
        identity: &RequestIdentity,
    ) -> Result<Option<CacheEntry>, IndexError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT id, uid, uri, site_id, created_at
            FROM page_cache_entries
            WHERE uri = $1 AND site_id = $2
            "#,
        )
        .bind(&identity.uri)
        .bind(identity.site_id.0)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CacheEntry::from))
    }

    async fn create_entry(
        &self,
        identity: &RequestIdentity,
        depends_on: &HashSet<ContentUnitId>,
    ) -> Result<CacheEntry, IndexError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        // Upsert keeps one row per identity under concurrent writers; the
        // uid is always fresh so a replaced body is never served again.
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            INSERT INTO page_cache_entries (uid, uri, site_id, created_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (uri, site_id)
            DO UPDATE SET uid = EXCLUDED.uid, created_at = EXCLUDED.created_at
            RETURNING id, uid, uri, site_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&identity.uri)
        .bind(identity.site_id.0)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM page_cache_dependencies WHERE entry_id = $1")
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if !depends_on.is_empty() {
            let units: Vec<String> = depends_on
                .iter()
                .map(|unit| unit.as_str().to_string())
                .collect();
            sqlx::query(
                r#"
                INSERT INTO page_cache_dependencies (entry_id, content_unit_id)
                SELECT $1, unit FROM UNNEST($2::text[]) AS unit
                "#,
            )
            .bind(row.id)
            .bind(&units)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CacheEntry::from(row))
    }

    async fn entries_depending_on(
        &self,
        unit: &ContentUnitId,
    ) -> Result<Vec<CacheEntry>, IndexError> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT e.id, e.uid, e.uri, e.site_id, e.created_at
            FROM page_cache_entries e
            INNER JOIN page_cache_dependencies d ON d.entry_id = e.id
            WHERE d.content_unit_id = $1
            ORDER BY e.id
            "#,
        )
        .bind(unit.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(CacheEntry::from).collect())
    }

    async fn delete_entries(&self, ids: &HashSet<EntryId>) -> Result<(), IndexError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();

        sqlx::query("DELETE FROM page_cache_entries WHERE id = ANY($1)")
            .bind(&ids)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn clear_all(&self) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM page_cache_entries")
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn entry_uids(&self) -> Result<HashSet<Uuid>, IndexError> {
        let uids: Vec<Uuid> = sqlx::query_scalar("SELECT uid FROM page_cache_entries")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        Ok(uids.into_iter().collect())
    }

    async fn entry_count(&self) -> Result<u64, IndexError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM page_cache_entries")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        count
            .try_into()
            .map_err(|_| IndexError::from_persistence("count exceeds supported range"))
    }
}
