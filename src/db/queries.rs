use std::str::FromStr;

use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::models::work_item::{NewWorkItem, WorkItem, WorkItemStatus};

fn map_row(row: &sqlx::postgres::PgRow) -> Result<WorkItem, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = WorkItemStatus::from_str(&status_str).map_err(|_| {
        sqlx::Error::Decode(format!("unknown work item status `{status_str}`").into())
    })?;

    Ok(WorkItem {
        id: row.try_get("id")?,
        image_key: row.try_get("image_key")?,
        zone: row.try_get("zone")?,
        comment: row.try_get("comment")?,
        owner_label: row.try_get("owner_label")?,
        group_label: row.try_get("group_label")?,
        status,
        result: row.try_get("result")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const WORK_ITEM_COLUMNS: &str =
    "id, image_key, zone, comment, owner_label, group_label, status, result, \
     created_at, updated_at";

/// Insert a whole upload batch in one statement. Returns the new ids.
pub async fn insert_work_items(
    pool: &PgPool,
    items: &[NewWorkItem],
) -> Result<Vec<Uuid>, sqlx::Error> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO work_items (image_key, zone, comment, owner_label, group_label, status) ",
    );
    builder.push_values(items, |mut b, item| {
        b.push_bind(&item.image_key)
            .push_bind(&item.zone)
            .push_bind(&item.comment)
            .push_bind(&item.owner_label)
            .push_bind(&item.group_label)
            .push_bind("pending");
    });
    builder.push(" RETURNING id");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(|r| r.try_get("id")).collect()
}

/// Get a work item by id.
pub async fn get_work_item(pool: &PgPool, id: Uuid) -> Result<Option<WorkItem>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(map_row).transpose()
}

/// Select up to `limit` pending items, oldest first, for the claim step.
pub async fn get_pending_items(pool: &PgPool, limit: i64) -> Result<Vec<WorkItem>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {WORK_ITEM_COLUMNS}
        FROM work_items
        WHERE status = 'pending'
        ORDER BY created_at ASC
        LIMIT $1
        "#
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(map_row).collect()
}

/// Exclusive claim: flip pending → processing in a single conditional
/// update. Returns `true` iff this caller won the claim; `false` means a
/// concurrent invocation got there first and the item must be skipped.
///
/// This is the only cross-process synchronization primitive in the pipeline.
pub async fn claim_work_item(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE work_items
        SET status = 'processing', updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Write a terminal status (done/error) and its result text.
pub async fn finish_work_item(
    pool: &PgPool,
    id: Uuid,
    status: WorkItemStatus,
    result: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE work_items
        SET status = $1, result = $2, updated_at = NOW()
        WHERE id = $3
        "#,
    )
    .bind(status.to_string())
    .bind(result)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Operator retry: reset an item back to pending with no result. Matches
/// `error` and also `processing`, so items stranded mid-flight by a crashed
/// invocation can be recovered. Conditional on the current status so a
/// double click cannot reset an item that already finished or re-queued.
pub async fn reset_for_retry(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE work_items
        SET status = 'pending', result = NULL, updated_at = NOW()
        WHERE id = $1 AND status IN ('error', 'processing')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Current pending backlog, for the gauge and health reporting.
pub async fn count_pending(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM work_items WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    row.try_get("n")
}
