//! Change feed handler - serves records written since a cursor.

use crate::db;
use crate::error::{AppError, Result};
use custody_engine::PullResponse;
use serde::Deserialize;
use sqlx::PgPool;

/// How far the returned cursor trails the server clock. A write stamped
/// before the cursor may still be uncommitted, and so invisible to this
/// pull, for at most one statement timeout.
pub const FEED_LAG_MS: i64 = 2 * db::STATEMENT_TIMEOUT_MS;

/// Query parameters for the change feed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
    /// `serverTime` of the previous pull; omitted for a full fetch
    pub since: Option<u64>,
}

/// Records changed at or after `since`.
///
/// The server time is read before the query and handed back lagged by
/// [`FEED_LAG_MS`], so a write still in flight while this pull runs is
/// served again by the next one instead of being hidden behind the cursor.
/// Re-delivered records are no-ops for the client.
pub async fn handle_changes(pool: &PgPool, query: ChangesQuery) -> Result<PullResponse> {
    let since = query
        .since
        .map(i64::try_from)
        .transpose()
        .map_err(|_| AppError::BadRequest("since out of range".to_string()))?;

    let read_at = db::server_time(pool).await?;
    let rows = db::changes_since(pool, since).await?;
    let server_time = feed_cursor(read_at)?;

    tracing::debug!(since = ?query.since, count = rows.len(), server_time, "serving changes");

    Ok(PullResponse {
        records: rows.iter().map(db::StoredRecord::to_record).collect(),
        server_time,
    })
}

/// Cursor to hand out for a feed read at `read_at`.
pub fn feed_cursor(read_at: i64) -> Result<u64> {
    if read_at < 0 {
        return Err(AppError::Internal(format!(
            "server clock before epoch: {read_at}"
        )));
    }
    Ok(u64::try_from(read_at.saturating_sub(FEED_LAG_MS).max(0)).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_trails_the_oldest_uncommitted_write() {
        let read_at = 1_706_745_600_000;
        // a write stamped one statement timeout before the read may commit
        // only after the query ran
        let slowest_write = read_at - db::STATEMENT_TIMEOUT_MS;

        let cursor = feed_cursor(read_at).unwrap();
        assert!(slowest_write >= i64::try_from(cursor).unwrap());
    }

    #[test]
    fn cursor_never_goes_below_zero() {
        assert_eq!(feed_cursor(1_000).unwrap(), 0);
        assert!(matches!(feed_cursor(-1), Err(AppError::Internal(_))));
    }
}
