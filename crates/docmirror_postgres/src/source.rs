//! The `object_state` table as a [`SourceLog`].

use crate::schema;
use docmirror_feed::{FeedError, FeedResult, LogPosition, Record, SourceLog, Tid};
use postgres::{Client, NoTls, Row};
use std::collections::HashSet;
use tracing::debug;

const PAGE_QUERY: &str = "
select s.tid, s.zoid, s.state from object_state s
where (s.tid > $1 or (s.tid = $1 and s.zoid > $2)) and s.tid <= $3
order by s.tid, s.zoid
limit $4";

/// Reads object revisions from a RelStorage-style `object_state` table.
///
/// In keep-history mode only current revisions are read, by joining with
/// `current_object`.
pub struct PgSource {
    client: Client,
    keep_history: bool,
    page_query: String,
}

impl PgSource {
    /// Connects to `dsn` and inspects the schema.
    pub fn connect(dsn: &str) -> FeedResult<Self> {
        let client = Client::connect(dsn, NoTls).map_err(query_error)?;
        Self::new(client)
    }

    /// Wraps an open connection.
    pub fn new(mut client: Client) -> FeedResult<Self> {
        let keep_history = schema::keeps_history(&mut client).map_err(query_error)?;
        let page_query = if keep_history {
            PAGE_QUERY.replace("object_state s", "object_state s natural join current_object")
        } else {
            PAGE_QUERY.to_string()
        };
        debug!(keep_history, "source schema inspected");
        Ok(Self {
            client,
            keep_history,
            page_query,
        })
    }

    /// Returns true if the source keeps full history.
    pub fn keeps_history(&self) -> bool {
        self.keep_history
    }

    /// The underlying connection.
    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl SourceLog for PgSource {
    fn fetch_page(&mut self, after: LogPosition, through: Tid, limit: usize) -> FeedResult<Vec<Record>> {
        // Past every object of `after.tid` unless it was read partway.
        let after_zoid = match after.object_id {
            Some(oid) => to_zoid(oid),
            None => i64::MAX,
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(self.page_query.as_str(), &[&after.tid, &after_zoid, &through, &limit])
            .map_err(|err| FeedError::source(after.tid, err.to_string()))?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    fn max_tid(&mut self) -> FeedResult<Option<Tid>> {
        let row = self
            .client
            .query_one("select max(tid) from object_state", &[])
            .map_err(query_error)?;
        Ok(row.get(0))
    }

    fn live_object_ids(&mut self, object_ids: &[u64]) -> FeedResult<HashSet<u64>> {
        let zoids: Vec<i64> = object_ids.iter().copied().map(to_zoid).collect();
        let table = if self.keep_history {
            "current_object"
        } else {
            "object_state"
        };
        let sql = format!("select zoid from {table} where zoid = any($1)");
        let rows = self.client.query(sql.as_str(), &[&zoids]).map_err(query_error)?;
        Ok(rows.iter().map(|row| from_zoid(row.get(0))).collect())
    }
}

impl std::fmt::Debug for PgSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSource")
            .field("keep_history", &self.keep_history)
            .finish_non_exhaustive()
    }
}

fn row_to_record(row: &Row) -> Record {
    let state: Option<Vec<u8>> = row.get(2);
    Record::new(row.get(0), from_zoid(row.get(1)), state.unwrap_or_default())
}

pub(crate) fn to_zoid(object_id: u64) -> i64 {
    i64::try_from(object_id).unwrap_or(i64::MAX)
}

pub(crate) fn from_zoid(zoid: i64) -> u64 {
    u64::try_from(zoid).unwrap_or_default()
}

fn query_error(err: postgres::Error) -> FeedError {
    FeedError::query(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_query_joins_current_object() {
        let query = PAGE_QUERY.replace("object_state s", "object_state s natural join current_object");
        assert!(query.contains("from object_state s natural join current_object\n"));
        assert!(query.contains("order by s.tid, s.zoid"));
    }

    #[test]
    fn zoids_convert_both_ways() {
        assert_eq!(to_zoid(42), 42);
        assert_eq!(from_zoid(42), 42);
        assert_eq!(to_zoid(u64::MAX), i64::MAX);
        assert_eq!(from_zoid(-1), 0);
    }
}
