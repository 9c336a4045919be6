//! The `newt` table as a [`DocumentStore`].

use crate::schema::{
    self, CHECKPOINT_TABLE, CHECKPOINT_TABLE_DDL, DOCUMENT_TABLE, DOCUMENT_TABLE_DDL, LEGACY_TRIGGER,
    LEGACY_TRIGGER_DROP,
};
use crate::source::{from_zoid, to_zoid};
use docmirror_feed::Tid;
use docmirror_sink::{Document, DocumentStore, SinkError, SinkResult};
use postgres::{Client, NoTls};
use tracing::debug;

const INSERT_DOCUMENT: &str = "
insert into newt (zoid, class_name, ghost_pickle, state)
values ($1, $2, $3, $4::text::jsonb)";

/// Writes documents and checkpoints over one connection.
///
/// The first write after a commit or rollback opens a transaction.
pub struct PgStore {
    client: Client,
    in_transaction: bool,
}

impl PgStore {
    /// Connects to `dsn`.
    pub fn connect(dsn: &str) -> SinkResult<Self> {
        let client = Client::connect(dsn, NoTls).map_err(store_error)?;
        Ok(Self::new(client))
    }

    /// Wraps an open connection.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            in_transaction: false,
        }
    }

    /// The underlying connection.
    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    fn begin(&mut self) -> SinkResult<&mut Client> {
        if !self.in_transaction {
            self.client.batch_execute("begin").map_err(store_error)?;
            self.in_transaction = true;
        }
        Ok(&mut self.client)
    }
}

impl DocumentStore for PgStore {
    fn checkpoint_table_exists(&mut self) -> SinkResult<bool> {
        let client = self.begin()?;
        schema::table_exists(client, CHECKPOINT_TABLE).map_err(store_error)
    }

    fn create_checkpoint_table(&mut self) -> SinkResult<()> {
        self.begin()?.batch_execute(CHECKPOINT_TABLE_DDL).map_err(store_error)
    }

    fn load_checkpoint(&mut self, client_id: &str) -> SinkResult<Option<Tid>> {
        if !self.checkpoint_table_exists()? {
            return Ok(None);
        }
        let row = self
            .begin()?
            .query_opt("select tid from newt_follow_progress where id = $1", &[&client_id])
            .map_err(store_error)?;
        Ok(row.map(|row| row.get(0)))
    }

    fn save_checkpoint(&mut self, client_id: &str, tid: Tid) -> SinkResult<()> {
        if !self.checkpoint_table_exists()? {
            self.create_checkpoint_table()?;
        }
        let client = self.begin()?;
        client
            .execute("delete from newt_follow_progress where id = $1", &[&client_id])
            .map_err(store_error)?;
        client
            .execute(
                "insert into newt_follow_progress (id, tid) values ($1, $2)",
                &[&client_id, &tid],
            )
            .map_err(store_error)?;
        Ok(())
    }

    fn table_exists(&mut self) -> SinkResult<bool> {
        let client = self.begin()?;
        schema::table_exists(client, DOCUMENT_TABLE).map_err(store_error)
    }

    fn create_table(&mut self) -> SinkResult<()> {
        self.begin()?.batch_execute(DOCUMENT_TABLE_DDL).map_err(store_error)
    }

    fn legacy_trigger_present(&mut self) -> SinkResult<bool> {
        let client = self.begin()?;
        schema::trigger_exists(client, LEGACY_TRIGGER).map_err(store_error)
    }

    fn remove_legacy_trigger(&mut self) -> SinkResult<()> {
        self.begin()?.batch_execute(LEGACY_TRIGGER_DROP).map_err(store_error)
    }

    fn replace_documents(&mut self, documents: &[Document]) -> SinkResult<()> {
        let client = self.begin()?;
        let zoids: Vec<i64> = documents.iter().map(|d| to_zoid(d.object_id)).collect();
        client
            .execute("delete from newt where zoid = any($1)", &[&zoids])
            .map_err(store_error)?;
        let insert = client.prepare(INSERT_DOCUMENT).map_err(store_error)?;
        for (document, zoid) in documents.iter().zip(&zoids) {
            client
                .execute(
                    &insert,
                    &[zoid, &document.class_name, &document.header_bytes, &document.state_json],
                )
                .map_err(store_error)?;
        }
        debug!(count = documents.len(), "documents replaced");
        Ok(())
    }

    fn document_ids(&mut self) -> SinkResult<Vec<u64>> {
        let rows = self
            .begin()?
            .query("select zoid from newt", &[])
            .map_err(store_error)?;
        Ok(rows.iter().map(|row| from_zoid(row.get(0))).collect())
    }

    fn delete_documents(&mut self, object_ids: &[u64]) -> SinkResult<()> {
        let zoids: Vec<i64> = object_ids.iter().copied().map(to_zoid).collect();
        self.begin()?
            .execute("delete from newt where zoid = any($1)", &[&zoids])
            .map_err(store_error)?;
        Ok(())
    }

    fn commit(&mut self) -> SinkResult<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client.batch_execute("commit").map_err(store_error)?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> SinkResult<()> {
        if self.in_transaction {
            self.in_transaction = false;
            self.client.batch_execute("rollback").map_err(store_error)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

fn store_error(err: postgres::Error) -> SinkError {
    SinkError::store(err.to_string())
}
