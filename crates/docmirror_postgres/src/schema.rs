//! Table and trigger definitions, and catalog lookups.

use postgres::{Client, Error};

/// Channel on which commits to `object_state` are announced.
pub const NOTIFY_CHANNEL: &str = "newt_object_state_changed";

/// Name of the trigger that announces commits.
pub const NOTIFY_TRIGGER: &str = "newt_trigger_notify_object_state_changed";

/// Installs [`NOTIFY_TRIGGER`]. The payload is the committing tid.
pub const NOTIFY_TRIGGER_DDL: &str = "
create function newt_notify_object_state_changed() returns trigger
as $$
begin
  perform pg_notify('newt_object_state_changed', NEW.tid::text);
  return NEW;
end;
$$ language plpgsql;

create trigger newt_trigger_notify_object_state_changed
  after insert or update on object_state for each row
  execute procedure newt_notify_object_state_changed();
";

/// The destination document table.
pub const DOCUMENT_TABLE: &str = "newt";

/// Creates [`DOCUMENT_TABLE`] with a GIN index on `state`.
pub const DOCUMENT_TABLE_DDL: &str = "
create table newt (
  zoid         bigint primary key,
  class_name   text,
  ghost_pickle bytea,
  state        jsonb);
create index newt_json_idx on newt using gin (state);
";

/// The checkpoint table.
pub const CHECKPOINT_TABLE: &str = "newt_follow_progress";

/// Creates [`CHECKPOINT_TABLE`].
pub const CHECKPOINT_TABLE_DDL: &str = "create table newt_follow_progress (id text primary key, tid bigint)";

/// Synchronous delete trigger from the older schema. It removes documents
/// inside the source transaction and conflicts with the updater.
pub const LEGACY_TRIGGER: &str = "newt_delete_on_state_delete_trigger";

/// Drops [`LEGACY_TRIGGER`] and its function.
pub const LEGACY_TRIGGER_DROP: &str = "
drop trigger newt_delete_on_state_delete_trigger on object_state;
drop function if exists newt_delete_on_state_delete();
";

/// Returns true if `table` exists in the current schema.
pub fn table_exists(client: &mut Client, table: &str) -> Result<bool, Error> {
    let row = client.query_one(
        "select exists(select 1 from information_schema.tables \
         where table_schema = current_schema() and table_name = $1)",
        &[&table],
    )?;
    Ok(row.get(0))
}

/// Returns true if a trigger named `trigger` exists.
pub fn trigger_exists(client: &mut Client, trigger: &str) -> Result<bool, Error> {
    let row = client.query_one(
        "select exists(select 1 from pg_catalog.pg_trigger where tgname = $1)",
        &[&trigger],
    )?;
    Ok(row.get(0))
}

/// Returns true if the source keeps full history, detected by the
/// presence of the `current_object` table.
pub fn keeps_history(client: &mut Client) -> Result<bool, Error> {
    let row = client.query_one(
        "select exists(select 1 from pg_catalog.pg_class where relname = 'current_object')",
        &[],
    )?;
    Ok(row.get(0))
}
