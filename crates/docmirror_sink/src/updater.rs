//! Mirrors a source log into a document store.
//!
//! An [`Updater`] reads its checkpoint, prepares the destination schema,
//! optionally collects garbage, then applies feed batches one at a time.
//! Each batch is written in chunks with delete-then-insert and committed
//! together with the new checkpoint, so a crash mid-batch replays the
//! whole batch on restart.

use crate::config::{GcMode, UpdaterConfig};
use crate::error::{SinkError, SinkResult};
use crate::store::{Document, DocumentStore};
use docmirror_codec::{RecordTransform, Transformed};
use docmirror_feed::{Batch, ChangeFeed, FeedConfig, Notifier, Record, SourceLog, StopHandle, Tid, NO_TID};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// Object ids checked against the source per garbage collection query.
const GC_CHUNK: usize = 1_000;

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Checkpoint read at startup.
    pub start_tid: Tid,
    /// Tid of the last record applied, or `start_tid`.
    pub last_tid: Tid,
    /// Committed batches.
    pub batches: usize,
    /// Records read from the feed.
    pub records: usize,
    /// Documents written.
    pub written: usize,
    /// Records that produced no document.
    pub skipped: usize,
    /// Documents removed by garbage collection.
    pub collected: usize,
}

/// Keeps a [`DocumentStore`] in step with a [`SourceLog`].
pub struct Updater<S, D> {
    source: S,
    store: D,
    transform: RecordTransform,
    config: UpdaterConfig,
    notifier: Option<Box<dyn Notifier + Send>>,
    stop: StopHandle,
}

impl<S: SourceLog, D: DocumentStore> Updater<S, D> {
    /// Creates an updater with the default transform.
    ///
    /// Without a notifier the updater stops once it has caught up.
    pub fn new(source: S, store: D, config: UpdaterConfig) -> Self {
        Self {
            source,
            store,
            transform: RecordTransform::new(),
            config,
            notifier: None,
            stop: StopHandle::new(),
        }
    }

    /// Use a custom record transform.
    #[must_use]
    pub fn with_transform(mut self, transform: RecordTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Keep following new commits once caught up.
    #[must_use]
    pub fn with_notifier<N>(mut self, notifier: N) -> Self
    where
        N: Notifier + Send + 'static,
    {
        self.notifier = Some(Box::new(notifier));
        self
    }

    /// Use an existing stop handle.
    #[must_use]
    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// A handle that ends a following run after its current wait.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// The configuration.
    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    /// The document store.
    pub fn store(&self) -> &D {
        &self.store
    }

    /// Mutable access to the document store.
    pub fn store_mut(&mut self) -> &mut D {
        &mut self.store
    }

    /// Mutable access to the source.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Consumes the updater, returning its source and store.
    pub fn into_parts(self) -> (S, D) {
        (self.source, self.store)
    }

    /// Reads the checkpoint and prepares the destination schema.
    ///
    /// Returns the checkpoint, or [`NO_TID`] when there is none.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::ConfigInconsistency`] if the legacy delete
    /// trigger is installed and removing it was not requested.
    pub fn start(&mut self) -> SinkResult<Tid> {
        let result = prepare(&mut self.store, &self.config);
        finish_transaction(&mut self.store, result)
    }

    /// Deletes documents whose objects no longer exist in the source.
    ///
    /// Returns the number of documents removed.
    pub fn collect_garbage(&mut self) -> SinkResult<usize> {
        let result = collect(&mut self.source, &mut self.store);
        finish_transaction(&mut self.store, result)
    }

    /// Runs the updater until the feed drains or is stopped.
    ///
    /// In redo mode records up to the startup checkpoint are reprocessed
    /// and the checkpoint is left alone. With [`GcMode::Only`] the run
    /// stops after collecting garbage.
    ///
    /// # Errors
    ///
    /// Store and source failures end the run after rolling back the
    /// current batch.
    pub fn run(&mut self) -> SinkResult<RunSummary> {
        let checkpoint = self.start()?;
        let mut summary = RunSummary {
            start_tid: checkpoint,
            last_tid: checkpoint,
            ..RunSummary::default()
        };

        let (feed_config, notifier) = if self.config.redo {
            info!(through = checkpoint, "redoing updates");
            let config = self.feed_config(NO_TID).end_tid(Some(checkpoint));
            (config, None)
        } else {
            match self.config.gc {
                GcMode::Skip => {}
                GcMode::OnStart => summary.collected = self.collect_garbage()?,
                GcMode::Only => {
                    summary.collected = self.collect_garbage()?;
                    return Ok(summary);
                }
            }
            info!(tid = checkpoint, "starting updater");
            (self.feed_config(checkpoint), self.notifier.take())
        };
        let save_checkpoint = !self.config.redo;

        let mut feed = ChangeFeed::new(&mut self.source, feed_config).with_stop_handle(self.stop.clone());
        if let Some(notifier) = notifier {
            feed = feed.with_notifier(notifier);
        }

        while let Some(batch) = feed.next_batch() {
            let applied = apply_batch(&mut self.store, &self.transform, self.config.chunk_size, batch);
            let result = applied.and_then(|counts| {
                let tid = feed.last_tid();
                if save_checkpoint && counts.records > 0 {
                    self.store.save_checkpoint(&self.config.client_id, tid)?;
                }
                Ok(counts)
            });
            let counts = finish_transaction(&mut self.store, result)?;
            summary.batches += 1;
            summary.records += counts.records;
            summary.written += counts.written;
            summary.skipped += counts.skipped;
            summary.last_tid = feed.last_tid();
            debug!(
                tid = summary.last_tid,
                records = counts.records,
                written = counts.written,
                "batch committed"
            );
        }

        info!(
            tid = summary.last_tid,
            batches = summary.batches,
            records = summary.records,
            "updater finished"
        );
        Ok(summary)
    }

    fn feed_config(&self, start_tid: Tid) -> FeedConfig {
        FeedConfig::new()
            .start_tid(start_tid)
            .batch_limit(self.config.batch_limit)
            .page_size(self.config.page_size)
            .poll_timeout(self.config.poll_timeout)
    }
}

impl<S, D> std::fmt::Debug for Updater<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("config", &self.config)
            .field("follows", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchCounts {
    records: usize,
    written: usize,
    skipped: usize,
}

fn prepare<D: DocumentStore>(store: &mut D, config: &UpdaterConfig) -> SinkResult<Tid> {
    if !store.checkpoint_table_exists()? {
        store.create_checkpoint_table()?;
    }
    let checkpoint = store.load_checkpoint(&config.client_id)?.unwrap_or(NO_TID);
    if checkpoint < 0 && !store.table_exists()? {
        info!("creating document table");
        store.create_table()?;
    }
    if store.legacy_trigger_present()? {
        if !config.remove_legacy_trigger {
            error!("legacy delete trigger is installed");
            return Err(SinkError::config(
                "the legacy delete trigger exists and is incompatible with the updater; \
                 rerun with trigger removal enabled to drop it",
            ));
        }
        warn!("removing legacy delete trigger");
        store.remove_legacy_trigger()?;
    }
    Ok(checkpoint)
}

fn collect<S: SourceLog, D: DocumentStore>(source: &mut S, store: &mut D) -> SinkResult<usize> {
    let ids = store.document_ids()?;
    let mut garbage = Vec::new();
    for chunk in ids.chunks(GC_CHUNK) {
        let live: HashSet<u64> = source.live_object_ids(chunk)?;
        garbage.extend(chunk.iter().copied().filter(|id| !live.contains(id)));
    }
    if !garbage.is_empty() {
        store.delete_documents(&garbage)?;
    }
    info!(checked = ids.len(), removed = garbage.len(), "garbage collected");
    Ok(garbage.len())
}

/// Writes every record of `batch` in chunks, returning what was done.
fn apply_batch<S: SourceLog, D: DocumentStore>(
    store: &mut D,
    transform: &RecordTransform,
    chunk_size: usize,
    batch: Batch<'_, S>,
) -> SinkResult<BatchCounts> {
    let mut counts = BatchCounts::default();
    let mut chunk: Vec<Record> = Vec::with_capacity(chunk_size);
    for record in batch {
        chunk.push(record?);
        if chunk.len() >= chunk_size {
            write_chunk(store, transform, &chunk, &mut counts)?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        write_chunk(store, transform, &chunk, &mut counts)?;
    }
    Ok(counts)
}

fn write_chunk<D: DocumentStore>(
    store: &mut D,
    transform: &RecordTransform,
    records: &[Record],
    counts: &mut BatchCounts,
) -> SinkResult<()> {
    let documents: Vec<Document> = records
        .iter()
        .filter_map(|record| match transform.transform(record.object_id, &record.raw) {
            Transformed::Record(decoded) => Some(Document::from_record(record.object_id, decoded)),
            Transformed::Skip(_) => None,
        })
        .collect();
    counts.records += records.len();
    counts.skipped += records.len() - documents.len();
    counts.written += documents.len();
    if !documents.is_empty() {
        store.replace_documents(&documents)?;
    }
    Ok(())
}

/// Commits on success and rolls back on failure.
fn finish_transaction<D: DocumentStore, T>(store: &mut D, result: SinkResult<T>) -> SinkResult<T> {
    match result {
        Ok(value) => {
            store.commit()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = store.rollback() {
                error!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}
