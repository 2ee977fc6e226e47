//! Index coordinator
//!
//! The only writer of index state. Turns document events into chunk-level
//! operations on the chunk store, the lexical index and the vector store, and
//! runs the maintenance operations (lexical rebuild, embeddings rebuild, fill
//! missing embeddings).
//!
//! Locking: `writes` serializes every mutation and is always taken before the
//! `lexical` / `vectors` locks. It is never held across an await. The async
//! `maintenance` gate admits one rebuild-class operation at a time.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;

use super::chunk_store::ChunkStore;
use super::chunker::Chunker;
use super::config::{IndexingConfig, SearchConfig};
use super::embedding::{Embedder, EmbeddingClient, EmbeddingModelConfig};
use super::error::{ProviderError, SearchError, SearchResult};
use super::lexical::{Bm25Params, LexicalIndex};
use super::metadata::{IndexMetadata, IndexStamp};
use super::types::{
    Chunk, ChunkOwner, ConsistencyReport, CoordinatorState, IndexStatus, MaintenanceReport,
    RebuildTarget,
};
use super::vector_store::{EmbeddingState, VectorStore};
use crate::{Document, DocumentKind};

/// A background embedding job that can be awaited
#[derive(Debug)]
pub struct EmbeddingTicket {
    handle: JoinHandle<SearchResult<MaintenanceReport>>,
}

impl EmbeddingTicket {
    pub async fn wait(self) -> SearchResult<MaintenanceReport> {
        self.handle
            .await
            .map_err(|e| SearchError::Task(e.to_string()))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// What a document save changed
#[derive(Debug)]
pub struct SaveOutcome {
    /// The parent's complete chunk set after the save
    pub chunk_ids: Vec<String>,
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    /// Present when an embedding job was scheduled
    pub embedding: Option<EmbeddingTicket>,
}

#[derive(Debug, Clone, Copy)]
enum StampField {
    Bm25Rebuild,
    EmbeddingsRebuild,
    EmbeddingsUpdate,
}

struct PendingChunk {
    id: String,
    revision: u64,
    text: String,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    embedded: usize,
    failed: usize,
    stale: usize,
}

enum CommitOutcome {
    Committed,
    Stale,
    Failed,
}

struct Inner {
    chunker: Chunker,
    indexing: IndexingConfig,
    bm25: Bm25Params,
    embedder: Arc<dyn Embedder>,
    store: ChunkStore,
    lexical: RwLock<LexicalIndex>,
    vectors: RwLock<VectorStore>,
    metadata: Mutex<IndexMetadata>,
    metadata_path: Option<PathBuf>,
    state: RwLock<CoordinatorState>,
    maintenance: Arc<tokio::sync::Mutex<()>>,
    writes: Mutex<()>,
    /// Bumped on every model change; vectors computed under an older
    /// generation are discarded
    generation: AtomicU64,
    background: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct IndexCoordinator {
    inner: Arc<Inner>,
}

impl IndexCoordinator {
    /// Restore the indexes from the chunk store.
    ///
    /// The configured model wins over the one recorded in the metadata file;
    /// vectors of any other model are dropped.
    pub fn open(
        config: &SearchConfig,
        store: ChunkStore,
        embedder: Arc<dyn Embedder>,
        metadata_path: Option<PathBuf>,
    ) -> SearchResult<Self> {
        config.validate()?;

        let mut metadata = metadata_path
            .as_deref()
            .map(IndexMetadata::load)
            .unwrap_or_default();
        let active_model = config
            .embedding
            .active_model()
            .or_else(|| metadata.active_model.clone());

        let recorded = metadata.active_model.as_ref().map(|m| m.fingerprint());
        let active = active_model.as_ref().map(|m| m.fingerprint());
        if recorded.is_some() && recorded != active {
            let cleared = store.clear_embeddings()?;
            log::info!(
                "[IndexCoordinator] Embedding model changed since last run, dropped {} vectors",
                cleared
            );
        }
        metadata.active_model = active_model;

        let chunks = store.all_chunks()?;
        let bm25 = config.ranking.bm25();
        let lexical = LexicalIndex::build(bm25, &chunks);

        let mut vectors = VectorStore::new();
        for chunk in &chunks {
            vectors.register(&chunk.id);
        }
        if let Some(fingerprint) = active {
            for (id, vector) in store.load_embeddings(&fingerprint)? {
                if let Err(e) = vectors.set(&id, vector) {
                    log::warn!("[IndexCoordinator] Skipping stored vector for {}: {}", id, e);
                }
            }
        }

        log::info!(
            "[IndexCoordinator] Opened with {} chunks ({} vectorized)",
            chunks.len(),
            vectors.vectorized_count()
        );

        let coordinator = Self {
            inner: Arc::new(Inner {
                chunker: Chunker::from_config(&config.chunking),
                indexing: config.indexing.clone(),
                bm25,
                embedder,
                store,
                lexical: RwLock::new(lexical),
                vectors: RwLock::new(vectors),
                metadata: Mutex::new(metadata),
                metadata_path,
                state: RwLock::new(CoordinatorState::Idle),
                maintenance: Arc::new(tokio::sync::Mutex::new(())),
                writes: Mutex::new(()),
                generation: AtomicU64::new(0),
                background: Arc::new(Semaphore::new(config.indexing.background_workers.max(1))),
            }),
        };
        coordinator.persist_metadata(&coordinator.inner.metadata.lock());
        Ok(coordinator)
    }

    /// Open with the on-disk store, metadata file and HTTP embedding client
    pub fn from_config(config: &SearchConfig) -> SearchResult<Self> {
        let store = ChunkStore::open(&config.paths.get_db_path())?;
        let embedder = Arc::new(EmbeddingClient::new(config.embedding.timeout())?);
        Self::open(
            config,
            store,
            embedder,
            Some(config.paths.get_index_metadata_path()),
        )
    }

    // ---- maintenance -------------------------------------------------------

    /// Rebuild the BM25 index from the chunk store and swap it in
    pub fn rebuild_lexical(&self) -> SearchResult<()> {
        let _guard = self.try_begin()?;
        self.set_state(CoordinatorState::Rebuilding(RebuildTarget::Lexical));

        let result = self.swap_lexical();
        self.conclude(StampField::Bm25Rebuild, result)
    }

    /// Build off to the side, then swap; readers see the old or the new index
    fn swap_lexical(&self) -> SearchResult<()> {
        let _writes = self.inner.writes.lock();
        let chunks = self.inner.store.all_chunks()?;
        let fresh = LexicalIndex::build(self.inner.bm25, &chunks);
        *self.inner.lexical.write() = fresh;
        log::info!("[IndexCoordinator] Lexical index rebuilt ({} chunks)", chunks.len());
        Ok(())
    }

    /// Drop every vector and embed the whole corpus again
    pub async fn rebuild_embeddings(&self) -> SearchResult<MaintenanceReport> {
        let _guard = self.try_begin()?;
        self.rebuild_embeddings_locked().await
    }

    /// Embed only the chunks that are currently MISSING
    pub async fn update_missing_embeddings(&self) -> SearchResult<MaintenanceReport> {
        let _guard = self.try_begin()?;
        self.set_state(CoordinatorState::UpdatingMissing);

        let result = match self.active_model() {
            Some(model) => self.embed_pending(&model, self.generation(), None).await,
            None => Err(SearchError::NoActiveEmbeddingModel),
        };
        self.conclude(StampField::EmbeddingsUpdate, result)
    }

    async fn rebuild_embeddings_locked(&self) -> SearchResult<MaintenanceReport> {
        self.set_state(CoordinatorState::Rebuilding(RebuildTarget::Embeddings));

        let result = match self.active_model() {
            Some(model) => match self.reset_vectors() {
                Ok(generation) => self.embed_pending(&model, generation, None).await,
                Err(e) => Err(e),
            },
            None => Err(SearchError::NoActiveEmbeddingModel),
        };
        self.conclude(StampField::EmbeddingsRebuild, result)
    }

    /// Re-register every stored chunk as MISSING and drop persisted vectors
    fn reset_vectors(&self) -> SearchResult<u64> {
        let _writes = self.inner.writes.lock();
        let ids = self.inner.store.chunk_ids()?;
        self.inner.vectors.write().rebuild_all(&ids);
        self.inner.store.clear_embeddings()?;
        Ok(self.generation())
    }

    fn try_begin(&self) -> SearchResult<OwnedMutexGuard<()>> {
        self.inner
            .maintenance
            .clone()
            .try_lock_owned()
            .map_err(|_| SearchError::Busy)
    }

    fn conclude<T>(&self, field: StampField, result: SearchResult<T>) -> SearchResult<T> {
        let stamp = match &result {
            Ok(_) => {
                self.set_state(CoordinatorState::Idle);
                IndexStamp::now()
            }
            Err(e) => {
                log::error!("[IndexCoordinator] {:?} failed: {}", field, e);
                self.set_state(CoordinatorState::Error(e.to_string()));
                IndexStamp::failed(e)
            }
        };

        let mut metadata = self.inner.metadata.lock();
        match field {
            StampField::Bm25Rebuild => metadata.bm25_last_rebuild = stamp,
            StampField::EmbeddingsRebuild => metadata.embeddings_last_rebuild = stamp,
            StampField::EmbeddingsUpdate => metadata.embeddings_last_update = stamp,
        }
        self.persist_metadata(&metadata);
        result
    }

    // ---- embedding cycle ---------------------------------------------------

    /// Embed every MISSING chunk (or only those in `only`) with bounded
    /// concurrency. Provider failures are counted, never returned.
    async fn embed_pending(
        &self,
        model: &EmbeddingModelConfig,
        generation: u64,
        only: Option<&HashSet<String>>,
    ) -> SearchResult<MaintenanceReport> {
        let started = Instant::now();
        let pending: Vec<(String, u64)> = self
            .inner
            .vectors
            .read()
            .pending()
            .into_iter()
            .filter(|(id, _)| only.map_or(true, |only| only.contains(id)))
            .collect();

        let mut report = MaintenanceReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let ids: Vec<String> = pending.iter().map(|(id, _)| id.clone()).collect();
        let stored = self.inner.store.get_many(&ids)?;
        let mut work = Vec::with_capacity(pending.len());
        for (id, revision) in pending {
            match stored.get(&id) {
                Some(chunk) => work.push(PendingChunk {
                    text: chunk.index_text(),
                    id,
                    revision,
                }),
                None => report.skipped_stale += 1,
            }
        }

        log::info!(
            "[IndexCoordinator] Embedding {} chunks with {} ({} per batch, {} in flight)",
            work.len(),
            model.fingerprint(),
            self.inner.indexing.batch_size,
            self.inner.indexing.concurrency
        );

        let halted = AtomicBool::new(false);
        let batches: Vec<Vec<PendingChunk>> = chunk_vec(work, self.inner.indexing.batch_size.max(1));
        let outcomes: Vec<BatchOutcome> = stream::iter(batches)
            .map(|batch| self.run_batch(batch, model, generation, &halted))
            .buffer_unordered(self.inner.indexing.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.embedded += outcome.embedded;
            report.failed += outcome.failed;
            report.skipped_stale += outcome.stale;
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.failed > 0 {
            log::warn!(
                "[IndexCoordinator] {} chunks left MISSING after provider errors",
                report.failed
            );
        }
        log::info!(
            "[IndexCoordinator] Embedded {} chunks in {}ms ({} failed, {} stale)",
            report.embedded,
            report.elapsed_ms,
            report.failed,
            report.skipped_stale
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        batch: Vec<PendingChunk>,
        model: &EmbeddingModelConfig,
        generation: u64,
        halted: &AtomicBool,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if self.generation() != generation {
            outcome.stale = batch.len();
            return outcome;
        }
        if halted.load(Ordering::SeqCst) {
            outcome.failed = batch.len();
            return outcome;
        }

        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        match self.embed_with_retry(&texts, model, halted).await {
            Ok(vectors) => {
                let returned = vectors.len();
                for (chunk, vector) in batch.iter().zip(vectors) {
                    self.tally(&mut outcome, self.commit(chunk, vector, model, generation));
                }
                let missing = batch.len().saturating_sub(returned);
                if missing > 0 {
                    log::warn!(
                        "[IndexCoordinator] Provider returned {} vectors for {} texts",
                        returned,
                        batch.len()
                    );
                    outcome.failed += missing;
                }
            }
            Err(e) if batch.len() > 1 && !halted.load(Ordering::SeqCst) => {
                log::warn!(
                    "[IndexCoordinator] Batch of {} failed ({}), retrying chunk by chunk",
                    batch.len(),
                    e
                );
                for chunk in &batch {
                    if self.generation() != generation {
                        outcome.stale += 1;
                        continue;
                    }
                    let single = [chunk.text.clone()];
                    match self.embed_with_retry(&single, model, halted).await {
                        Ok(mut vectors) => match vectors.pop() {
                            Some(vector) => {
                                self.tally(&mut outcome, self.commit(chunk, vector, model, generation))
                            }
                            None => outcome.failed += 1,
                        },
                        Err(e) => {
                            log::warn!("[IndexCoordinator] Chunk {} failed: {}", chunk.id, e);
                            outcome.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("[IndexCoordinator] Batch of {} failed: {}", batch.len(), e);
                outcome.failed += batch.len();
            }
        }
        outcome
    }

    fn tally(&self, outcome: &mut BatchOutcome, commit: CommitOutcome) {
        match commit {
            CommitOutcome::Committed => outcome.embedded += 1,
            CommitOutcome::Stale => outcome.stale += 1,
            CommitOutcome::Failed => outcome.failed += 1,
        }
    }

    /// Retry rate limits and outages with backoff. Unauthenticated halts the
    /// whole cycle.
    async fn embed_with_retry(
        &self,
        texts: &[String],
        model: &EmbeddingModelConfig,
        halted: &AtomicBool,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            if halted.load(Ordering::SeqCst) {
                return Err(ProviderError::Unauthenticated(
                    "embedding cycle halted after an authentication failure".into(),
                ));
            }

            match self.inner.embedder.embed_batch(texts, model).await {
                Ok(vectors) => return Ok(vectors),
                Err(ProviderError::Unauthenticated(message)) => {
                    if !halted.swap(true, Ordering::SeqCst) {
                        log::error!(
                            "[IndexCoordinator] Provider rejected credentials, halting cycle: {}",
                            message
                        );
                    }
                    return Err(ProviderError::Unauthenticated(message));
                }
                Err(e) if e.is_retryable() && attempt < self.inner.indexing.max_retries => {
                    let delay = self.inner.indexing.backoff(attempt, e.retry_after());
                    log::debug!(
                        "[IndexCoordinator] {} (attempt {}), retrying in {:?}",
                        e,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Store a computed vector unless the model switched or the chunk changed
    fn commit(
        &self,
        chunk: &PendingChunk,
        vector: Vec<f32>,
        model: &EmbeddingModelConfig,
        generation: u64,
    ) -> CommitOutcome {
        let _writes = self.inner.writes.lock();
        if self.generation() != generation {
            return CommitOutcome::Stale;
        }

        let persisted = vector.clone();
        match self
            .inner
            .vectors
            .write()
            .commit(&chunk.id, chunk.revision, vector)
        {
            Ok(true) => {}
            Ok(false) => return CommitOutcome::Stale,
            Err(e) => {
                log::warn!("[IndexCoordinator] Rejected vector for {}: {}", chunk.id, e);
                return CommitOutcome::Failed;
            }
        }

        if let Err(e) = self
            .inner
            .store
            .put_embedding(&chunk.id, &model.fingerprint(), &persisted)
        {
            log::warn!("[IndexCoordinator] Failed to persist vector for {}: {}", chunk.id, e);
        }
        CommitOutcome::Committed
    }

    // ---- document events ---------------------------------------------------

    /// Re-chunk a saved document and reconcile its chunk set. Embedding of new
    /// or changed chunks runs in the background.
    pub fn on_document_saved(&self, document: &Document) -> SearchResult<SaveOutcome> {
        let set = self.inner.chunker.chunk_document(document);
        let owner = ChunkOwner::new(document.kind(), document.id());
        self.reconcile(&owner, set.chunks)
    }

    /// Remove every chunk of one document. Returns how many were removed.
    pub fn on_document_deleted(&self, kind: DocumentKind, parent_id: &str) -> SearchResult<usize> {
        let owner = ChunkOwner::new(kind, parent_id);
        let _writes = self.inner.writes.lock();

        let mut ids: HashSet<String> = self.inner.store.delete_parent(&owner)?.into_iter().collect();
        ids.extend(self.inner.lexical.read().owned_by(&owner));
        self.remove_from_indexes(&ids);

        log::info!(
            "[IndexCoordinator] Removed {} chunks of {} {}",
            ids.len(),
            kind,
            parent_id
        );
        Ok(ids.len())
    }

    /// Remove every chunk of a kind. Returns how many were removed.
    pub fn on_all_documents_deleted(&self, kind: DocumentKind) -> SearchResult<usize> {
        let _writes = self.inner.writes.lock();

        let mut ids: HashSet<String> = self.inner.store.delete_kind(kind)?.into_iter().collect();
        {
            let lexical = self.inner.lexical.read();
            ids.extend(
                lexical
                    .ids()
                    .filter(|id| lexical.owner(id).is_some_and(|o| o.kind == kind))
                    .cloned(),
            );
        }
        self.remove_from_indexes(&ids);

        log::info!("[IndexCoordinator] Removed all {} chunks of kind {}", ids.len(), kind);
        Ok(ids.len())
    }

    fn remove_from_indexes(&self, ids: &HashSet<String>) {
        let mut lexical = self.inner.lexical.write();
        let mut vectors = self.inner.vectors.write();
        for id in ids {
            lexical.remove(id);
            vectors.remove(id);
        }
    }

    /// Make `chunks` the owner's complete chunk set in the store and both
    /// indexes, then schedule embedding for whatever is MISSING.
    fn reconcile(&self, owner: &ChunkOwner, chunks: Vec<Chunk>) -> SearchResult<SaveOutcome> {
        let (outcome, pending) = {
            let _writes = self.inner.writes.lock();

            let previous: HashMap<String, Chunk> = self
                .inner
                .store
                .chunks_for_parent(owner)?
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect();
            let current: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();

            let mut removed: HashSet<String> = previous
                .keys()
                .filter(|id| !current.contains(id.as_str()))
                .cloned()
                .collect();
            removed.extend(
                self.inner
                    .lexical
                    .read()
                    .owned_by(owner)
                    .into_iter()
                    .filter(|id| !current.contains(id.as_str())),
            );

            let mut fresh: Vec<&Chunk> = Vec::new();
            let mut changed_ids: Vec<String> = Vec::new();
            let mut unchanged: Vec<&Chunk> = Vec::new();
            for chunk in &chunks {
                match previous.get(&chunk.id) {
                    None => fresh.push(chunk),
                    Some(old) if old.index_text() != chunk.index_text() => {
                        changed_ids.push(chunk.id.clone());
                        fresh.push(chunk);
                    }
                    Some(_) => unchanged.push(chunk),
                }
            }

            self.inner.store.replace_parent(owner, &chunks, &changed_ids)?;

            {
                let mut lexical = self.inner.lexical.write();
                let mut vectors = self.inner.vectors.write();
                for id in &removed {
                    lexical.remove(id);
                    vectors.remove(id);
                }
                for chunk in &fresh {
                    lexical.add_or_replace(chunk);
                    vectors.register(&chunk.id);
                }
                for chunk in &unchanged {
                    if !lexical.contains(&chunk.id) {
                        lexical.add_or_replace(chunk);
                    }
                    if !vectors.contains(&chunk.id) {
                        vectors.register(&chunk.id);
                    }
                }
            }

            let vectors = self.inner.vectors.read();
            let pending: HashSet<String> = chunks
                .iter()
                .filter(|c| vectors.state(&c.id) == Some(EmbeddingState::Missing))
                .map(|c| c.id.clone())
                .collect();

            let outcome = SaveOutcome {
                chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
                added: fresh.len() - changed_ids.len(),
                changed: changed_ids.len(),
                removed: removed.len(),
                embedding: None,
            };
            (outcome, pending)
        };

        log::debug!(
            "[IndexCoordinator] {} {}: {} chunks (+{} ~{} -{})",
            owner.kind,
            owner.parent_id,
            outcome.chunk_ids.len(),
            outcome.added,
            outcome.changed,
            outcome.removed
        );

        Ok(SaveOutcome {
            embedding: self.schedule_embedding(pending),
            ..outcome
        })
    }

    /// Spawn a background embedding job bounded by the worker semaphore
    fn schedule_embedding(&self, ids: HashSet<String>) -> Option<EmbeddingTicket> {
        if ids.is_empty() {
            return None;
        }
        let model = self.active_model()?;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::debug!(
                "[IndexCoordinator] No runtime, {} chunks stay MISSING until the next update",
                ids.len()
            );
            return None;
        };

        let coordinator = self.clone();
        let generation = self.generation();
        let handle = runtime.spawn(async move {
            let _permit = coordinator
                .inner
                .background
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SearchError::Task(e.to_string()))?;
            coordinator.embed_pending(&model, generation, Some(&ids)).await
        });
        Some(EmbeddingTicket { handle })
    }

    // ---- active model ------------------------------------------------------

    /// Switch the embedding model. A change of provider, model id, endpoint or
    /// dimensions invalidates every vector and queues a full rebuild; a
    /// credential-only change does not.
    pub fn set_active_model(
        &self,
        model: Option<EmbeddingModelConfig>,
    ) -> SearchResult<Option<EmbeddingTicket>> {
        if let Some(ref model) = model {
            model.validate()?;
        }

        let changed = {
            let _writes = self.inner.writes.lock();
            let mut metadata = self.inner.metadata.lock();
            let before = metadata.active_model.as_ref().map(|m| m.fingerprint());
            let after = model.as_ref().map(|m| m.fingerprint());
            let changed = before != after;

            if changed {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                self.inner.vectors.write().mark_all_missing();
                self.inner.store.clear_embeddings()?;
            }
            metadata.active_model = model.clone();
            self.persist_metadata(&metadata);
            changed
        };

        if !changed {
            log::debug!("[IndexCoordinator] Embedding model credentials updated");
            return Ok(None);
        }
        log::info!(
            "[IndexCoordinator] Active embedding model is now {}",
            model
                .as_ref()
                .map(|m| m.fingerprint())
                .unwrap_or_else(|| "none".into())
        );

        if model.is_none() || !self.inner.indexing.rebuild_on_model_change {
            return Ok(None);
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return Ok(None);
        };

        let coordinator = self.clone();
        let generation = self.generation();
        let handle = runtime.spawn(async move {
            let _guard = coordinator.inner.maintenance.clone().lock_owned().await;
            if coordinator.generation() != generation {
                log::debug!("[IndexCoordinator] Queued rebuild superseded by a newer model");
                return Ok(MaintenanceReport::default());
            }
            coordinator.rebuild_embeddings_locked().await
        });
        Ok(Some(EmbeddingTicket { handle }))
    }

    pub fn active_model(&self) -> Option<EmbeddingModelConfig> {
        self.inner.metadata.lock().active_model.clone()
    }

    // ---- consistency -------------------------------------------------------

    /// Compare the chunk store with both indexes and re-sync every parent
    /// with a discrepancy
    pub fn verify_consistency(&self) -> SearchResult<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        let mut owners: HashSet<ChunkOwner> = HashSet::new();

        {
            let _writes = self.inner.writes.lock();
            let stored = self.inner.store.all_chunks()?;
            report.stored_chunks = stored.len();
            let stored_ids: HashSet<&str> = stored.iter().map(|c| c.id.as_str()).collect();

            let mut lexical = self.inner.lexical.write();
            let mut vectors = self.inner.vectors.write();

            let mut orphaned: HashSet<String> = HashSet::new();
            for id in lexical.ids().filter(|id| !stored_ids.contains(id.as_str())) {
                if let Some(owner) = lexical.owner(id) {
                    owners.insert(owner.clone());
                }
                orphaned.insert(id.clone());
            }
            orphaned.extend(
                vectors
                    .ids()
                    .filter(|id| !stored_ids.contains(id.as_str()))
                    .cloned(),
            );
            for id in &orphaned {
                lexical.remove(id);
                vectors.remove(id);
            }

            for chunk in &stored {
                if !lexical.contains(&chunk.id) || !vectors.contains(&chunk.id) {
                    report.unindexed.push(chunk.id.clone());
                    owners.insert(chunk.owner());
                }
            }

            report.orphaned = orphaned.into_iter().collect();
            report.orphaned.sort();
        }

        let mut owners: Vec<ChunkOwner> = owners.into_iter().collect();
        owners.sort();
        for owner in &owners {
            self.resync_parent(owner)?;
        }
        report.resynced_parents = owners;

        if !report.is_consistent() {
            log::warn!(
                "[IndexCoordinator] Repaired {} orphaned and {} unindexed chunks",
                report.orphaned.len(),
                report.unindexed.len()
            );
        }
        Ok(report)
    }

    /// Drop an id that was ranked but has no stored chunk, re-sync its parent
    /// and return the error to report
    pub fn resolve_inconsistency(&self, chunk_id: &str) -> SearchError {
        let owner = self.inner.lexical.read().owner(chunk_id).cloned();
        {
            let _writes = self.inner.writes.lock();
            self.inner.lexical.write().remove(chunk_id);
            self.inner.vectors.write().remove(chunk_id);
        }

        if let Some(ref owner) = owner {
            if let Err(e) = self.resync_parent(owner) {
                log::warn!(
                    "[IndexCoordinator] Re-sync of {} {} failed: {}",
                    owner.kind,
                    owner.parent_id,
                    e
                );
            }
        }

        log::warn!("[IndexCoordinator] Index inconsistency on {}", chunk_id);
        SearchError::IndexInconsistency {
            chunk_id: chunk_id.to_string(),
            parent_id: owner.map(|o| o.parent_id).unwrap_or_default(),
        }
    }

    /// Record that document events were dropped before reaching the indexes.
    /// Only a full resync from the host can recover the affected documents.
    pub fn mark_events_lost(&self, lost: u64) {
        log::error!(
            "[IndexCoordinator] {} document events lost, resync required",
            lost
        );
        self.set_state(CoordinatorState::Error(format!(
            "event bus lagged, {} document events lost; resync required",
            lost
        )));
    }

    /// Reconcile the indexes with the stored chunk set of one parent
    fn resync_parent(&self, owner: &ChunkOwner) -> SearchResult<()> {
        let chunks = self.inner.store.chunks_for_parent(owner)?;
        self.reconcile(owner, chunks).map(|_| ())
    }

    // ---- read side ---------------------------------------------------------

    pub fn status(&self) -> SearchResult<IndexStatus> {
        let chunk_count = self.inner.store.count()?;
        let (vectorized_count, missing_count) = {
            let vectors = self.inner.vectors.read();
            (vectors.vectorized_count(), vectors.missing_count())
        };
        let metadata = self.inner.metadata.lock();
        Ok(IndexStatus {
            state: self.state(),
            bm25_last_rebuild: metadata.bm25_last_rebuild.clone(),
            embeddings_last_rebuild: metadata.embeddings_last_rebuild.clone(),
            embeddings_last_update: metadata.embeddings_last_update.clone(),
            active_model: metadata.active_model.as_ref().map(|m| m.fingerprint()),
            chunk_count,
            vectorized_count,
            missing_count,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.inner.embedder.clone()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }

    pub fn lexical_scores(&self, terms: &[String]) -> HashMap<String, f32> {
        self.inner.lexical.read().score(terms)
    }

    pub fn semantic_scores(&self, query: &[f32]) -> HashMap<String, f32> {
        self.inner.vectors.read().similarity(query)
    }

    pub fn lexical_contains(&self, chunk_id: &str) -> bool {
        self.inner.lexical.read().contains(chunk_id)
    }

    /// Whether either index still holds `chunk_id`, observed after any
    /// in-flight mutation has finished
    pub fn is_indexed(&self, chunk_id: &str) -> bool {
        let _writes = self.inner.writes.lock();
        self.inner.lexical.read().contains(chunk_id) || self.inner.vectors.read().contains(chunk_id)
    }

    pub fn vector_state(&self, chunk_id: &str) -> Option<EmbeddingState> {
        self.inner.vectors.read().state(chunk_id)
    }

    pub fn vector(&self, chunk_id: &str) -> Option<Vec<f32>> {
        self.inner.vectors.read().vector(chunk_id).map(<[f32]>::to_vec)
    }

    pub fn vectorized_count(&self) -> usize {
        self.inner.vectors.read().vectorized_count()
    }

    pub fn missing_ids(&self) -> Vec<String> {
        self.inner.vectors.read().missing_ids()
    }

    pub fn chunk_ids(&self) -> SearchResult<Vec<String>> {
        self.inner.store.chunk_ids()
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.inner.state.write() = state;
    }

    fn persist_metadata(&self, metadata: &IndexMetadata) {
        if let Some(ref path) = self.inner.metadata_path {
            if let Err(e) = metadata.save(path) {
                log::warn!("[IndexCoordinator] Failed to write {}: {}", path.display(), e);
            }
        }
    }
}

fn chunk_vec<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size);
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
