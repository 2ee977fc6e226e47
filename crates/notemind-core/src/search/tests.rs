//! Engine tests for search module

#[cfg(test)]
mod tests {
    use super::super::*;

    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    use crate::events::{DocumentEvent, EventBus};
    use crate::{Conversation, Document, DocumentKind, Note, Role, Turn};

    const DIMS: usize = 32;

    /// Deterministic bag-of-words embedder with switchable failures
    #[derive(Default)]
    struct FakeEmbedder {
        calls: AtomicUsize,
        queries: AtomicUsize,
        embedded: Mutex<Vec<String>>,
        throttled: Mutex<Vec<String>>,
        unauthenticated: AtomicBool,
        unreachable: AtomicBool,
        /// Return one vector fewer than requested
        short_batches: AtomicBool,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeEmbedder {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Every call blocks until the gate has permits
        fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                gate: Some(gate),
                ..Default::default()
            })
        }

        /// Rate-limit any batch containing a text with this marker
        fn throttle(&self, marker: &str) {
            self.throttled.lock().push(marker.to_string());
        }

        fn clear_throttle(&self) {
            self.throttled.lock().clear();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }

        fn take_embedded(&self) -> Vec<String> {
            std::mem::take(&mut *self.embedded.lock())
        }
    }

    fn fake_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; DIMS];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % DIMS as u64) as usize] += 1.0;
        }
        vector
    }

    impl Embedder for FakeEmbedder {
        fn embed_batch<'a>(
            &'a self,
            texts: &'a [String],
            _model: &'a EmbeddingModelConfig,
        ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, ProviderError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(gate) = &self.gate {
                    let _permit = gate
                        .acquire()
                        .await
                        .map_err(|e| ProviderError::Unreachable(e.to_string()))?;
                }
                if self.unauthenticated.load(Ordering::SeqCst) {
                    return Err(ProviderError::Unauthenticated("invalid api key".into()));
                }
                if self.unreachable.load(Ordering::SeqCst) {
                    return Err(ProviderError::Unreachable("connection refused".into()));
                }
                {
                    let throttled = self.throttled.lock();
                    let limited = texts
                        .iter()
                        .any(|t| throttled.iter().any(|marker| t.contains(marker.as_str())));
                    if limited {
                        return Err(ProviderError::RateLimited {
                            retry_after: Some(Duration::from_millis(1)),
                        });
                    }
                }
                self.embedded.lock().extend(texts.iter().cloned());
                let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| fake_vector(t)).collect();
                if self.short_batches.load(Ordering::SeqCst) {
                    vectors.pop();
                }
                Ok(vectors)
            })
        }

        fn embed_query<'a>(
            &'a self,
            query: &'a str,
            model: &'a EmbeddingModelConfig,
        ) -> BoxFuture<'a, Result<Vec<f32>, ProviderError>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.embed(query, model)
        }
    }

    fn model() -> EmbeddingModelConfig {
        EmbeddingModelConfig::new(EmbeddingProvider::LocalServer, "fake-embed")
    }

    fn other_model() -> EmbeddingModelConfig {
        EmbeddingModelConfig::new(EmbeddingProvider::LocalServer, "other-embed")
    }

    /// No active model, fast retries, no automatic rebuild on model change
    fn base_config() -> SearchConfig {
        let mut config = SearchConfig::default();
        config.indexing.max_retries = 1;
        config.indexing.retry_base_ms = 1;
        config.indexing.retry_max_ms = 2;
        config.indexing.rebuild_on_model_change = false;
        config
    }

    fn config_with_model() -> SearchConfig {
        let mut config = base_config();
        config.embedding.provider = Some(EmbeddingProvider::LocalServer);
        config.embedding.model = Some("fake-embed".into());
        config
    }

    fn open(config: &SearchConfig, embedder: Arc<FakeEmbedder>) -> IndexCoordinator {
        IndexCoordinator::open(config, ChunkStore::open_in_memory().unwrap(), embedder, None)
            .unwrap()
    }

    /// Save and wait for the background embedding job, if any
    async fn save(coordinator: &IndexCoordinator, document: impl Into<Document>) -> Vec<String> {
        let outcome = coordinator.on_document_saved(&document.into()).unwrap();
        if let Some(ticket) = outcome.embedding {
            ticket.wait().await.unwrap();
        }
        outcome.chunk_ids
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    fn assert_no_orphans(coordinator: &IndexCoordinator) {
        for id in coordinator.chunk_ids().unwrap() {
            assert!(coordinator.lexical_contains(&id), "{} not in lexical index", id);
            assert!(
                coordinator.vector_state(&id).is_some(),
                "{} not in vector store",
                id
            );
        }
        assert!(coordinator.verify_consistency().unwrap().is_consistent());
    }

    mod coordinator_tests {
        use super::*;

        #[tokio::test]
        async fn test_saved_note_is_indexed_and_missing_without_model() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            let outcome = coordinator
                .on_document_saved(&Note::new("n1", "", "Paris is the capital of France").into())
                .unwrap();

            assert_eq!(outcome.chunk_ids, vec!["notechunk_n1_0"]);
            assert_eq!(outcome.added, 1);
            assert!(outcome.embedding.is_none());
            assert!(coordinator.lexical_contains("notechunk_n1_0"));
            assert_eq!(
                coordinator.vector_state("notechunk_n1_0"),
                Some(EmbeddingState::Missing)
            );
        }

        #[tokio::test]
        async fn test_embedding_without_model_fails() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "some text")).await;

            let err = coordinator.rebuild_embeddings().await.unwrap_err();
            assert!(matches!(err, SearchError::NoActiveEmbeddingModel));
            assert!(matches!(coordinator.state(), CoordinatorState::Error(_)));
            assert!(coordinator.status().unwrap().embeddings_last_rebuild.is_failed());

            assert!(matches!(
                coordinator.update_missing_embeddings().await,
                Err(SearchError::NoActiveEmbeddingModel)
            ));

            // A successful operation clears the error state
            coordinator.rebuild_lexical().unwrap();
            assert_eq!(coordinator.state(), CoordinatorState::Idle);
            assert!(coordinator
                .status()
                .unwrap()
                .bm25_last_rebuild
                .timestamp()
                .is_some());
        }

        #[tokio::test]
        async fn test_edits_leave_no_orphans() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            let before = save(
                &coordinator,
                Note::new("n1", "Plans", "# One\n\nfirst\n\n# Two\n\nsecond\n\n# Three\n\nthird"),
            )
            .await;
            assert_eq!(before.len(), 3);
            assert_no_orphans(&coordinator);

            let after = save(&coordinator, Note::new("n1", "Plans", "# One\n\nfirst\n\n# Two\n\nsecond")).await;
            assert_eq!(after.len(), 2);
            assert!(!coordinator.lexical_contains("notechunk_n1_2"));
            assert_eq!(coordinator.vector_state("notechunk_n1_2"), None);
            assert_no_orphans(&coordinator);
        }

        #[tokio::test]
        async fn test_edit_keeps_vectors_of_unchanged_chunks() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "Trip", "# Day 1\n\nLouvre\n\n# Day 2\n\nVersailles")).await;
            let kept = coordinator.vector("notechunk_n1_0").unwrap();
            embedder.take_embedded();

            let outcome = coordinator
                .on_document_saved(
                    &Note::new("n1", "Trip", "# Day 1\n\nLouvre\n\n# Day 2\n\nGiverny").into(),
                )
                .unwrap();
            assert_eq!((outcome.added, outcome.changed, outcome.removed), (0, 1, 0));
            assert_eq!(
                coordinator.vector_state("notechunk_n1_1"),
                Some(EmbeddingState::Missing)
            );

            outcome.embedding.unwrap().wait().await.unwrap();
            assert_eq!(coordinator.vector("notechunk_n1_0").unwrap(), kept);
            assert_eq!(
                coordinator.vector_state("notechunk_n1_1"),
                Some(EmbeddingState::Ready)
            );
            let embedded = embedder.take_embedded();
            assert_eq!(embedded.len(), 1);
            assert!(embedded[0].contains("Giverny"));
        }

        #[tokio::test]
        async fn test_delete_removes_every_chunk() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            let note_ids = save(&coordinator, Note::new("n1", "", "# A\n\nalpha\n\n# B\n\nbeta")).await;
            let chat_ids = save(
                &coordinator,
                Conversation::new(
                    "c1",
                    "",
                    vec![
                        Turn::new(Role::User, "How do I bake sourdough bread?"),
                        Turn::new(Role::Assistant, "Start with an active starter and a long proof."),
                    ],
                ),
            )
            .await;

            assert_eq!(coordinator.on_document_deleted(DocumentKind::Note, "n1").unwrap(), 2);
            for id in &note_ids {
                assert!(!coordinator.lexical_contains(id));
                assert_eq!(coordinator.vector_state(id), None);
            }
            for id in &chat_ids {
                assert!(coordinator.lexical_contains(id));
            }

            assert_eq!(coordinator.on_all_documents_deleted(DocumentKind::Chat).unwrap(), 2);
            assert!(coordinator.chunk_ids().unwrap().is_empty());
            assert_eq!(coordinator.status().unwrap().missing_count, 0);
            assert_eq!(coordinator.vectorized_count(), 0);
        }

        #[tokio::test]
        async fn test_rate_limited_chunks_stay_missing() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&base_config(), embedder.clone());
            for i in 0..10 {
                let content = if i == 3 || i == 7 {
                    format!("throttle this note {}", i)
                } else {
                    format!("ordinary content {}", i)
                };
                save(&coordinator, Note::new(format!("n{}", i), "", content)).await;
            }
            assert!(coordinator.set_active_model(Some(model())).unwrap().is_none());
            embedder.throttle("throttle");

            let report = coordinator.rebuild_embeddings().await.unwrap();
            assert_eq!(report.embedded, 8);
            assert_eq!(report.failed, 2);
            assert_eq!(
                coordinator.missing_ids(),
                vec!["notechunk_n3_0".to_string(), "notechunk_n7_0".to_string()]
            );

            let untouched = coordinator.vector("notechunk_n0_0").unwrap();
            embedder.clear_throttle();
            embedder.take_embedded();

            let report = coordinator.update_missing_embeddings().await.unwrap();
            assert_eq!(report.embedded, 2);
            assert_eq!(report.failed, 0);
            let embedded = embedder.take_embedded();
            assert_eq!(embedded.len(), 2);
            assert!(embedded.iter().all(|t| t.contains("throttle")));
            assert!(coordinator.missing_ids().is_empty());
            assert_eq!(coordinator.vector("notechunk_n0_0").unwrap(), untouched);
            assert!(coordinator
                .status()
                .unwrap()
                .embeddings_last_update
                .timestamp()
                .is_some());
        }

        #[tokio::test]
        async fn test_update_missing_is_a_no_op_when_complete() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "fully embedded")).await;
            let calls = embedder.calls();

            let report = coordinator.update_missing_embeddings().await.unwrap();
            assert_eq!(report.embedded, 0);
            assert_eq!(embedder.calls(), calls);
        }

        #[tokio::test]
        async fn test_model_switch_marks_all_missing_and_keeps_lexical() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "rust ownership and borrowing")).await;
            save(&coordinator, Note::new("n2", "", "async runtimes in rust")).await;
            assert_eq!(coordinator.vectorized_count(), 2);

            let terms = tokenize("rust async");
            let mut before: Vec<_> = coordinator.lexical_scores(&terms).into_iter().collect();
            before.sort_by(|a, b| a.0.cmp(&b.0));

            // Credentials alone do not invalidate vectors
            assert!(coordinator
                .set_active_model(Some(model().with_api_key("new-key")))
                .unwrap()
                .is_none());
            assert_eq!(coordinator.vectorized_count(), 2);

            coordinator.set_active_model(Some(other_model())).unwrap();
            assert_eq!(coordinator.vectorized_count(), 0);
            assert_eq!(coordinator.missing_ids().len(), 2);
            assert_eq!(coordinator.store().embedding_count().unwrap(), 0);

            let mut after: Vec<_> = coordinator.lexical_scores(&terms).into_iter().collect();
            after.sort_by(|a, b| a.0.cmp(&b.0));
            assert_eq!(before, after);
        }

        #[tokio::test]
        async fn test_model_change_queues_rebuild() {
            let mut config = config_with_model();
            config.indexing.rebuild_on_model_change = true;
            let coordinator = open(&config, FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "first note")).await;
            save(&coordinator, Note::new("n2", "", "second note")).await;

            let ticket = coordinator
                .set_active_model(Some(other_model()))
                .unwrap()
                .expect("rebuild queued");
            let report = ticket.wait().await.unwrap();
            assert_eq!(report.embedded, 2);
            assert_eq!(coordinator.vectorized_count(), 2);
            assert!(coordinator
                .status()
                .unwrap()
                .active_model
                .unwrap()
                .contains("other-embed"));
        }

        #[tokio::test]
        async fn test_unauthenticated_halts_cycle() {
            let mut config = base_config();
            config.indexing.batch_size = 2;
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config, embedder.clone());
            for i in 0..6 {
                save(&coordinator, Note::new(format!("n{}", i), "", format!("note {}", i))).await;
            }
            coordinator.set_active_model(Some(model())).unwrap();
            embedder.unauthenticated.store(true, Ordering::SeqCst);

            let report = coordinator.rebuild_embeddings().await.unwrap();
            assert_eq!(report.embedded, 0);
            assert_eq!(report.failed, 6);
            assert_eq!(embedder.calls(), 1);
        }

        #[tokio::test]
        async fn test_short_provider_response_counts_as_failed() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&base_config(), embedder.clone());
            for i in 0..3 {
                save(&coordinator, Note::new(format!("n{}", i), "", format!("note {}", i))).await;
            }
            coordinator.set_active_model(Some(model())).unwrap();
            embedder.short_batches.store(true, Ordering::SeqCst);

            let report = coordinator.rebuild_embeddings().await.unwrap();
            assert_eq!(report.embedded, 2);
            assert_eq!(report.failed, 1);
            assert_eq!(coordinator.missing_ids().len(), 1);
        }

        #[tokio::test]
        async fn test_underscored_parent_ids_do_not_collide() {
            let mut config = base_config();
            config.chunking.max_chunk_chars = 60;
            config.chunking.overlap_chars = 10;
            config.chunking.min_chunk_chars = 5;
            let coordinator = open(&config, FakeEmbedder::new());

            let split = save(
                &coordinator,
                Note::new(
                    "a",
                    "",
                    "Zebras graze on the open savanna. The second sentence follows it. \
                     A third sentence closes the paragraph. And one more for luck.",
                ),
            )
            .await;
            assert!(split.len() > 1);
            let whole = save(&coordinator, Note::new("a_0", "", "pineapple upside down cake")).await;
            assert_eq!(whole.len(), 1);
            assert!(!split.contains(&whole[0]));

            let store = coordinator.store();
            let a = store.chunks_for_parent(&ChunkOwner::new(DocumentKind::Note, "a")).unwrap();
            let a_0 = store
                .chunks_for_parent(&ChunkOwner::new(DocumentKind::Note, "a_0"))
                .unwrap();
            assert_eq!(a.len(), split.len());
            assert_eq!(a_0.len(), 1);

            let searcher = HybridSearcher::new(coordinator.clone(), RankingConfig::default());
            let results = searcher.search("zebras", 5).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].chunk.parent_id, "a");
            let results = searcher.search("pineapple", 5).await.unwrap();
            assert_eq!(results[0].chunk.parent_id, "a_0");
            assert_no_orphans(&coordinator);
        }

        #[tokio::test]
        async fn test_second_maintenance_request_is_busy() {
            let gate = Arc::new(Semaphore::new(0));
            let embedder = FakeEmbedder::gated(gate.clone());
            let coordinator = open(&base_config(), embedder.clone());
            for i in 0..3 {
                save(&coordinator, Note::new(format!("n{}", i), "", format!("note {}", i))).await;
            }
            coordinator.set_active_model(Some(model())).unwrap();

            let running = coordinator.clone();
            let handle = tokio::spawn(async move { running.rebuild_embeddings().await });
            assert!(wait_for(|| embedder.calls() > 0).await);
            assert_eq!(
                coordinator.state(),
                CoordinatorState::Rebuilding(RebuildTarget::Embeddings)
            );

            assert!(matches!(
                coordinator.update_missing_embeddings().await,
                Err(SearchError::Busy)
            ));
            assert!(matches!(coordinator.rebuild_lexical(), Err(SearchError::Busy)));

            gate.add_permits(100);
            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.embedded, 3);
            assert_eq!(coordinator.state(), CoordinatorState::Idle);
        }

        #[tokio::test]
        async fn test_model_switch_discards_in_flight_vectors() {
            let gate = Arc::new(Semaphore::new(0));
            let embedder = FakeEmbedder::gated(gate.clone());
            let coordinator = open(&base_config(), embedder.clone());
            for i in 0..3 {
                save(&coordinator, Note::new(format!("n{}", i), "", format!("note {}", i))).await;
            }
            coordinator.set_active_model(Some(model())).unwrap();

            let running = coordinator.clone();
            let handle = tokio::spawn(async move { running.rebuild_embeddings().await });
            assert!(wait_for(|| embedder.calls() > 0).await);

            coordinator.set_active_model(Some(other_model())).unwrap();
            gate.add_permits(100);

            let report = handle.await.unwrap().unwrap();
            assert_eq!(report.embedded, 0);
            assert_eq!(report.skipped_stale, 3);
            assert_eq!(coordinator.vectorized_count(), 0);
            assert_eq!(coordinator.store().embedding_count().unwrap(), 0);
        }

        #[tokio::test]
        async fn test_open_restores_indexes_from_store() {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config_with_model();
            config.paths.db_path = Some(dir.path().join("chunks.db"));
            config.paths.index_metadata_path = Some(dir.path().join("index-metadata.json"));

            let reopen = |config: &SearchConfig| {
                IndexCoordinator::open(
                    config,
                    ChunkStore::open(&config.paths.get_db_path()).unwrap(),
                    FakeEmbedder::new(),
                    Some(config.paths.get_index_metadata_path()),
                )
                .unwrap()
            };

            {
                let coordinator = reopen(&config);
                save(&coordinator, Note::new("n1", "", "persisted note body")).await;
                assert_eq!(coordinator.vectorized_count(), 1);
            }

            let coordinator = reopen(&config);
            assert!(coordinator.lexical_contains("notechunk_n1_0"));
            assert_eq!(coordinator.vectorized_count(), 1);
            assert!(dir.path().join("index-metadata.json").exists());

            config.embedding.model = Some("other-embed".into());
            let coordinator = reopen(&config);
            assert_eq!(coordinator.vectorized_count(), 0);
            assert_eq!(coordinator.missing_ids(), vec!["notechunk_n1_0".to_string()]);
        }

        #[tokio::test]
        async fn test_verify_consistency_repairs_orphans() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "# A\n\nalpha\n\n# B\n\nbeta")).await;
            save(&coordinator, Note::new("n2", "", "gamma")).await;

            let owner = ChunkOwner::new(DocumentKind::Note, "n1");
            coordinator.store().delete_parent(&owner).unwrap();

            let report = coordinator.verify_consistency().unwrap();
            assert_eq!(
                report.orphaned,
                vec!["notechunk_n1_0".to_string(), "notechunk_n1_1".to_string()]
            );
            assert_eq!(report.resynced_parents, vec![owner]);
            assert!(!coordinator.lexical_contains("notechunk_n1_0"));
            assert!(coordinator.lexical_contains("notechunk_n2_0"));
            assert!(coordinator.verify_consistency().unwrap().is_consistent());
        }
    }

    mod searcher_tests {
        use super::*;

        fn searcher(coordinator: &IndexCoordinator) -> HybridSearcher {
            HybridSearcher::new(coordinator.clone(), RankingConfig::default())
        }

        #[tokio::test]
        async fn test_paris_example() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            let searcher = searcher(&coordinator);

            let results = searcher.search("capital of France", 5).await.unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].chunk.id, "notechunk_n1_0");
            assert_eq!(results[0].chunk.content, "Paris is the capital of France");
            assert!(results[0].lexical_score > 0.0);
            assert_eq!(results[0].semantic_score, 0.0);

            coordinator.set_active_model(Some(model())).unwrap();
            coordinator.rebuild_embeddings().await.unwrap();

            let results = searcher.search("capital of France", 5).await.unwrap();
            assert_eq!(results[0].chunk.id, "notechunk_n1_0");
            assert!(results[0].lexical_score > 0.0);
            assert!(results[0].semantic_score > 0.0);
            assert!((results[0].hybrid_score - 1.0).abs() < 1e-6);
        }

        #[tokio::test]
        async fn test_empty_query_makes_no_provider_call() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "something to find")).await;
            let calls = embedder.calls();

            let searcher = searcher(&coordinator);
            assert!(searcher.search("", 5).await.unwrap().is_empty());
            assert!(searcher.search("   \t", 5).await.unwrap().is_empty());
            assert!(searcher.search("something", 0).await.unwrap().is_empty());
            assert_eq!(embedder.calls(), calls);
        }

        #[tokio::test]
        async fn test_empty_corpus() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            assert!(searcher(&coordinator).search("anything", 5).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_provider_failure_degrades_to_lexical() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            embedder.unreachable.store(true, Ordering::SeqCst);

            let results = searcher(&coordinator).search("capital", 5).await.unwrap();
            assert_eq!(results.len(), 1);
            assert!(results[0].lexical_score > 0.0);
            assert_eq!(results[0].semantic_score, 0.0);
        }

        #[tokio::test]
        async fn test_partially_embedded_corpus_still_ranks_lexically() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "tokio runtime internals")).await;
            embedder.throttle("pending");
            save(&coordinator, Note::new("n2", "", "pending note about tokio")).await;
            assert_eq!(coordinator.missing_ids(), vec!["notechunk_n2_0".to_string()]);

            let results = searcher(&coordinator).search("tokio", 5).await.unwrap();
            let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
            assert!(ids.contains(&"notechunk_n2_0"));
            let missing = results.iter().find(|r| r.chunk.id == "notechunk_n2_0").unwrap();
            assert!(missing.lexical_score > 0.0);
            assert_eq!(missing.semantic_score, 0.0);
        }

        #[tokio::test]
        async fn test_hybrid_score_is_monotonic() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            let notes = [
                "rust async runtime with tokio",
                "async programming in rust",
                "the rust borrow checker",
                "gardening tips for spring",
                "runtime performance of async code",
                "tokio tokio tokio",
            ];
            for (i, content) in notes.iter().enumerate() {
                save(&coordinator, Note::new(format!("n{}", i), "", *content)).await;
            }

            let results = searcher(&coordinator).search("rust async runtime", 10).await.unwrap();
            assert!(results.len() >= 4);
            for a in &results {
                for b in &results {
                    if a.lexical_score >= b.lexical_score && a.semantic_score >= b.semantic_score {
                        assert!(
                            a.hybrid_score >= b.hybrid_score,
                            "{} dominates {} but ranks lower",
                            a.chunk.id,
                            b.chunk.id
                        );
                    }
                }
            }
            for pair in results.windows(2) {
                assert!(pair[0].hybrid_score >= pair[1].hybrid_score);
            }
        }

        #[tokio::test]
        async fn test_search_is_deterministic_and_truncated() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            for i in 0..5 {
                save(&coordinator, Note::new(format!("n{}", i), "", "identical shared words")).await;
            }
            let searcher = searcher(&coordinator);

            fn ids(results: &[HybridRankedChunk]) -> Vec<String> {
                results.iter().map(|r| r.chunk.id.clone()).collect()
            }

            let first = searcher.search("shared words", 3).await.unwrap();
            let second = searcher.search("shared words", 3).await.unwrap();
            assert_eq!(ids(&first), ids(&second));
            // Equal scores fall back to id order
            assert_eq!(
                ids(&first),
                vec!["notechunk_n0_0", "notechunk_n1_0", "notechunk_n2_0"]
            );
        }

        #[tokio::test]
        async fn test_deleted_documents_never_returned() {
            let coordinator = open(&config_with_model(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            coordinator.on_document_deleted(DocumentKind::Note, "n1").unwrap();
            assert!(searcher(&coordinator).search("capital", 5).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_delete_during_query_embedding_is_skipped() {
            let gate = Arc::new(Semaphore::new(1));
            let embedder = FakeEmbedder::gated(gate.clone());
            let coordinator = open(&base_config(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            save(&coordinator, Note::new("n2", "", "Berlin is the capital of Germany")).await;
            coordinator.set_active_model(Some(model())).unwrap();
            coordinator.rebuild_embeddings().await.unwrap();

            // Hold the query embedding until the delete has landed
            gate.acquire().await.unwrap().forget();
            let calls = embedder.calls();
            let searcher = searcher(&coordinator);
            let handle = tokio::spawn(async move { searcher.search("capital", 5).await });
            assert!(wait_for(|| embedder.calls() > calls).await);

            coordinator.on_document_deleted(DocumentKind::Note, "n1").unwrap();
            gate.add_permits(1);

            let results = handle.await.unwrap().unwrap();
            let ids: Vec<&str> = results.iter().map(|r| r.chunk.parent_id.as_str()).collect();
            assert_eq!(ids, vec!["n2"]);
            assert_eq!(coordinator.state(), CoordinatorState::Idle);
        }

        #[tokio::test]
        async fn test_query_is_embedded_as_a_query() {
            let embedder = FakeEmbedder::new();
            let coordinator = open(&config_with_model(), embedder.clone());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            assert_eq!(embedder.queries(), 0);

            let results = searcher(&coordinator).search("capital", 5).await.unwrap();
            assert!(results[0].semantic_score > 0.0);
            assert_eq!(embedder.queries(), 1);
        }

        #[tokio::test]
        async fn test_missing_stored_chunk_is_an_inconsistency() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            save(&coordinator, Note::new("n1", "", "Paris is the capital of France")).await;
            coordinator
                .store()
                .delete_parent(&ChunkOwner::new(DocumentKind::Note, "n1"))
                .unwrap();

            let searcher = searcher(&coordinator);
            match searcher.search("capital", 5).await {
                Err(SearchError::IndexInconsistency {
                    chunk_id,
                    parent_id,
                }) => {
                    assert_eq!(chunk_id, "notechunk_n1_0");
                    assert_eq!(parent_id, "n1");
                }
                other => panic!("expected inconsistency, got {:?}", other.map(|r| r.len())),
            }

            // The re-sync removed the stale id
            assert!(!coordinator.lexical_contains("notechunk_n1_0"));
            assert!(searcher.search("capital", 5).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_chat_results_carry_turn_metadata() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            save(
                &coordinator,
                Conversation::new(
                    "c1",
                    "Baking",
                    vec![
                        Turn::new(Role::User, "How long should sourdough proof overnight?"),
                        Turn::new(Role::Assistant, "Around twelve hours in the fridge works well."),
                    ],
                ),
            )
            .await;

            let results = searcher(&coordinator).search("sourdough", 5).await.unwrap();
            assert_eq!(results[0].chunk.id, "chatchunk_c1_0");
            assert_eq!(results[0].chunk.parent.title, "Baking");
            assert!(matches!(
                results[0].chunk.location,
                ChunkLocation::Chat {
                    turn_index: 0,
                    role: Role::User,
                    ..
                }
            ));
        }
    }

    mod service_tests {
        use super::*;

        fn service(config: &SearchConfig, embedder: Arc<FakeEmbedder>) -> SearchService {
            SearchService::new(open(config, embedder), config)
        }

        #[tokio::test]
        async fn test_search_after_delete_succeeds_with_no_results() {
            let service = service(&config_with_model(), FakeEmbedder::new());
            save(service.coordinator(), Note::new("n1", "", "Paris is the capital of France")).await;
            service
                .coordinator()
                .on_document_deleted(DocumentKind::Note, "n1")
                .unwrap();

            let response = service
                .handle_json(r#"{"type":"Search","query":"capital","topK":5}"#)
                .await;
            assert_eq!(response, r#"{"success":true,"results":[]}"#);
        }

        #[tokio::test]
        async fn test_empty_search_request() {
            let embedder = FakeEmbedder::new();
            let service = service(&config_with_model(), embedder.clone());
            save(service.coordinator(), Note::new("n1", "", "anything")).await;
            let calls = embedder.calls();

            let response = service
                .handle(EngineRequest::Search {
                    query: String::new(),
                    top_k: Some(5),
                })
                .await;
            assert!(response.success);
            assert_eq!(response.results.unwrap().len(), 0);
            assert_eq!(embedder.calls(), calls);
        }

        #[tokio::test]
        async fn test_rebuild_with_rate_limits_reports_success() {
            let embedder = FakeEmbedder::new();
            let service = service(&base_config(), embedder.clone());
            for i in 0..10 {
                let content = if i < 2 { "throttle me" } else { "fine" };
                save(service.coordinator(), Note::new(format!("n{}", i), "", content)).await;
            }
            service
                .handle(EngineRequest::SetEmbeddingModel {
                    model: Some(model()),
                })
                .await;
            embedder.throttle("throttle");

            let response = service.handle(EngineRequest::RebuildAllEmbeddings).await;
            assert!(response.success);
            let report = response.report.unwrap();
            assert_eq!((report.embedded, report.failed), (8, 2));

            let json: serde_json::Value =
                serde_json::from_str(&service.handle_json(r#"{"type":"GetIndexStatus"}"#).await)
                    .unwrap();
            assert_eq!(json["success"], true);
            assert_eq!(json["status"]["chunkCount"], 10);
            assert_eq!(json["status"]["missingCount"], 2);
        }

        #[tokio::test]
        async fn test_errors_are_reported_not_raised() {
            let service = service(&base_config(), FakeEmbedder::new());

            let response = service.handle(EngineRequest::UpdateMissingEmbeddings).await;
            assert!(!response.success);
            assert!(response.error.unwrap().contains("no active embedding model"));

            let json: serde_json::Value =
                serde_json::from_str(&service.handle_json("{\"type\":\"Explode\"}").await).unwrap();
            assert_eq!(json["success"], false);

            let response = service.handle(EngineRequest::RebuildLexicalIndex).await;
            assert!(response.success);
        }
    }

    mod sync_tests {
        use super::*;

        #[tokio::test]
        async fn test_apply_events() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            let sync = IndexSyncService::new(coordinator.clone());

            sync.apply(DocumentEvent::Saved(Note::new("n1", "", "hello world").into()))
                .unwrap();
            sync.apply(DocumentEvent::Saved(
                Conversation::new("c1", "", vec![Turn::new(Role::User, "hello from a chat turn")]).into(),
            ))
            .unwrap();
            assert!(coordinator.lexical_contains("notechunk_n1_0"));
            assert!(coordinator.lexical_contains("chatchunk_c1_0"));

            sync.apply(DocumentEvent::Deleted {
                kind: DocumentKind::Note,
                parent_id: "n1".into(),
            })
            .unwrap();
            assert!(!coordinator.lexical_contains("notechunk_n1_0"));

            sync.apply(DocumentEvent::AllDeleted {
                kind: DocumentKind::Chat,
            })
            .unwrap();
            assert!(coordinator.chunk_ids().unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_lagged_listener_reports_lost_events() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            let sync = IndexSyncService::new(coordinator.clone());
            let bus = EventBus::new(2);
            let receiver = bus.subscribe();
            for i in 0..4 {
                bus.emit_saved(Note::new(format!("n{}", i), "", format!("note number {}", i)));
            }
            drop(bus);

            sync.run(receiver).await;

            match coordinator.state() {
                CoordinatorState::Error(message) => assert!(message.contains("resync"), "{}", message),
                other => panic!("expected error state, got {:?}", other),
            }
            assert!(!coordinator.lexical_contains("notechunk_n0_0"));
            assert!(coordinator.lexical_contains("notechunk_n2_0"));
            assert!(coordinator.lexical_contains("notechunk_n3_0"));
        }

        #[tokio::test]
        async fn test_listener_follows_event_bus() {
            let coordinator = open(&base_config(), FakeEmbedder::new());
            let sync = IndexSyncService::new(coordinator.clone());
            let bus = EventBus::shared();
            let handle = sync.start(bus.clone());

            assert_eq!(bus.emit_saved(Note::new("n1", "", "from the bus")), 1);
            assert!(wait_for(|| coordinator.lexical_contains("notechunk_n1_0")).await);

            sync.set_enabled(false);
            bus.emit_saved(Note::new("n2", "", "ignored while disabled"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!coordinator.lexical_contains("notechunk_n2_0"));

            sync.set_enabled(true);
            bus.emit_deleted(DocumentKind::Note, "n1");
            assert!(wait_for(|| !coordinator.lexical_contains("notechunk_n1_0")).await);

            drop(bus);
            handle.await.unwrap();
        }
    }
}
