use super::*;
use crate::config::PerformanceConfig;
use crate::plugins::{MockEmbedder, MockLlm, MockLoader, MockReranker, MockRetriever};
use crate::retry::RecordingSleeper;
use crate::testing::{EchoLlm, HashEmbedder, InMemoryRetriever, ReversingReranker, StaticLoader};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

struct Fixture {
    loader: Arc<StaticLoader>,
    embedder: Arc<HashEmbedder>,
    retriever: Arc<InMemoryRetriever>,
    reranker: Arc<ReversingReranker>,
    llm: Arc<EchoLlm>,
    sleeper: Arc<RecordingSleeper>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_parts(StaticLoader::new(corpus()), HashEmbedder::default(), EchoLlm::new())
    }

    fn with_parts(loader: StaticLoader, embedder: HashEmbedder, llm: EchoLlm) -> Self {
        Self {
            loader: Arc::new(loader),
            embedder: Arc::new(embedder),
            retriever: Arc::new(InMemoryRetriever::default()),
            reranker: Arc::new(ReversingReranker::default()),
            llm: Arc::new(llm),
            sleeper: RecordingSleeper::new(),
        }
    }

    fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::builder(config)
            .loader(self.loader.clone())
            .embedder(self.embedder.clone())
            .retriever(self.retriever.clone())
            .reranker(self.reranker.clone())
            .llm(self.llm.clone())
            .sleeper(self.sleeper.clone())
            .build()
            .unwrap()
    }
}

fn corpus() -> Vec<Document> {
    vec![
        Document::new("a", "alpha one\n\nalpha two"),
        Document::new("b", "beta"),
    ]
}

fn quiet() -> OrchestratorConfig {
    OrchestratorConfig::default().with_logging(false)
}

async fn collect<T>(mut stream: PipelineStream<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item);
    }
    items
}

#[tokio::test]
async fn test_ingest_stores_every_chunk() {
    let fx = Fixture::new();
    let summary = fx.orchestrator(quiet()).ingest("corpus/").await.unwrap();

    assert_eq!(summary.documents, 2);
    assert_eq!(summary.chunks, 3);
    let ids: Vec<String> = fx.retriever.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["a#0", "a#1", "b#0"]);
    assert_eq!(fx.loader.recorded_paths(), vec!["corpus/".to_string()]);
    assert_eq!(fx.embedder.call_count(), 1);
}

#[tokio::test]
async fn test_ingest_with_no_documents() {
    let fx = Fixture::with_parts(StaticLoader::empty(), HashEmbedder::default(), EchoLlm::new());
    let err = fx.orchestrator(quiet()).ingest("doc.pdf").await.unwrap_err();

    let message = err.to_string();
    assert!(message.starts_with("Ingestion failed:"), "{message}");
    assert!(message.contains("no documents"), "{message}");
    assert!(matches!(err.root(), PipelineError::StageContract(ref e) if e.stage == "load"), "{err}");
    assert_eq!(fx.embedder.call_count(), 0);
    assert_eq!(fx.retriever.store_calls(), 0);
}

#[tokio::test]
async fn test_ingest_with_no_chunks() {
    let fx = Fixture::with_parts(
        StaticLoader::new(vec![Document::new("blank", "  \n\n \n")]),
        HashEmbedder::default(),
        EchoLlm::new(),
    );
    let err = fx.orchestrator(quiet()).ingest("blank.txt").await.unwrap_err();

    assert!(err.to_string().contains("no chunks"), "{err}");
    assert!(matches!(err.root(), PipelineError::StageContract(ref e) if e.stage == "chunk"), "{err}");
    assert_eq!(fx.embedder.call_count(), 0);
}

#[tokio::test]
async fn test_ingest_rejects_empty_path() {
    let fx = Fixture::new();
    let err = fx.orchestrator(quiet()).ingest("  ").await.unwrap_err();

    assert!(matches!(err.root(), PipelineError::Validation(_)));
    assert_eq!(fx.loader.call_count(), 0);
}

#[tokio::test]
async fn test_vector_count_mismatch_is_contract_error() {
    let fx = Fixture::with_parts(
        StaticLoader::new(corpus()),
        HashEmbedder::new(4).dropping_last(),
        EchoLlm::new(),
    );
    let err = fx.orchestrator(quiet()).ingest("corpus/").await.unwrap_err();

    assert!(matches!(err.root(), PipelineError::StageContract(_)), "{err}");
    assert_eq!(fx.retriever.store_calls(), 0);
}

#[tokio::test]
async fn test_parallel_ingest_embeds_in_batches() {
    let fx = Fixture::new();
    let config = quiet()
        .with_parallel_processing(true)
        .with_performance(PerformanceConfig {
            batch_size: 2,
            ..PerformanceConfig::default()
        });
    let orchestrator = fx.orchestrator(config);

    let summary = orchestrator.ingest("corpus/").await.unwrap();

    assert_eq!(summary.chunks, 3);
    assert_eq!(fx.embedder.call_count(), 2);
    assert_eq!(fx.retriever.records().len(), 3);
    let stats = orchestrator.get_performance_stats();
    assert_eq!(stats.parallel.batches_run, 2);
    assert_eq!(stats.parallel.items_processed, 3);
}

#[tokio::test]
async fn test_parallel_ingest_retries_only_the_failed_batch() {
    let failed_once = Arc::new(AtomicBool::new(false));
    let embedded = Arc::new(AtomicUsize::new(0));
    let mut embedder = MockEmbedder::new();
    {
        let failed_once = failed_once.clone();
        let embedded = embedded.clone();
        embedder.expect_embed().returning(move |chunks| {
            if chunks.len() == 1 && chunks[0] == "beta" && !failed_once.swap(true, Ordering::SeqCst) {
                return Err(PipelineError::TransientIo("embedder busy".into()));
            }
            embedded.fetch_add(chunks.len(), Ordering::SeqCst);
            Ok(chunks.iter().map(|_| vec![1.0, 0.0]).collect())
        });
    }

    let fx = Fixture::new();
    let config = quiet()
        .with_parallel_processing(true)
        .with_performance(PerformanceConfig {
            batch_size: 2,
            max_concurrency: 1,
            ..PerformanceConfig::default()
        });
    let orchestrator = Orchestrator::builder(config)
        .loader(fx.loader.clone())
        .embedder(Arc::new(embedder))
        .retriever(fx.retriever.clone())
        .llm(fx.llm.clone())
        .sleeper(fx.sleeper.clone())
        .build()
        .unwrap();

    let summary = orchestrator.ingest("corpus/").await.unwrap();

    assert_eq!(summary.chunks, 3);
    // The succeeded batch is not embedded again.
    assert_eq!(embedded.load(Ordering::SeqCst), 3);
    assert_eq!(fx.sleeper.delays().len(), 1);
    assert_eq!(orchestrator.get_performance_stats().parallel.batches_run, 2);
}

#[tokio::test]
async fn test_transient_load_failure_is_retried() {
    let fx = Fixture::new();
    fx.loader
        .failures
        .fail_next(PipelineError::TransientIo("disk busy".into()));

    fx.orchestrator(quiet()).ingest("corpus/").await.unwrap();

    assert_eq!(fx.loader.call_count(), 2);
    assert_eq!(fx.sleeper.delays(), vec![Duration::from_millis(1000)]);
}

#[tokio::test]
async fn test_retry_can_be_disabled() {
    let fx = Fixture::new();
    fx.loader
        .failures
        .fail_next(PipelineError::TransientIo("disk busy".into()));

    let err = fx
        .orchestrator(quiet().with_retry(false))
        .ingest("corpus/")
        .await
        .unwrap_err();

    assert!(matches!(err.root(), PipelineError::TransientIo(_)));
    assert_eq!(fx.loader.call_count(), 1);
    assert!(fx.sleeper.delays().is_empty());
}

#[tokio::test]
async fn test_empty_prompt_invokes_no_collaborator() {
    // Mocks without expectations panic if called.
    let orchestrator = Orchestrator::builder(quiet())
        .loader(Arc::new(MockLoader::new()))
        .embedder(Arc::new(MockEmbedder::new()))
        .retriever(Arc::new(MockRetriever::new()))
        .reranker(Arc::new(MockReranker::new()))
        .llm(Arc::new(MockLlm::new()))
        .build()
        .unwrap();

    for prompt in ["", "   "] {
        let err = orchestrator.query(prompt).await.unwrap_err();
        assert!(matches!(err.root(), PipelineError::Validation(_)));
        assert!(err.to_string().starts_with("Query failed:"));
    }
}

#[tokio::test]
async fn test_query_after_ingest() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet());
    orchestrator.ingest("corpus/").await.unwrap();

    let answer = orchestrator.query("alpha").await.unwrap();

    assert_eq!(answer.answer, "Answer to 'alpha' using 3 documents");
    assert_eq!(answer.documents.len(), 3);
    assert_eq!(fx.llm.call_count(), 1);
    assert_eq!(fx.reranker.call_count(), 0);
}

#[tokio::test]
async fn test_query_reranks_when_enabled() {
    let fx = Fixture::new();
    let plain = fx.orchestrator(quiet());
    plain.ingest("corpus/").await.unwrap();
    let reranking = fx.orchestrator(quiet().with_reranker(true));

    let baseline = plain.query("alpha").await.unwrap();
    let reranked = reranking.query("alpha").await.unwrap();

    let mut expected = baseline.documents.clone();
    expected.reverse();
    assert_eq!(reranked.documents, expected);
    assert_eq!(fx.reranker.call_count(), 1);
}

#[tokio::test]
async fn test_rerank_must_preserve_length() {
    let fx = Fixture::new();
    let mut reranker = MockReranker::new();
    reranker.expect_rerank().times(1).returning(|_, mut docs| {
        docs.pop();
        Ok(docs)
    });
    let orchestrator = Orchestrator::builder(quiet().with_reranker(true))
        .loader(fx.loader.clone())
        .embedder(fx.embedder.clone())
        .retriever(fx.retriever.clone())
        .reranker(Arc::new(reranker))
        .llm(fx.llm.clone())
        .build()
        .unwrap();
    orchestrator.ingest("corpus/").await.unwrap();

    let err = orchestrator.query("alpha").await.unwrap_err();

    assert!(matches!(err.root(), PipelineError::StageContract(_)), "{err}");
    assert_eq!(fx.llm.call_count(), 0);
}

#[tokio::test]
async fn test_empty_generation_is_contract_error() {
    let fx = Fixture::with_parts(
        StaticLoader::new(corpus()),
        HashEmbedder::default(),
        EchoLlm::new().with_response("  "),
    );
    let err = fx.orchestrator(quiet()).query("alpha").await.unwrap_err();

    assert!(matches!(err.root(), PipelineError::StageContract(_)), "{err}");
}

#[tokio::test]
async fn test_query_stream_yields_tokens() {
    let fx = Fixture::with_parts(StaticLoader::new(corpus()), HashEmbedder::default(), EchoLlm::streaming());
    let orchestrator = fx.orchestrator(quiet());
    orchestrator.ingest("corpus/").await.unwrap();

    let events: Vec<QueryEvent> = collect(orchestrator.query_stream("alpha"))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let text: String = events.iter().filter_map(QueryEvent::text).collect();
    assert_eq!(text, "Answer to 'alpha' using 3 documents");
    let deltas = events.iter().filter(|e| e.text().is_some()).count();
    assert_eq!(deltas, 6);
    assert!(matches!(events.last(), Some(QueryEvent::Complete { tokens: 6, .. })));
}

#[tokio::test]
async fn test_query_stream_falls_back_to_single_delta() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet());

    let events: Vec<QueryEvent> = collect(orchestrator.query_stream("alpha"))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].text(), Some("Answer to 'alpha' using 0 documents"));
    assert!(matches!(events[1], QueryEvent::Complete { tokens: 1, .. }));
}

#[tokio::test]
async fn test_query_stream_truncates_at_token_limit() {
    let fx = Fixture::with_parts(StaticLoader::new(corpus()), HashEmbedder::default(), EchoLlm::streaming());
    let config = quiet()
        .with_streaming_safeguards(true)
        .with_performance(PerformanceConfig {
            token_limit: 2,
            ..PerformanceConfig::default()
        });

    let events: Vec<QueryEvent> = collect(fx.orchestrator(config).query_stream("alpha"))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].text(), Some("Answer "));
    assert_eq!(events[1].text(), Some("to "));
    assert_eq!(events[2], QueryEvent::Truncated { tokens: 2, limit: 2 });
}

#[tokio::test]
async fn test_query_stream_reports_failure() {
    let fx = Fixture::new();
    let items = collect(fx.orchestrator(quiet()).query_stream("")).await;

    assert_eq!(items.len(), 1);
    let err = items[0].as_ref().unwrap_err();
    assert!(err.to_string().starts_with("Query failed:"));
    assert!(matches!(err.root(), PipelineError::Validation(_)));
}

#[tokio::test]
async fn test_ingest_stream_reports_each_chunk() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet());
    let events = collect(orchestrator.ingest_stream("corpus/")).await;

    assert_eq!(events.len(), 4);
    for (i, event) in events[..3].iter().enumerate() {
        match event {
            IngestEvent::ChunkProcessed {
                processed, progress, error, ..
            } => {
                assert!(processed);
                assert!(error.is_none());
                assert_eq!(progress.processed, i + 1);
                assert_eq!(progress.total, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    match &events[3] {
        IngestEvent::Complete {
            total,
            processed,
            failed,
            success_rate,
            ..
        } => {
            assert_eq!((*total, *processed, *failed), (3, 3, 0));
            assert!((success_rate - 100.0).abs() < f64::EPSILON);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(fx.retriever.records().len(), 3);

    let stats = orchestrator.get_performance_stats();
    assert_eq!(stats.streaming.total_streams, 1);
    assert_eq!(stats.streaming.events_emitted, 4);
}

#[tokio::test]
async fn test_ingest_stream_continues_past_chunk_failure() {
    let fx = Fixture::new();
    fx.embedder
        .failures
        .fail_next(PipelineError::collaborator("unsupported characters"));

    let events = collect(fx.orchestrator(quiet()).ingest_stream("corpus/")).await;

    assert_eq!(events.len(), 4);
    match &events[0] {
        IngestEvent::ChunkProcessed { processed, error, .. } => {
            assert!(!processed);
            assert!(error.as_deref().unwrap_or_default().contains("unsupported characters"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        events[3],
        IngestEvent::Complete {
            processed: 2,
            failed: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_ingest_stream_stops_on_fatal_error() {
    let fx = Fixture::new();
    fx.retriever
        .store_failures
        .fail_always(PipelineError::Unavailable("store offline".into()));

    let events = collect(fx.orchestrator(quiet()).ingest_stream("corpus/")).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        IngestEvent::Error { message } => {
            assert!(message.starts_with("Ingestion failed:"), "{message}");
            assert!(message.contains("store offline"), "{message}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(fx.retriever.store_calls(), 1);
}

#[tokio::test]
async fn test_ingest_stream_without_documents() {
    let fx = Fixture::with_parts(StaticLoader::empty(), HashEmbedder::default(), EchoLlm::new());
    let events = collect(fx.orchestrator(quiet()).ingest_stream("doc.pdf")).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], IngestEvent::Error { message } if message.contains("no documents")));
}

#[tokio::test]
async fn test_dropping_stream_stops_producer() {
    let words = vec!["word"; 200].join(" ");
    let fx = Fixture::with_parts(
        StaticLoader::new(corpus()),
        HashEmbedder::default(),
        EchoLlm::streaming()
            .with_response(words)
            .with_token_delay(Duration::from_millis(1)),
    );
    let orchestrator = fx.orchestrator(quiet());

    let mut stream = orchestrator.query_stream("alpha");
    assert!(stream.next().await.is_some());
    drop(stream);

    for _ in 0..200 {
        if orchestrator.get_performance_stats().streaming.active_streams == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = orchestrator.get_performance_stats();
    assert_eq!(stats.streaming.active_streams, 0);
    assert!(stats.streaming.events_emitted < 200);
}

#[tokio::test]
async fn test_undrained_stream_keeps_buffered_events_visible() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet().with_streaming_safeguards(true));
    let stream = orchestrator.ingest_stream("corpus/");

    for _ in 0..200 {
        if orchestrator.get_performance_stats().streaming.events_emitted == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = orchestrator.get_performance_stats();
    assert_eq!(stats.streaming.events_emitted, 4);
    assert_eq!(stats.streaming.active_streams, 1);
    assert_eq!(stats.memory.buffered_items, 4);
    assert_eq!(stats.memory.buffered_items, stream.controller().status().buffer_size);

    let events = collect(stream).await;
    assert_eq!(events.len(), 4);

    for _ in 0..200 {
        if orchestrator.get_performance_stats().streaming.active_streams == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = orchestrator.get_performance_stats();
    assert_eq!(stats.streaming.active_streams, 0);
    assert_eq!(stats.memory.buffered_items, 0);
    assert_eq!(stats.streaming.backpressure.enqueued, 4);
    assert_eq!(stats.streaming.backpressure.dequeued, 4);
}

#[tokio::test]
async fn test_query_graph_is_built_once() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet().with_reranker(true));
    let first = orchestrator.query_graph().unwrap();

    orchestrator.ingest("corpus/").await.unwrap();
    orchestrator.query_via_graph("alpha").await.unwrap();
    orchestrator.query_via_graph("beta").await.unwrap();

    let second = orchestrator.clone().query_graph().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_query_graph_outliving_orchestrator() {
    let fx = Fixture::new();
    let graph = fx.orchestrator(quiet()).query_graph().unwrap();

    let failure = Scheduler::new(graph)
        .execute(json!({ "prompt": "alpha" }), ExecuteOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(failure.error.root(), PipelineError::Unavailable(_)), "{}", failure.error);
    assert_eq!(fx.embedder.call_count(), 0);
}

#[tokio::test]
async fn test_query_graph_shape_follows_reranker_setting() {
    let fx = Fixture::new();

    let plain = fx.orchestrator(quiet()).query_graph().unwrap();
    assert_eq!(plain.len(), 3);
    assert!(!plain.contains(RERANK_NODE));
    assert_eq!(
        plain.topological_order().unwrap(),
        &[EMBED_QUERY_NODE, RETRIEVE_NODE, GENERATE_NODE]
    );

    let reranking = fx.orchestrator(quiet().with_reranker(true)).query_graph().unwrap();
    assert_eq!(reranking.len(), 4);
    assert!(reranking.node(RERANK_NODE).unwrap().optional);
    assert_eq!(reranking.required_nodes(), &[GENERATE_NODE.to_string()]);
}

#[tokio::test]
async fn test_query_via_graph_matches_query() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet().with_reranker(true));
    orchestrator.ingest("corpus/").await.unwrap();

    let direct = orchestrator.query("alpha").await.unwrap();
    let via_graph = orchestrator.query_via_graph("alpha").await.unwrap();

    assert_eq!(via_graph.answer, direct.answer);
    assert_eq!(via_graph.documents, direct.documents);
}

#[tokio::test]
async fn test_graph_tolerates_rerank_failure() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(quiet().with_reranker(true));
    orchestrator.ingest("corpus/").await.unwrap();
    let retrieved = fx.orchestrator(quiet()).query("alpha").await.unwrap().documents;
    fx.reranker
        .failures
        .fail_always(PipelineError::collaborator("reranker down"));

    let answer = orchestrator.query_via_graph("alpha").await.unwrap();
    assert_eq!(answer.documents, retrieved);

    let err = orchestrator.query("alpha").await.unwrap_err();
    assert!(err.to_string().contains("reranker down"));
}

#[tokio::test]
async fn test_query_via_graph_rejects_empty_prompt() {
    let fx = Fixture::new();
    let err = fx.orchestrator(quiet()).query_via_graph("").await.unwrap_err();

    assert!(matches!(err.root(), PipelineError::Validation(_)));
    assert_eq!(fx.retriever.retrieve_calls(), 0);
}

#[test]
fn test_get_config_reports_capabilities() {
    let fx = Fixture::with_parts(StaticLoader::empty(), HashEmbedder::default(), EchoLlm::streaming());
    let snapshot = fx.orchestrator(quiet().with_reranker(true)).get_config();

    assert!(snapshot.has_reranker);
    assert!(snapshot.supports_streaming);
    assert!(snapshot.config.use_reranker);

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["hasReranker"], true);
    assert_eq!(json["useReranker"], true);
    assert_eq!(json["performance"]["maxConcurrency"], 3);
}

#[test]
fn test_builder_requires_collaborators() {
    let err = Orchestrator::builder(quiet())
        .loader(Arc::new(StaticLoader::empty()))
        .embedder(Arc::new(HashEmbedder::default()))
        .retriever(Arc::new(InMemoryRetriever::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, PipelineError::Config(ref m) if m.contains("no llm configured")));

    let invalid = OrchestratorConfig {
        performance: PerformanceConfig {
            batch_size: 0,
            ..PerformanceConfig::default()
        },
        ..OrchestratorConfig::default()
    };
    let err = Orchestrator::builder(invalid).build().unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[tokio::test]
async fn test_from_registry() {
    let registry = PluginRegistry::new();
    registry.register_loader("static", Arc::new(StaticLoader::new(corpus())));
    registry.register_embedder("hash", Arc::new(HashEmbedder::default()));
    registry.register_retriever("memory", Arc::new(InMemoryRetriever::default()));
    registry.register_llm("echo", Arc::new(EchoLlm::new()));

    let selection = PluginSelection::new("static", "hash", "memory", "echo");
    let orchestrator = Orchestrator::from_registry(&registry, &selection, quiet()).unwrap();
    orchestrator.ingest("corpus/").await.unwrap();
    let answer = orchestrator.query("beta").await.unwrap();
    assert_eq!(answer.documents.len(), 3);
    assert!(!orchestrator.get_config().has_reranker);

    let err = Orchestrator::from_registry(&registry, &selection.with_reranker("cohere"), quiet())
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownPlugin { ref name, .. } if name == "cohere"));
}
