//! Pairing → collection → writing → resumption through the public API.

use async_trait::async_trait;
use polyeval::backend::{
    BackendKey, BackendKind, FixedBatchSize, ModelBackend, RawGeneration, SamplingConfig,
    ScoringSequence, TokenScores,
};
use polyeval::interface::GenerationLimits;
use polyeval::{
    BackendFactory, BackendRegistry, BatchCollector, CorrectnessLabel, Entry, InferenceResult,
    ModelFamily, PairBuilder, ResultType, ResultWriter, Task, Verdict, create_interface,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Always judges "A"; scores "A" above anything else.
struct AlwaysA {
    key: BackendKey,
}

impl AlwaysA {
    fn new(key: BackendKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl ModelBackend for AlwaysA {
    fn key(&self) -> &BackendKey {
        &self.key
    }

    fn supports_forward(&self) -> bool {
        true
    }

    async fn batched_generate(
        &self,
        prompts: &[String],
        _max_new_tokens: u32,
        _sampling: &SamplingConfig,
    ) -> polyeval::Result<Vec<RawGeneration>> {
        Ok(prompts.iter().map(|_| RawGeneration::text("Final answer: A")).collect())
    }

    async fn batched_forward(
        &self,
        sequences: &[ScoringSequence],
    ) -> polyeval::Result<Vec<TokenScores>> {
        Ok(sequences
            .iter()
            .map(|s| TokenScores::new(vec![if s.continuation == "A" { -0.05 } else { -2.0 }]))
            .collect())
    }

    async fn shutdown(&self) -> polyeval::Result<()> {
        Ok(())
    }
}

fn entry(id: &str, language: &str, label: CorrectnessLabel) -> Entry {
    Entry {
        id: id.to_string(),
        question: format!("Question {id}?"),
        choices: None,
        answer_index: None,
        answer_text: Some(format!("Answer {id}.")),
        language: language.to_string(),
        subject: Some("geography".to_string()),
        label,
    }
}

fn key() -> BackendKey {
    BackendKey::new("gpt-5", "cuda", BackendKind::Api, 1)
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count()
}

#[tokio::test]
async fn test_single_pair_written_once() {
    let en = vec![entry("en_1", "en", CorrectnessLabel::Correct)];
    let fr = vec![entry("fr_1", "fr", CorrectnessLabel::Incorrect)];

    let pairs = PairBuilder::combine(&en, &fr, "en", "fr").unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].lang_a(), "en");
    assert_eq!(pairs[0].lang_b(), "fr");

    let tasks: Vec<Task> = pairs.into_iter().map(Task::Pair).collect();
    let collection = BatchCollector::new(ResultType::PreferenceCot)
        .collect(
            tasks,
            Arc::new(AlwaysA::new(key())),
            create_interface(ModelFamily::ApiChat, GenerationLimits::default()),
            4,
        )
        .await;

    assert!(collection.failures.is_empty());
    let [InferenceResult::Comparison(result)] = collection.results.as_slice() else {
        panic!("expected one comparison, got {:?}", collection.results);
    };
    assert_eq!(result.pair_id, "en_1__fr_1");
    assert_eq!(result.verdict, Verdict::A);
    assert_eq!(result.preferred_correct(), Some(true));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("en_correct_fr_incorrect.jsonl");
    let writer = ResultWriter::new(&path);

    writer.append_and_rewrite(&collection.results).unwrap();
    assert_eq!(line_count(&path), 1);
    writer.append_and_rewrite(&collection.results).unwrap();
    assert_eq!(line_count(&path), 1);
}

#[tokio::test]
async fn test_pairing_ignores_argument_order() {
    let en: Vec<Entry> = (1..=3)
        .map(|i| entry(&format!("en_{i}"), "en", CorrectnessLabel::Correct))
        .collect();
    let sw: Vec<Entry> = (1..=3)
        .rev()
        .map(|i| entry(&format!("sw_{i}"), "sw", CorrectnessLabel::Incorrect))
        .collect();

    let forward = PairBuilder::combine(&en, &sw, "en", "sw").unwrap();
    let backward = PairBuilder::combine(&sw, &en, "sw", "en").unwrap();

    assert_eq!(forward, backward);
    let ids: Vec<String> = forward.iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec!["en_1__sw_1", "en_2__sw_2", "en_3__sw_3"]);
}

#[tokio::test]
async fn test_interrupted_run_resumes_to_same_records() {
    let en: Vec<Entry> = (1..=10)
        .map(|i| entry(&format!("en_{i}"), "en", CorrectnessLabel::Correct))
        .collect();
    let fr: Vec<Entry> = (1..=10)
        .map(|i| entry(&format!("fr_{i}"), "fr", CorrectnessLabel::Correct))
        .collect();
    let tasks: Vec<Task> = PairBuilder::combine(&en, &fr, "en", "fr")
        .unwrap()
        .into_iter()
        .map(Task::Pair)
        .collect();

    let backend: Arc<dyn ModelBackend> = Arc::new(AlwaysA::new(key()));
    let interface = create_interface(ModelFamily::ApiChat, GenerationLimits::default());
    let collector = BatchCollector::new(ResultType::PreferenceDirect);
    let dir = TempDir::new().unwrap();

    let run = |path: std::path::PathBuf, batches: usize| {
        let tasks = tasks.clone();
        let backend = Arc::clone(&backend);
        let interface = Arc::clone(&interface);
        let collector = collector.clone();
        async move {
            let writer = ResultWriter::new(path);
            let done = writer.existing_ids().unwrap();
            let pending: Vec<Task> = tasks
                .into_iter()
                .filter(|t| !done.contains(&t.id()))
                .collect();
            for chunk in pending.chunks(3).take(batches) {
                let collection = collector
                    .collect(chunk.to_vec(), Arc::clone(&backend), Arc::clone(&interface), 3)
                    .await;
                writer.append_and_rewrite(&collection.results).unwrap();
            }
        }
    };

    let uninterrupted = dir.path().join("uninterrupted.jsonl");
    run(uninterrupted.clone(), usize::MAX).await;

    let resumed = dir.path().join("resumed.jsonl");
    run(resumed.clone(), 2).await;
    assert_eq!(line_count(&resumed), 6);
    run(resumed.clone(), usize::MAX).await;

    let records = |path: &Path| -> Vec<(String, String)> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                (
                    value["pair_id"].as_str().unwrap().to_string(),
                    value["verdict"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    };
    assert_eq!(records(&resumed), records(&uninterrupted));
    assert_eq!(records(&resumed).len(), 10);
    assert_eq!(records(&resumed)[9].0, "en_10__fr_10");
}

/// Counts constructions so registry sharing is observable.
#[derive(Default)]
struct CountingFactory {
    built: AtomicUsize,
}

#[async_trait]
impl BackendFactory for CountingFactory {
    async fn create(&self, key: &BackendKey) -> polyeval::Result<Arc<dyn ModelBackend>> {
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(AlwaysA::new(key.clone())))
    }
}

#[tokio::test]
async fn test_registry_shares_instances_per_key() {
    let factory = Arc::new(CountingFactory::default());
    let registry = BackendRegistry::new(factory.clone(), Arc::new(FixedBatchSize(8)));

    let base = key();
    let same = registry.get_or_create(&base).await.unwrap();
    let again = registry.get_or_create(&key()).await.unwrap();
    assert!(Arc::ptr_eq(&same.backend, &again.backend));

    let variants = [
        BackendKey::new("gpt-5-mini", "cuda", BackendKind::Api, 1),
        BackendKey::new("gpt-5", "cpu", BackendKind::Api, 1),
        BackendKey::new("gpt-5", "cuda", BackendKind::Vllm, 1),
        BackendKey::new("gpt-5", "cuda", BackendKind::Api, 2),
    ];
    let mut seen = BTreeSet::new();
    for variant in &variants {
        let other = registry.get_or_create(variant).await.unwrap();
        assert!(!Arc::ptr_eq(&same.backend, &other.backend));
        seen.insert(other.backend.key().to_string());
    }
    assert_eq!(seen.len(), variants.len());
    assert_eq!(factory.built.load(Ordering::SeqCst), 5);
    assert_eq!(registry.shutdown_all().await, 5);
}
