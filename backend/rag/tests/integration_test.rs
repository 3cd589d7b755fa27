//! End-to-end tests: directory knowledge base, local model behind the
//! resource manager, routed through the model router.

use anyhow::Result;
use localrag_core::{ConnectionParams, RagConfig, RagError, StopSignal};
use localrag_llm::{
    ManagedModel, ManagerOptions, ModelCatalog, ModelLoader, ModelRouter, LocalModelCaller,
    ResourceManager, StreamingClient, TextGenerator,
};
use localrag_rag::{DirectoryRetriever, QueryRequest, QueryUpdate, RagQueryManager};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct ScriptedModel {
    ready: bool,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ManagedModel for ScriptedModel {
    fn initialize(&mut self) -> Result<()> {
        self.ready = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.ready
    }

    fn cleanup(&mut self) {
        self.ready = false;
    }
}

impl TextGenerator for ScriptedModel {
    fn generate(&mut self, prompt: &str, on_token: &mut dyn FnMut(&str) -> bool) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut text = String::new();
        for token in ["Ownership ", "rules."] {
            if !on_token(token) {
                break;
            }
            text.push_str(token);
        }
        Ok(text)
    }
}

struct ScriptedLoader {
    prompts: Arc<Mutex<Vec<String>>>,
    loads: Arc<AtomicUsize>,
}

impl ModelLoader for ScriptedLoader {
    type Model = ScriptedModel;

    fn load(&self, _key: &str) -> Result<ScriptedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModel {
            ready: false,
            prompts: self.prompts.clone(),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    rag: RagQueryManager,
    manager: Arc<ResourceManager<ScriptedLoader>>,
    prompts: Arc<Mutex<Vec<String>>>,
    loads: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = RagConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let kb = config.knowledge_base_dir().join("rust-book");
    fs::create_dir_all(&kb).unwrap();
    fs::write(kb.join("01-ownership.txt"), "Each value has one owner.").unwrap();
    fs::create_dir_all(config.models_dir().join("tiny")).unwrap();

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let loads = Arc::new(AtomicUsize::new(0));
    let stop = StopSignal::new();
    let manager = Arc::new(ResourceManager::with_options(
        ScriptedLoader {
            prompts: prompts.clone(),
            loads: loads.clone(),
        },
        ManagerOptions {
            stop: stop.clone(),
            ..ManagerOptions::from_config(&config)
        },
    ));
    let local = LocalModelCaller::new(manager.clone(), ModelCatalog::new(config.models_dir()));
    let http = StreamingClient::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
    let router = ModelRouter::new(http).with_local(Arc::new(local));

    let rag = RagQueryManager::new(
        Arc::new(router),
        Arc::new(DirectoryRetriever::from_config(&config)),
        &config,
    )
    .with_stop_signal(stop);

    Fixture {
        _dir: dir,
        rag,
        manager,
        prompts,
        loads,
    }
}

fn request(kb: &str) -> QueryRequest {
    QueryRequest {
        params: ConnectionParams {
            endpoint: "local".into(),
            credential: String::new(),
            model_id: "tiny".into(),
        },
        knowledge_base: kb.into(),
        system_prompt: "Answer from the notes.".into(),
        user_prompt: "Who owns a value?".into(),
    }
}

#[tokio::test]
async fn test_local_pipeline_with_knowledge_base() {
    let fx = fixture();
    let mut updates = Vec::new();
    let outcome = fx
        .rag
        .execute_rag_query(request("rust-book"))
        .drain(|u| updates.push(u))
        .await;

    assert_eq!(outcome.unwrap(), "Ownership rules.");

    let chunks: Vec<_> = updates
        .iter()
        .filter_map(|u| match u {
            QueryUpdate::Chunk(c) => Some(c.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["Ownership ", "rules."]);

    // All progress precedes the first chunk.
    let first_chunk = updates
        .iter()
        .position(|u| matches!(u, QueryUpdate::Chunk(_)))
        .unwrap();
    assert_eq!(first_chunk, 4);
    match &updates[3] {
        QueryUpdate::Progress(p) => assert_eq!(p.detail, "API type: Local model"),
        other => panic!("unexpected update {:?}", other),
    }

    assert_eq!(
        fx.prompts.lock().unwrap()[0],
        "System: Answer from the notes.\n\nRelevant knowledge: Each value has one owner.\n\n\nUser: Who owns a value?"
    );
    assert!(fx.manager.has_resource());
    assert!(!fx.manager.is_busy());
}

#[tokio::test]
async fn test_repeated_queries_reuse_the_model() {
    let fx = fixture();
    for _ in 0..2 {
        let outcome = fx.rag.execute_rag_query(request("none")).finish().await;
        assert!(outcome.is_ok());
    }
    let key = fx.manager.current_key().unwrap();
    assert!(key.ends_with("tiny"));
    assert_eq!(fx.prompts.lock().unwrap().len(), 2);
    assert_eq!(fx.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_knowledge_base_never_loads_model() {
    let fx = fixture();
    let outcome = fx.rag.execute_rag_query(request("nope")).finish().await;

    assert!(matches!(
        outcome,
        Err(RagError::StageFailure { ref stage, .. }) if stage == "retrieve"
    ));
    assert!(!fx.manager.has_resource());
    assert_eq!(fx.loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_busy_model_is_reported_as_busy() {
    let fx = fixture();
    assert!(fx.manager.mark_in_use());

    let outcome = fx.rag.execute_rag_query(request("none")).finish().await;
    assert_eq!(outcome, Err(RagError::ResourceBusy));
    assert!(fx.prompts.lock().unwrap().is_empty());

    fx.manager.mark_not_in_use();
    assert!(fx.rag.execute_rag_query(request("none")).finish().await.is_ok());
}
