//! Query pipeline: optional retrieval, prompt assembly, streamed model call.
//!
//! Every invocation runs as one background task and ends in exactly one
//! outcome. Progress and stream chunks arrive as task updates, all of them
//! before the outcome.

use futures::FutureExt;
use localrag_core::error::stage;
use localrag_core::{
    task, ChunkSink, ConnectionParams, ModelCaller, Progress, RagConfig, RagError, Retriever,
    StopSignal, TaskHandle, TaskReporter,
};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::prompt::build_prompt;

pub const STAGE_QUERYING: &str = "Querying knowledge base...";
pub const STAGE_BUILDING_PROMPT: &str = "Building prompt...";
pub const STAGE_CALLING_MODEL: &str = "Calling LLM API...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryUpdate {
    Progress(Progress),
    Chunk(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub params: ConnectionParams,
    /// Knowledge base to search, or one of the "no retrieval" sentinels
    pub knowledge_base: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Callback-style view of a query, for callers that prefer it over a handle.
pub trait RagQueryCallback: Send {
    fn on_progress_update(&mut self, stage: &str, detail: &str);
    fn on_streaming_data(&mut self, chunk: &str);
    fn on_query_completed(&mut self, response: &str);
    fn on_query_error(&mut self, error: &str);
}

/// Feed every update of `handle` to `callback`, then exactly one of its
/// terminal methods.
pub async fn drive_callback<C>(handle: TaskHandle<QueryUpdate, String>, callback: &mut C)
where
    C: RagQueryCallback + ?Sized,
{
    let outcome = handle
        .drain(|update| match update {
            QueryUpdate::Progress(p) => callback.on_progress_update(&p.stage, &p.detail),
            QueryUpdate::Chunk(chunk) => callback.on_streaming_data(&chunk),
        })
        .await;

    match outcome {
        Ok(response) => callback.on_query_completed(&response),
        Err(e) => callback.on_query_error(&e.to_string()),
    }
}

pub struct RagQueryManager {
    model: Arc<dyn ModelCaller>,
    retriever: Arc<dyn Retriever>,
    config: RagConfig,
    stop: StopSignal,
}

impl RagQueryManager {
    pub fn new(
        model: Arc<dyn ModelCaller>,
        retriever: Arc<dyn Retriever>,
        config: &RagConfig,
    ) -> Self {
        Self {
            model,
            retriever,
            config: config.clone(),
            stop: StopSignal::global(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// True when `knowledge_base` selects the direct path.
    pub fn is_direct(&self, knowledge_base: &str) -> bool {
        self.config.is_no_retrieval(knowledge_base)
    }

    /// Start a query. Must be called from inside a tokio runtime.
    pub fn execute_rag_query(&self, request: QueryRequest) -> TaskHandle<QueryUpdate, String> {
        if request.user_prompt.trim().is_empty() {
            return TaskHandle::rejected(RagError::invalid_input("query empty"));
        }

        let (reporter, handle) = task();
        let run = QueryRun {
            model: self.model.clone(),
            retriever: self.retriever.clone(),
            stop: self.stop.clone(),
            direct: self.is_direct(&request.knowledge_base),
            request,
        };

        let span = info_span!("rag_query", query_id = %Uuid::new_v4());
        tokio::spawn(
            async move {
                // A panicking collaborator still yields exactly one outcome.
                let outcome = AssertUnwindSafe(run.execute(&reporter))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(RagError::from_panic(payload)));
                match &outcome {
                    Ok(response) => info!("Query completed, {} characters", response.len()),
                    Err(e) => warn!("Query failed: {}", e),
                }
                reporter.finish(outcome);
            }
            .instrument(span),
        );

        handle
    }

    /// [`Self::execute_rag_query`] reported through a callback.
    pub fn execute_with_callback<C>(&self, request: QueryRequest, mut callback: C) -> JoinHandle<()>
    where
        C: RagQueryCallback + 'static,
    {
        let handle = self.execute_rag_query(request);
        tokio::spawn(async move { drive_callback(handle, &mut callback).await })
    }
}

struct QueryRun {
    model: Arc<dyn ModelCaller>,
    retriever: Arc<dyn Retriever>,
    stop: StopSignal,
    direct: bool,
    request: QueryRequest,
}

type Reporter = TaskReporter<QueryUpdate, String>;

fn progress(reporter: &Reporter, stage: &str, detail: impl Into<String>) {
    reporter.update(QueryUpdate::Progress(Progress::new(stage, detail)));
}

/// Attach stage context to a collaborator error. Errors with their own
/// meaning for the caller pass through.
fn stage_error(stage_name: &str, err: RagError) -> RagError {
    match err {
        RagError::StoppedByUser | RagError::ResourceBusy | RagError::StageFailure { .. } => err,
        RagError::Unexpected(message) => RagError::stage(stage_name, message),
        other => RagError::stage(stage_name, other.to_string()),
    }
}

impl QueryRun {
    async fn execute(self, reporter: &Reporter) -> Result<String, RagError> {
        let QueryRequest {
            params,
            knowledge_base,
            system_prompt,
            user_prompt,
        } = &self.request;

        let prompt = if self.direct {
            debug!("Not using knowledge base, building prompt directly");
            progress(
                reporter,
                STAGE_BUILDING_PROMPT,
                "Not using knowledge base, building prompt directly",
            );
            build_prompt(system_prompt, None, user_prompt)
        } else {
            progress(
                reporter,
                STAGE_QUERYING,
                format!("Knowledge base: {}", knowledge_base),
            );
            self.stop.checkpoint()?;

            let context = self
                .retriever
                .retrieve(knowledge_base, user_prompt)
                .await
                .map_err(|e| stage_error(stage::RETRIEVE, e))?;
            info!("Retrieved {} characters from {}", context.chars().count(), knowledge_base);
            progress(
                reporter,
                STAGE_QUERYING,
                format!(
                    "Retrieved {} characters from knowledge base",
                    context.chars().count()
                ),
            );

            progress(
                reporter,
                STAGE_BUILDING_PROMPT,
                "Building complete prompt with knowledge base content",
            );
            build_prompt(system_prompt, Some(&context), user_prompt)
        };

        self.stop.checkpoint()?;
        progress(
            reporter,
            STAGE_CALLING_MODEL,
            format!("API type: {}", self.model.provider_name(&params.endpoint)),
        );

        // Returning false asks the caller to stop streaming.
        let refused = AtomicBool::new(false);
        let sink = ChunkSink::new(|chunk| {
            if !reporter.update(QueryUpdate::Chunk(chunk)) {
                return false;
            }
            if self.stop.is_stop_requested() {
                refused.store(true, Ordering::SeqCst);
                return false;
            }
            true
        });
        let result = self.model.call(params, &prompt, &sink).await;
        if refused.load(Ordering::SeqCst) {
            debug!("Stop requested during model call");
            return Err(RagError::StoppedByUser);
        }
        result.map_err(|e| stage_error(stage::CALL_MODEL, RagError::from(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct SpyRetriever {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Retriever for SpyRetriever {
        async fn retrieve(&self, knowledge_base: &str, _query: &str) -> Result<String, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RagError::ResourceNotFound(format!(
                    "knowledge base '{}' does not exist",
                    knowledge_base
                )));
            }
            Ok("Rust has no GC.\n".to_string())
        }
    }

    #[derive(Default)]
    struct SpyModel {
        prompts: Mutex<Vec<String>>,
        error: Option<&'static str>,
    }

    #[async_trait]
    impl ModelCaller for SpyModel {
        fn provider_name(&self, _endpoint: &str) -> String {
            "Spy".into()
        }

        async fn call(
            &self,
            _params: &ConnectionParams,
            prompt: &str,
            sink: &ChunkSink<'_>,
        ) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            sink.send("Hel");
            sink.send("lo");
            if let Some(error) = self.error {
                bail!(error);
            }
            Ok("Hello".to_string())
        }
    }

    fn manager(model: Arc<SpyModel>, retriever: Arc<SpyRetriever>) -> RagQueryManager {
        RagQueryManager::new(model, retriever, &RagConfig::default())
            .with_stop_signal(StopSignal::new())
    }

    fn request(kb: &str) -> QueryRequest {
        QueryRequest {
            params: ConnectionParams {
                endpoint: "https://api.deepseek.com".into(),
                credential: "sk".into(),
                model_id: "deepseek-chat".into(),
            },
            knowledge_base: kb.into(),
            system_prompt: "Be brief.".into(),
            user_prompt: "What is Rust?".into(),
        }
    }

    async fn collect(
        handle: TaskHandle<QueryUpdate, String>,
    ) -> (Vec<Progress>, Vec<String>, Result<String, RagError>) {
        let mut progress = Vec::new();
        let mut chunks = Vec::new();
        let outcome = handle
            .drain(|u| match u {
                QueryUpdate::Progress(p) => progress.push(p),
                QueryUpdate::Chunk(c) => chunks.push(c),
            })
            .await;
        (progress, chunks, outcome)
    }

    #[tokio::test]
    async fn test_sentinels_skip_retrieval() {
        for kb in ["none", "No available knowledge base"] {
            let model = Arc::new(SpyModel::default());
            let retriever = Arc::new(SpyRetriever::default());
            let rag = manager(model.clone(), retriever.clone());

            let (progress, chunks, outcome) = collect(rag.execute_rag_query(request(kb))).await;

            assert_eq!(outcome.unwrap(), "Hello");
            assert_eq!(chunks, vec!["Hel", "lo"]);
            assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
            let stages: Vec<_> = progress.iter().map(|p| p.stage.as_str()).collect();
            assert_eq!(stages, vec![STAGE_BUILDING_PROMPT, STAGE_CALLING_MODEL]);
            assert_eq!(progress[1].detail, "API type: Spy");
            assert_eq!(
                model.prompts.lock().unwrap()[0],
                "System: Be brief.\n\nUser: What is Rust?"
            );
        }
    }

    #[tokio::test]
    async fn test_sentinel_match_is_case_sensitive() {
        let retriever = Arc::new(SpyRetriever::default());
        let rag = manager(Arc::new(SpyModel::default()), retriever.clone());
        assert!(!rag.is_direct("None"));

        let (_, _, outcome) = collect(rag.execute_rag_query(request("None"))).await;
        assert!(outcome.is_ok());
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retrieve_path_order() {
        let model = Arc::new(SpyModel::default());
        let retriever = Arc::new(SpyRetriever::default());
        let rag = manager(model.clone(), retriever.clone());

        let (progress, chunks, outcome) = collect(rag.execute_rag_query(request("docs"))).await;

        assert_eq!(outcome.unwrap(), "Hello");
        assert_eq!(chunks, vec!["Hel", "lo"]);
        let stages: Vec<_> = progress.iter().map(|p| p.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                STAGE_QUERYING,
                STAGE_QUERYING,
                STAGE_BUILDING_PROMPT,
                STAGE_CALLING_MODEL
            ]
        );
        assert_eq!(progress[0].detail, "Knowledge base: docs");
        assert_eq!(
            progress[1].detail,
            "Retrieved 16 characters from knowledge base"
        );
        assert_eq!(
            model.prompts.lock().unwrap()[0],
            "System: Be brief.\n\nRelevant knowledge: Rust has no GC.\n\n\nUser: What is Rust?"
        );
    }

    #[tokio::test]
    async fn test_retrieval_failure_skips_model() {
        let model = Arc::new(SpyModel::default());
        let retriever = Arc::new(SpyRetriever {
            fail: true,
            ..Default::default()
        });
        let rag = manager(model.clone(), retriever);

        let (progress, chunks, outcome) = collect(rag.execute_rag_query(request("gone"))).await;

        assert!(matches!(
            outcome,
            Err(RagError::StageFailure { ref stage, ref message })
                if stage == "retrieve" && message.contains("'gone' does not exist")
        ));
        assert!(chunks.is_empty());
        assert_eq!(progress.len(), 1);
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_error_after_chunks() {
        let model = Arc::new(SpyModel {
            error: Some("Request failed, status code: 401"),
            ..Default::default()
        });
        let rag = manager(model, Arc::new(SpyRetriever::default()));

        let (_, chunks, outcome) = collect(rag.execute_rag_query(request("none"))).await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
        assert_eq!(
            outcome,
            Err(RagError::stage(
                "call_model",
                "Request failed, status code: 401"
            ))
        );
    }

    #[tokio::test]
    async fn test_stop_before_model_call() {
        let model = Arc::new(SpyModel::default());
        let stop = StopSignal::new();
        stop.set_stop(true);
        let rag = manager(model.clone(), Arc::new(SpyRetriever::default())).with_stop_signal(stop);

        let (_, _, outcome) = collect(rag.execute_rag_query(request("none"))).await;
        assert_eq!(outcome, Err(RagError::StoppedByUser));
        assert!(model.prompts.lock().unwrap().is_empty());
    }

    /// Streams "Hel" and "lo", raising the stop flag either before the first
    /// chunk or after the last one.
    struct StoppingModel {
        stop: StopSignal,
        stop_first: bool,
    }

    #[async_trait]
    impl ModelCaller for StoppingModel {
        fn provider_name(&self, _endpoint: &str) -> String {
            "Spy".into()
        }

        async fn call(
            &self,
            _params: &ConnectionParams,
            _prompt: &str,
            sink: &ChunkSink<'_>,
        ) -> anyhow::Result<String> {
            if self.stop_first {
                self.stop.set_stop(true);
            }
            let mut text = String::new();
            for chunk in ["Hel", "lo"] {
                text.push_str(chunk);
                if !sink.send(chunk) {
                    break;
                }
            }
            self.stop.set_stop(true);
            Ok(text)
        }
    }

    #[tokio::test]
    async fn test_stop_during_stream_ends_query() {
        let stop = StopSignal::new();
        let model = Arc::new(StoppingModel {
            stop: stop.clone(),
            stop_first: true,
        });
        let retriever = Arc::new(SpyRetriever::default());
        let rag = RagQueryManager::new(model, retriever, &RagConfig::default())
            .with_stop_signal(stop);

        let (_, chunks, outcome) = collect(rag.execute_rag_query(request("none"))).await;
        assert_eq!(chunks, vec!["Hel"]);
        assert_eq!(outcome, Err(RagError::StoppedByUser));
    }

    #[tokio::test]
    async fn test_stop_after_stream_keeps_answer() {
        let stop = StopSignal::new();
        let model = Arc::new(StoppingModel {
            stop: stop.clone(),
            stop_first: false,
        });
        let retriever = Arc::new(SpyRetriever::default());
        let rag = RagQueryManager::new(model, retriever, &RagConfig::default())
            .with_stop_signal(stop);

        let (_, chunks, outcome) = collect(rag.execute_rag_query(request("none"))).await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
        assert_eq!(outcome, Ok("Hello".to_string()));
    }

    struct PanickingModel;

    #[async_trait]
    impl ModelCaller for PanickingModel {
        fn provider_name(&self, _endpoint: &str) -> String {
            "Spy".into()
        }

        async fn call(
            &self,
            _params: &ConnectionParams,
            _prompt: &str,
            sink: &ChunkSink<'_>,
        ) -> anyhow::Result<String> {
            sink.send("partial");
            panic!("model caller exploded");
        }
    }

    struct PanickingRetriever;

    #[async_trait]
    impl Retriever for PanickingRetriever {
        async fn retrieve(&self, _knowledge_base: &str, _query: &str) -> Result<String, RagError> {
            panic!("index corrupted");
        }
    }

    #[tokio::test]
    async fn test_panicking_model_caller_reports_once() {
        let rag = RagQueryManager::new(
            Arc::new(PanickingModel),
            Arc::new(SpyRetriever::default()),
            &RagConfig::default(),
        )
        .with_stop_signal(StopSignal::new());

        let (_, chunks, outcome) = collect(rag.execute_rag_query(request("none"))).await;
        assert_eq!(chunks, vec!["partial"]);
        assert_eq!(
            outcome,
            Err(RagError::Unexpected("model caller exploded".into()))
        );
    }

    #[tokio::test]
    async fn test_panicking_retriever_reports_once() {
        let rag = RagQueryManager::new(
            Arc::new(SpyModel::default()),
            Arc::new(PanickingRetriever),
            &RagConfig::default(),
        )
        .with_stop_signal(StopSignal::new());
        let recorder = Recorder::default();
        let events = recorder.events.clone();

        rag.execute_with_callback(request("docs"), recorder)
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                format!("progress:{}", STAGE_QUERYING),
                "error:unexpected error: index corrupted".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let rag = manager(Arc::new(SpyModel::default()), Arc::new(SpyRetriever::default()));
        let mut req = request("none");
        req.user_prompt = "   ".into();
        let (progress, _, outcome) = collect(rag.execute_rag_query(req)).await;
        assert!(progress.is_empty());
        assert_eq!(outcome, Err(RagError::invalid_input("query empty")));
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RagQueryCallback for Recorder {
        fn on_progress_update(&mut self, stage: &str, _detail: &str) {
            self.events.lock().unwrap().push(format!("progress:{}", stage));
        }
        fn on_streaming_data(&mut self, chunk: &str) {
            self.events.lock().unwrap().push(format!("chunk:{}", chunk));
        }
        fn on_query_completed(&mut self, response: &str) {
            self.events.lock().unwrap().push(format!("done:{}", response));
        }
        fn on_query_error(&mut self, error: &str) {
            self.events.lock().unwrap().push(format!("error:{}", error));
        }
    }

    #[tokio::test]
    async fn test_callback_sees_one_terminal() {
        let rag = manager(Arc::new(SpyModel::default()), Arc::new(SpyRetriever::default()));
        let recorder = Recorder::default();
        let events = recorder.events.clone();

        rag.execute_with_callback(request("none"), recorder)
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                format!("progress:{}", STAGE_BUILDING_PROMPT),
                format!("progress:{}", STAGE_CALLING_MODEL),
                "chunk:Hel".to_string(),
                "chunk:lo".to_string(),
                "done:Hello".to_string(),
            ]
        );
    }
}
