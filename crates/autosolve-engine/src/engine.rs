use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autosolve_core::{
    AttemptStatus, AttemptUpdate, AutoSolveConfig, AutoSolveError, CapturedOutput, FailureKind,
    Language, LanguageProfile, LanguageRegistry, Result, SolveAttempt, SolveMethod, SolveRequest,
    TemplateStore,
};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::codegen::{ChallengeContext, CodeGenerator};
use crate::detector::LanguageDetector;
use crate::executor::CodeExecutor;
use crate::extractor::TokenExtractor;
use crate::ollama::OllamaCodeGenerator;
use crate::store::{AttemptStore, MemoryAttemptStore};
use crate::workspace::{Workspace, WorkspaceManager};

/// Progress of one attempt, for callers that want more than the final record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptEvent {
    Created { attempt_id: String, language: Language },
    Status { attempt_id: String, status: AttemptStatus },
    Finished { attempt: Box<SolveAttempt> },
}

/// How the run ended, before it is written onto the record.
enum Outcome {
    Success(CapturedOutput),
    Failure {
        kind: FailureKind,
        message: String,
        output: Option<CapturedOutput>,
    },
}

struct ResolvedSource {
    code: String,
    language: Option<Language>,
    method: SolveMethod,
}

type EventSender<'a> = Option<&'a mpsc::Sender<AttemptEvent>>;

/// Turns a solve request into a finished attempt record.
///
/// Request problems (unknown language, missing template, generator failure)
/// come back as `Err` before anything touches the filesystem. Once an
/// attempt exists, every execution failure is recorded on it and the
/// terminal record is returned as `Ok`.
pub struct SolveEngine {
    config: AutoSolveConfig,
    registry: Arc<LanguageRegistry>,
    detector: LanguageDetector,
    extractor: TokenExtractor,
    workspaces: WorkspaceManager,
    executor: CodeExecutor,
    templates: Arc<TemplateStore>,
    generator: Option<Arc<dyn CodeGenerator>>,
    store: Arc<dyn AttemptStore>,
    limiter: Arc<Semaphore>,
}

impl SolveEngine {
    pub fn new(config: AutoSolveConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(config.registry());
        let detector = LanguageDetector::new(config.engine.default_language);
        let extractor = TokenExtractor::new(&config.extractor, detector)?;

        tracing::info!(
            "Engine ready: {} languages, {} concurrent attempts",
            registry.languages().len(),
            config.engine.max_concurrent
        );

        Ok(Self {
            registry,
            detector,
            extractor,
            workspaces: WorkspaceManager::new(config.engine.workspace_root.clone()),
            executor: CodeExecutor::new(&config.engine, &config.limits),
            templates: Arc::new(TemplateStore::with_builtin()),
            generator: None,
            store: Arc::new(MemoryAttemptStore::new()),
            limiter: Arc::new(Semaphore::new(config.engine.max_concurrent)),
            config,
        })
    }

    pub fn with_generator(mut self, generator: Arc<dyn CodeGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use the configured Ollama model as the code generator.
    pub fn with_ollama(self) -> Self {
        let generator = OllamaCodeGenerator::new(&self.config.ollama);
        self.with_generator(Arc::new(generator))
    }

    pub fn with_store(mut self, store: Arc<dyn AttemptStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.templates = templates;
        self
    }

    pub fn config(&self) -> &AutoSolveConfig {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &LanguageDetector {
        &self.detector
    }

    pub fn extractor(&self) -> &TokenExtractor {
        &self.extractor
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    pub async fn attempt(&self, id: &str) -> Result<Option<SolveAttempt>> {
        Ok(self.store.get(id).await?)
    }

    /// Past attempts for a challenge, newest first.
    pub async fn history(&self, challenge_id: &str) -> Result<Vec<SolveAttempt>> {
        Ok(self.store.list_by_challenge(challenge_id).await?)
    }

    pub async fn submit(&self, request: SolveRequest) -> Result<SolveAttempt> {
        self.process(request, None).await
    }

    /// Like [`submit`](Self::submit), also reporting progress on `tx`.
    /// A closed receiver does not affect the attempt.
    pub async fn submit_streaming(
        &self,
        request: SolveRequest,
        tx: mpsc::Sender<AttemptEvent>,
    ) -> Result<SolveAttempt> {
        self.process(request, Some(&tx)).await
    }

    async fn process(&self, request: SolveRequest, tx: EventSender<'_>) -> Result<SolveAttempt> {
        let timeout = match request.timeout {
            Some(t) if t.is_zero() => {
                return Err(AutoSolveError::InvalidRequest("timeout must be > 0".into()))
            }
            Some(t) => t,
            None => self.config.engine.run_timeout(),
        };

        // An explicit hint is checked before any generator call.
        let hinted = request
            .language_hint
            .as_deref()
            .map(|hint| self.registry.lookup(hint))
            .transpose()?;

        let source = self.resolve_source(&request).await?;
        let profile = match hinted {
            Some(profile) => profile,
            None => self.resolve_profile(&source)?,
        };

        let mut attempt = SolveAttempt::new(profile.language, source.code)
            .with_challenge(request.challenge_id.clone(), request.category.clone())
            .with_method(source.method)
            .with_stdin(request.effective_stdin());
        self.store.insert(&attempt).await?;

        tracing::info!(
            "Attempt {} started: {} via {:?}",
            attempt.id,
            attempt.language,
            attempt.method
        );
        emit(
            tx,
            AttemptEvent::Created {
                attempt_id: attempt.id.clone(),
                language: attempt.language,
            },
        )
        .await;

        self.execute(&mut attempt, profile, timeout, tx).await;
        self.finalize(attempt, tx).await
    }

    async fn resolve_source(&self, request: &SolveRequest) -> Result<ResolvedSource> {
        if let Some(code) = &request.source {
            if code.trim().is_empty() {
                return Err(AutoSolveError::MissingSource);
            }
            return Ok(ResolvedSource {
                code: code.clone(),
                language: None,
                method: SolveMethod::Custom,
            });
        }

        match request.method {
            Some(SolveMethod::Custom) => Err(AutoSolveError::MissingSource),
            Some(SolveMethod::Template) => self.from_template(request),
            Some(SolveMethod::AiGenerated) => match &self.generator {
                Some(generator) => self.from_generator(generator.as_ref(), request).await,
                None => Err(AutoSolveError::CodeGeneration(
                    "no code generator configured".into(),
                )),
            },
            None => match &self.generator {
                Some(generator) => self.from_generator(generator.as_ref(), request).await,
                None => self.from_template(request),
            },
        }
    }

    fn from_template(&self, request: &SolveRequest) -> Result<ResolvedSource> {
        let template = self.templates.first_active(&request.category)?;
        let empty = HashMap::new();
        let parameters = request.parameters.as_ref().unwrap_or(&empty);
        tracing::debug!("Rendering template '{}'", template.name);

        Ok(ResolvedSource {
            code: template.render(parameters),
            language: None,
            method: SolveMethod::Template,
        })
    }

    async fn from_generator(
        &self,
        generator: &dyn CodeGenerator,
        request: &SolveRequest,
    ) -> Result<ResolvedSource> {
        let context = ChallengeContext {
            challenge_id: request.challenge_id.clone(),
            description: request.challenge_text.clone(),
            category: request.category.clone(),
        };

        let generated = generator.generate(&context).await.map_err(|e| match e {
            AutoSolveError::CodeGeneration(msg) => AutoSolveError::CodeGeneration(msg),
            other => AutoSolveError::CodeGeneration(format!("{}: {}", generator.name(), other)),
        })?;

        if generated.source.trim().is_empty() {
            return Err(AutoSolveError::CodeGeneration(format!(
                "{} returned empty source",
                generator.name()
            )));
        }

        Ok(ResolvedSource {
            code: generated.source,
            language: generated.language,
            method: SolveMethod::AiGenerated,
        })
    }

    fn resolve_profile(&self, source: &ResolvedSource) -> Result<&LanguageProfile> {
        let language = source
            .language
            .filter(|l| self.registry.contains(*l))
            .unwrap_or_else(|| self.detector.detect(&source.code));
        self.registry.profile(language)
    }

    /// Stage, compile, run and clean up. Leaves `attempt` in a terminal state.
    async fn execute(
        &self,
        attempt: &mut SolveAttempt,
        profile: &LanguageProfile,
        timeout: Duration,
        tx: EventSender<'_>,
    ) {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                settle(attempt, infrastructure(format!("execution slot unavailable: {e}")));
                return;
            }
        };

        let workspace = match self
            .workspaces
            .stage(&attempt.id, &attempt.source_code, profile)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                settle(attempt, infrastructure(format!("failed to stage workspace: {e}")));
                return;
            }
        };

        let mut outcome = self
            .compile_and_run(attempt, &workspace, profile, timeout, tx)
            .await;

        // The workspace is gone before the record turns terminal.
        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.cleanup().await {
            tracing::warn!("Failed to remove workspace {:?}: {}", path, e);
            if tokio::fs::try_exists(&path).await.unwrap_or(true) {
                outcome = match outcome {
                    Outcome::Success(output) => Outcome::Failure {
                        kind: FailureKind::InfrastructureError,
                        message: format!("failed to remove workspace: {e}"),
                        output: Some(output),
                    },
                    failure => failure,
                };
            }
        }

        match outcome {
            Outcome::Success(output) => {
                let token = self.extractor.extract_for(&attempt.category, &output.stdout);
                if let Err(e) = attempt.complete(output, token) {
                    tracing::warn!("Attempt {}: {}", attempt.id, e);
                }
            }
            failure => settle(attempt, failure),
        }
    }

    async fn compile_and_run(
        &self,
        attempt: &mut SolveAttempt,
        workspace: &Workspace,
        profile: &LanguageProfile,
        timeout: Duration,
        tx: EventSender<'_>,
    ) -> Outcome {
        if profile.requires_compilation() {
            self.transition(attempt, AttemptStatus::Compiling, tx).await;
            if let Err(e) = self.executor.compile(workspace, profile).await {
                tracing::debug!("Attempt {} did not compile", attempt.id);
                return Outcome::Failure {
                    kind: e.kind(),
                    message: e.to_string(),
                    output: None,
                };
            }
        }

        self.transition(attempt, AttemptStatus::Running, tx).await;
        let run = self
            .executor
            .run(workspace, profile, attempt.stdin.as_deref(), timeout)
            .await;

        match run.error {
            None => Outcome::Success(run.output),
            Some(e) => Outcome::Failure {
                kind: e.kind(),
                message: e.to_string(),
                output: Some(run.output),
            },
        }
    }

    async fn transition(&self, attempt: &mut SolveAttempt, next: AttemptStatus, tx: EventSender<'_>) {
        if let Err(e) = attempt.advance(next) {
            tracing::warn!("Attempt {}: {}", attempt.id, e);
            return;
        }
        tracing::debug!("Attempt {} -> {}", attempt.id, next.as_str());

        if let Err(e) = self
            .store
            .update(&attempt.id, &AttemptUpdate::status(next))
            .await
        {
            tracing::warn!("Failed to record status for {}: {}", attempt.id, e);
        }
        emit(
            tx,
            AttemptEvent::Status {
                attempt_id: attempt.id.clone(),
                status: next,
            },
        )
        .await;
    }

    async fn finalize(&self, attempt: SolveAttempt, tx: EventSender<'_>) -> Result<SolveAttempt> {
        if let Err(e) = self
            .store
            .update(&attempt.id, &AttemptUpdate::outcome_of(&attempt))
            .await
        {
            tracing::warn!("Failed to record outcome for {}: {}", attempt.id, e);
        }

        match (&attempt.failure_kind, &attempt.extracted_token) {
            (Some(kind), _) => tracing::info!(
                "Attempt {} failed ({}) after {:.2}s",
                attempt.id,
                kind.as_str(),
                attempt.execution_time_seconds
            ),
            (None, Some(token)) => tracing::info!(
                "Attempt {} completed in {:.2}s with token {}",
                attempt.id,
                attempt.execution_time_seconds,
                token
            ),
            (None, None) => tracing::info!(
                "Attempt {} completed in {:.2}s without a token",
                attempt.id,
                attempt.execution_time_seconds
            ),
        }

        emit(
            tx,
            AttemptEvent::Finished {
                attempt: Box::new(attempt.clone()),
            },
        )
        .await;
        Ok(attempt)
    }
}

fn infrastructure(message: String) -> Outcome {
    Outcome::Failure {
        kind: FailureKind::InfrastructureError,
        message,
        output: None,
    }
}

fn settle(attempt: &mut SolveAttempt, outcome: Outcome) {
    let result = match outcome {
        Outcome::Success(output) => attempt.complete(output, None),
        Outcome::Failure {
            kind,
            message,
            output,
        } => attempt.fail(kind, message, output),
    };
    if let Err(e) = result {
        tracing::warn!("Attempt {}: {}", attempt.id, e);
    }
}

async fn emit(tx: EventSender<'_>, event: AttemptEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::GeneratedCode;
    use async_trait::async_trait;

    struct FailingGenerator;

    #[async_trait]
    impl CodeGenerator for FailingGenerator {
        async fn generate(&self, _: &ChallengeContext) -> Result<GeneratedCode> {
            Err(AutoSolveError::Http("connection refused".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn engine_in(root: &std::path::Path) -> SolveEngine {
        let mut config = AutoSolveConfig::default();
        config.engine.workspace_root = Some(root.to_path_buf());
        SolveEngine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_hint_creates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path());

        let err = engine
            .submit(SolveRequest::custom("print(1)").language("cobol"))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoSolveError::UnsupportedLanguage(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path());
        let err = engine
            .submit(SolveRequest::custom("print(1)").timeout(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoSolveError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_source() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path());
        let request = SolveRequest::new("misc").method(SolveMethod::Custom);
        assert!(matches!(
            engine.submit(request).await.unwrap_err(),
            AutoSolveError::MissingSource
        ));
        assert!(matches!(
            engine.submit(SolveRequest::custom("  \n")).await.unwrap_err(),
            AutoSolveError::MissingSource
        ));
    }

    #[tokio::test]
    async fn test_unknown_category_without_generator() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path());
        let err = engine.submit(SolveRequest::new("forensics")).await.unwrap_err();
        assert!(matches!(err, AutoSolveError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn test_generator_failure_is_request_error() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path()).with_generator(Arc::new(FailingGenerator));
        let err = engine
            .submit(SolveRequest::new("crypto").challenge("c1", "decode this"))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoSolveError::CodeGeneration(ref m) if m.contains("failing")));
        assert!(engine.history("c1").await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_ai_method_without_generator() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine_in(root.path());
        let err = engine
            .submit(SolveRequest::new("web").method(SolveMethod::AiGenerated))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoSolveError::CodeGeneration(_)));
    }

    #[test]
    fn test_event_wire_format() {
        let event = AttemptEvent::Status {
            attempt_id: "a".into(),
            status: AttemptStatus::Running,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "running");
    }
}
