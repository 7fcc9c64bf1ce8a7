pub mod codegen;
pub mod detector;
pub mod engine;
pub mod executor;
pub mod extractor;
pub mod ollama;
pub mod process;
pub mod store;
pub mod workspace;

pub use codegen::{extract_code_block, ChallengeContext, CodeGenerator, GeneratedCode};
pub use detector::LanguageDetector;
pub use engine::{AttemptEvent, SolveEngine};
pub use executor::{CodeExecutor, ExecutorError, RunOutcome};
pub use extractor::TokenExtractor;
pub use ollama::{OllamaClient, OllamaCodeGenerator};
pub use process::{run_process, ProcessOutput, ProcessSpec, Termination};
pub use store::{AttemptStore, JsonAttemptStore, MemoryAttemptStore, StoreError};
pub use workspace::{Workspace, WorkspaceManager};
