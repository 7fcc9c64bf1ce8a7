pub mod attempt;
pub mod config;
pub mod error;
pub mod language;
pub mod profile;
pub mod request;
pub mod template;

pub use attempt::{
    AttemptStatus, AttemptUpdate, CapturedOutput, FailureKind, SolveAttempt, SolveMethod,
    TransitionError,
};
pub use config::{AutoSolveConfig, EngineConfig, ExtractorConfig, OllamaConfig, ResourceLimits};
pub use error::{AutoSolveError, Result};
pub use language::Language;
pub use profile::{CommandSpec, LanguageProfile, LanguageRegistry};
pub use request::SolveRequest;
pub use template::{builtin_templates, render, SolveTemplate, TemplateStore};
