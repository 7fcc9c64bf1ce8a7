use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutoSolveError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("No solve template for category: {0}")]
    TemplateNotFound(String),

    #[error("No source code supplied and none could be produced")]
    MissingSource,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Code generation failed: {0}")]
    CodeGeneration(String),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AutoSolveError>;
