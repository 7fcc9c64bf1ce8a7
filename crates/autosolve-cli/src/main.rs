use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autosolve_core::{
    AutoSolveConfig, LanguageRegistry, SolveAttempt, SolveMethod, SolveRequest, TemplateStore,
};
use autosolve_engine::{AttemptEvent, JsonAttemptStore, LanguageDetector, SolveEngine};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autosolve")]
#[command(about = "AutoSolve - run and generate CTF solve code", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep attempt records as JSON files in this directory
    #[arg(long, global = true)]
    records: Option<PathBuf>,

    /// Template catalog file (JSON); built-in templates when absent
    #[arg(long, global = true)]
    templates: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file in the sandbox
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language id or alias; detected from the source when omitted
        #[arg(short, long)]
        language: Option<String>,

        /// Challenge category, selects category token patterns
        #[arg(long, default_value = "")]
        category: String,

        /// Run timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// File fed to the program on stdin
        #[arg(long)]
        stdin_file: Option<PathBuf>,

        /// Parameter as key=value (`input` is used as stdin)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Print the attempt record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate solve code for a challenge and run it
    Solve {
        /// Challenge category (web, crypto, pwn, ...)
        #[arg(long)]
        category: String,

        /// Challenge description
        #[arg(short, long, conflicts_with = "description_file")]
        description: Option<String>,

        /// File holding the challenge description
        #[arg(long)]
        description_file: Option<PathBuf>,

        /// Challenge id used to group attempts
        #[arg(long)]
        challenge_id: Option<String>,

        /// Use the category template instead of the model
        #[arg(long)]
        template: bool,

        /// Template parameter as key=value
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Run timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Print progress events as JSON lines
        #[arg(long)]
        stream: bool,

        /// Print the attempt record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the detected language of a source file
    Detect { file: PathBuf },

    /// List supported languages and toolchain availability
    Languages,

    /// Show recorded attempts for a challenge (needs --records)
    History { challenge_id: String },

    /// Manage solve templates
    Templates {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// List active templates
    List {
        #[arg(long)]
        category: Option<String>,
    },
    /// Print a template's skeleton
    Show { name: String },
    /// Render a template with parameters
    Render {
        name: String,
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Enable a template
    Enable { name: String },
    /// Disable a template
    Disable { name: String },
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn parse_timeout(secs: Option<f64>) -> Result<Option<Duration>> {
    secs.map(|s| Duration::try_from_secs_f64(s).context("invalid --timeout"))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = AutoSolveConfig::resolve(cli.config.as_deref())?;
    tracing::debug!("Engine config: {:?}", config.engine);

    match cli.command {
        Commands::Run {
            file,
            language,
            category,
            timeout,
            stdin_file,
            params,
            json,
        } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let mut request = SolveRequest::custom(source).category(category);
            if let Some(language) = language {
                request = request.language(language);
            }
            if let Some(path) = stdin_file {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                request = request.stdin(bytes);
            }
            request.timeout = parse_timeout(timeout)?;
            request.parameters = collect_params(params);

            let engine = build_engine(config, cli.records.as_deref(), cli.templates.as_deref())?;
            let attempt = engine.submit(request).await?;
            print_attempt(&attempt, json)?;
        }
        Commands::Solve {
            category,
            description,
            description_file,
            challenge_id,
            template,
            params,
            timeout,
            stream,
            json,
        } => {
            let description = match (description, description_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => String::new(),
            };
            let mut request = SolveRequest::new(category);
            request.challenge_id = challenge_id;
            request.challenge_text = description;
            request.parameters = collect_params(params);
            request.timeout = parse_timeout(timeout)?;

            let engine = build_engine(config, cli.records.as_deref(), cli.templates.as_deref())?;
            let engine = match template {
                true => {
                    request.method = Some(SolveMethod::Template);
                    engine
                }
                false => engine.with_ollama(),
            };

            let attempt = match stream {
                true => solve_streaming(&engine, request).await?,
                false => engine.submit(request).await?,
            };
            print_attempt(&attempt, json)?;
        }
        Commands::Detect { file } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let detector = LanguageDetector::new(config.engine.default_language);
            println!("{}", detector.detect(&source));
        }
        Commands::Languages => cmd_languages(&config.registry()),
        Commands::History { challenge_id } => {
            let dir = cli
                .records
                .context("history needs --records <DIR>")?;
            let engine = build_engine(config, Some(&dir), None)?;
            let attempts = engine.history(&challenge_id).await?;
            println!();
            println!("  {:<38} {:<11} {:<10} {}", "ID", "STATUS", "LANGUAGE", "TOKEN");
            println!("{:-<80}", "");
            for a in &attempts {
                println!(
                    "  {:<38} {:<11} {:<10} {}",
                    a.id,
                    a.status.as_str(),
                    a.language.id(),
                    a.extracted_token.as_deref().unwrap_or("-")
                );
            }
            println!();
        }
        Commands::Templates { command } => {
            cmd_templates(command, cli.templates.as_deref())?;
        }
    }

    Ok(())
}

fn collect_params(params: Vec<(String, String)>) -> Option<HashMap<String, String>> {
    match params.is_empty() {
        true => None,
        false => Some(params.into_iter().collect()),
    }
}

fn load_templates(path: Option<&Path>) -> Result<TemplateStore> {
    match path {
        Some(p) if p.exists() => Ok(TemplateStore::load(p)?),
        _ => Ok(TemplateStore::with_builtin()),
    }
}

fn build_engine(
    config: AutoSolveConfig,
    records: Option<&Path>,
    templates: Option<&Path>,
) -> Result<SolveEngine> {
    let mut engine = SolveEngine::new(config)?
        .with_templates(Arc::new(load_templates(templates)?));
    if let Some(dir) = records {
        engine = engine.with_store(Arc::new(JsonAttemptStore::new(dir)?));
    }
    Ok(engine)
}

async fn solve_streaming(engine: &SolveEngine, request: SolveRequest) -> Result<SolveAttempt> {
    let (tx, mut rx) = mpsc::channel::<AttemptEvent>(16);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let AttemptEvent::Finished { .. } = event {
                continue;
            }
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let attempt = engine.submit_streaming(request, tx).await;
    let _ = printer.await;
    Ok(attempt?)
}

fn print_attempt(attempt: &SolveAttempt, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(attempt)?);
        return Ok(());
    }

    println!();
    println!("Attempt {}", attempt.id);
    println!("{:-<40}", "");
    println!("  Language:   {}", attempt.language.label());
    println!("  Status:     {}", attempt.status.as_str());
    println!("  Time:       {:.3} s", attempt.execution_time_seconds);
    if let Some(code) = attempt.exit_code {
        println!("  Exit code:  {}", code);
    }
    if let Some(kind) = attempt.failure_kind {
        println!("  Failure:    {}", kind.as_str());
    }
    println!(
        "  Token:      {}",
        attempt.extracted_token.as_deref().unwrap_or("-")
    );
    if let Some(msg) = &attempt.error_message {
        println!();
        println!("Error:");
        println!("{}", msg);
    }
    if !attempt.stdout.is_empty() {
        println!();
        println!("Stdout:");
        print!("{}", attempt.stdout);
    }
    println!();
    Ok(())
}

fn cmd_languages(registry: &LanguageRegistry) {
    println!();
    println!("  {:<12} {:<12} {:<10} {}", "ID", "LANGUAGE", "COMPILED", "TOOLCHAIN");
    println!("{:-<55}", "");
    for (language, available) in registry.available() {
        println!(
            "  {:<12} {:<12} {:<10} {}",
            language.id(),
            language.label(),
            if language.is_compiled() { "yes" } else { "no" },
            if available { "found" } else { "missing" }
        );
    }
    println!();
}

fn cmd_templates(command: TemplateCommands, path: Option<&Path>) -> Result<()> {
    let store = load_templates(path)?;

    match command {
        TemplateCommands::List { category } => {
            println!();
            println!("  {:<4} {:<20} {:<10} {}", "#", "NAME", "CATEGORY", "DESCRIPTION");
            println!("{:-<70}", "");
            for t in store.list(category.as_deref())? {
                println!("  {:<4} {:<20} {:<10} {}", t.id, t.name, t.category, t.description);
            }
            println!();
        }
        TemplateCommands::Show { name } => {
            let template = store
                .get(&name)?
                .with_context(|| format!("no template named '{name}'"))?;
            print!("{}", template.template_code);
        }
        TemplateCommands::Render { name, params } => {
            let template = store
                .get(&name)?
                .with_context(|| format!("no template named '{name}'"))?;
            let params: HashMap<String, String> = params.into_iter().collect();
            print!("{}", template.render(&params));
        }
        TemplateCommands::Enable { name } => {
            store.enable(&name)?;
            save_templates(&store, path)?;
        }
        TemplateCommands::Disable { name } => {
            store.disable(&name)?;
            save_templates(&store, path)?;
        }
    }

    Ok(())
}

fn save_templates(store: &TemplateStore, path: Option<&Path>) -> Result<()> {
    let path = path.context("changing templates needs --templates <FILE>")?;
    store.save(path)?;
    println!("Saved {}", path.display());
    Ok(())
}
