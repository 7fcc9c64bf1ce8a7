use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autosolve_core::{
    AttemptStatus, AutoSolveConfig, FailureKind, Language, LanguageProfile, Result, SolveMethod,
    SolveRequest,
};
use autosolve_engine::{
    AttemptEvent, ChallengeContext, CodeGenerator, GeneratedCode, JsonAttemptStore, SolveEngine,
};
use tokio::sync::mpsc;

fn has(program: &str) -> bool {
    let found = which::which(program).is_ok();
    if !found {
        eprintln!("skipping: {program} not on PATH");
    }
    found
}

fn engine(root: &Path) -> SolveEngine {
    let mut config = AutoSolveConfig::default();
    config.engine.workspace_root = Some(root.to_path_buf());
    config.engine.kill_grace_ms = 200;
    SolveEngine::new(config).unwrap()
}

fn assert_no_workspaces(root: &Path) {
    let left: Vec<_> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert!(left.is_empty(), "workspaces left behind: {left:?}");
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // Field 3 is the state; a zombie has already been killed.
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z"),
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_python_prints_flag() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(
            SolveRequest::custom(r#"print("flag{abc123}")"#)
                .language("python")
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.extracted_token.as_deref(), Some("flag{abc123}"));
    assert_eq!(attempt.stdout, "flag{abc123}\n");
    assert_eq!(attempt.exit_code, Some(0));
    assert_eq!(attempt.method, SolveMethod::Custom);
    assert!(attempt.completed_at.is_some());
    assert!(attempt.execution_time_seconds > 0.0);
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_python_exception_is_runtime_error() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(SolveRequest::custom("raise Exception('boom')").language("python"))
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.failure_kind, Some(FailureKind::RuntimeError));
    assert!(attempt.error_message.as_deref().unwrap().contains("boom"));
    assert!(attempt.extracted_token.is_none());
    assert_eq!(attempt.exit_code, Some(1));
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let started = Instant::now();
    let attempt = engine
        .submit(
            SolveRequest::custom("while True:\n    pass\n")
                .language("python")
                .timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.failure_kind, Some(FailureKind::Timeout));
    assert!(attempt.error_message.as_deref().unwrap().contains("1s"));
    assert!(attempt.execution_time_seconds >= 1.0);
    assert!(attempt.execution_time_seconds < 3.0);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_c_syntax_error_is_compile_error() {
    if !has("gcc") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(SolveRequest::custom("int main( { return 0; }").language("c"))
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.failure_kind, Some(FailureKind::CompileError));
    assert!(attempt
        .error_message
        .as_deref()
        .unwrap()
        .starts_with("Compilation failed"));
    assert_eq!(attempt.execution_time_seconds, 0.0);
    assert!(attempt.stdout.is_empty());
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_compiled_c_prints_flag() {
    if !has("gcc") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    let (tx, mut rx) = mpsc::channel(16);

    let source = "#include <stdio.h>\nint main(void) { puts(\"flag{compiled}\"); return 0; }\n";
    let attempt = engine
        .submit_streaming(SolveRequest::custom(source), tx)
        .await
        .unwrap();

    assert_eq!(attempt.language, Language::C);
    assert_eq!(attempt.extracted_token.as_deref(), Some("flag{compiled}"));

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AttemptEvent::Status { status, .. } = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![AttemptStatus::Compiling, AttemptStatus::Running]);
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_empty_output_completes_without_token() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(SolveRequest::custom("pass").language("py"))
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert!(attempt.extracted_token.is_none());
    assert!(attempt.failure_kind.is_none());
}

#[tokio::test]
async fn test_missing_interpreter_is_infrastructure_error() {
    let root = tempfile::tempdir().unwrap();
    let mut config = AutoSolveConfig::default();
    config.engine.workspace_root = Some(root.path().to_path_buf());
    config.engine.profiles = vec![autosolve_core::LanguageProfile {
        language: Language::Ruby,
        file_extension: "rb".into(),
        compile: None,
        run: autosolve_core::CommandSpec::new("definitely-not-a-ruby", &["{source}"]),
    }];
    let engine = SolveEngine::new(config).unwrap();

    let attempt = engine
        .submit(SolveRequest::custom("puts 1").language("ruby"))
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.failure_kind, Some(FailureKind::InfrastructureError));
    assert_no_workspaces(root.path());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_background_children_do_not_survive() {
    if !has("bash") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(
            SolveRequest::custom("sleep 30 >/dev/null 2>&1 &\necho $!\n")
                .language("bash")
                .timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    assert_eq!(attempt.status, AttemptStatus::Completed);
    let pid: u32 = attempt.stdout.trim().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_alive(pid), "background pid {pid} survived");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_process_group() {
    if !has("bash") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    let attempt = engine
        .submit(
            SolveRequest::custom("sleep 30 &\necho $!\nwait\n")
                .language("bash")
                .timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(attempt.failure_kind, Some(FailureKind::Timeout));
    let pid: u32 = attempt.stdout.trim().parse().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_alive(pid), "pid {pid} survived the timeout");
    assert_no_workspaces(root.path());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_dropped_submit_kills_process_group() {
    if !has("bash") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let pid_file = scratch.path().join("bg.pid");
    let engine = engine(root.path());

    let source = format!("sleep 300 &\necho $! > {}\nsleep 300\n", pid_file.display());
    let cancelled = tokio::time::timeout(
        Duration::from_millis(1500),
        engine.submit(
            SolveRequest::custom(source)
                .language("bash")
                .timeout(Duration::from_secs(60)),
        ),
    )
    .await;
    assert!(cancelled.is_err());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!process_alive(pid), "background pid {pid} outlived the dropped submit");
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_concurrent_attempts_stay_separate() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(root.path()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let source = format!(
                    "import os\nopen('mine.txt', 'w').write('{i}')\nprint('flag{{' + open('mine.txt').read() + '}}')\n"
                );
                engine.submit(SolveRequest::custom(source)).await.unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let attempt = handle.await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Completed, "{:?}", attempt.error_message);
        assert_eq!(attempt.extracted_token, Some(format!("flag{{{i}}}")));
    }
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_template_with_parameters_and_input() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    engine
        .templates()
        .add(autosolve_core::SolveTemplate::new(
            "echo-input",
            "misc",
            "import sys\nprint('{prefix}{' + sys.stdin.read().strip() + '}')\n",
        ))
        .unwrap();

    let request = SolveRequest::new("misc")
        .method(SolveMethod::Template)
        .parameter("prefix", "flag")
        .parameter("input", "from-stdin");
    let attempt = engine.submit(request).await.unwrap();

    assert_eq!(attempt.method, SolveMethod::Template);
    assert_eq!(attempt.extracted_token.as_deref(), Some("flag{from-stdin}"));
}

struct CannedGenerator {
    response: &'static str,
    language: Option<Language>,
}

#[async_trait]
impl CodeGenerator for CannedGenerator {
    async fn generate(&self, context: &ChallengeContext) -> Result<GeneratedCode> {
        assert_eq!(context.category, "crypto");
        Ok(GeneratedCode {
            source: self.response.to_string(),
            language: self.language,
        })
    }

    fn name(&self) -> &str {
        "canned"
    }
}

#[tokio::test]
async fn test_generated_code_is_recorded() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let records = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonAttemptStore::new(records.path()).unwrap());
    let engine = engine(root.path())
        .with_store(store)
        .with_generator(Arc::new(CannedGenerator {
            response: "import base64\nprint(base64.b64decode('ZmxhZ3tiNjR9').decode())",
            language: Some(Language::Python),
        }));

    let attempt = engine
        .submit(SolveRequest::new("crypto").challenge("chal-7", "ZmxhZ3tiNjR9"))
        .await
        .unwrap();

    assert_eq!(attempt.method, SolveMethod::AiGenerated);
    assert_eq!(attempt.extracted_token.as_deref(), Some("flag{b64}"));

    let history = engine.history("chal-7").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0], attempt);
    assert_eq!(
        engine.attempt(&attempt.id).await.unwrap().unwrap().status,
        AttemptStatus::Completed
    );
}

#[tokio::test]
async fn test_streaming_reports_lifecycle() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());
    let (tx, mut rx) = mpsc::channel(16);

    let attempt = engine
        .submit_streaming(SolveRequest::custom("print('flag{s}')"), tx)
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], AttemptEvent::Created { attempt_id, language: Language::Python } if *attempt_id == attempt.id));
    assert!(matches!(
        &events[1],
        AttemptEvent::Status {
            status: AttemptStatus::Running,
            ..
        }
    ));
    assert!(matches!(&events[2], AttemptEvent::Finished { attempt: done } if **done == attempt));
}

/// A flag printer for each language, written the way a solver in it would.
fn hello_flag(language: Language) -> &'static str {
    match language {
        Language::Python => "print(\"flag{python}\")\n",
        Language::JavaScript => "console.log(\"flag{javascript}\");\n",
        Language::Bash => "echo 'flag{bash}'\n",
        Language::Php => "<?php\necho \"flag{php}\\n\";\n",
        Language::Ruby => "puts \"flag{ruby}\"\n",
        Language::Go => "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(\"flag{go}\")\n}\n",
        Language::Rust => "fn main() {\n    println!(\"flag{{rust}}\");\n}\n",
        Language::C => "#include <stdio.h>\nint main(void) { puts(\"flag{c}\"); return 0; }\n",
        Language::Cpp => "#include <iostream>\nint main() { std::cout << \"flag{cpp}\" << std::endl; return 0; }\n",
    }
}

fn spin_forever(language: Language) -> &'static str {
    match language {
        Language::Python => "while True:\n    pass\n",
        Language::JavaScript => "while (true) {}\n",
        Language::Bash => "while true; do :; done\n",
        Language::Php => "<?php\nwhile (true) {}\n",
        Language::Ruby => "loop {}\n",
        Language::Go => "package main\n\nfunc main() {\n\tfor {\n\t}\n}\n",
        Language::Rust => "fn main() {\n    loop {}\n}\n",
        Language::C => "int main(void) { volatile int n = 0; for (;;) { n++; } }\n",
        Language::Cpp => "int main() { volatile int n = 0; for (;;) { n++; } }\n",
    }
}

fn toolchain_present(language: Language) -> bool {
    has(LanguageProfile::builtin(language).toolchain_program())
}

#[tokio::test]
async fn test_every_language_prints_its_flag() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    for &language in Language::all() {
        if !toolchain_present(language) {
            continue;
        }
        let attempt = engine
            .submit(
                SolveRequest::custom(hello_flag(language))
                    .language(language.id())
                    .timeout(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        assert_eq!(attempt.language, language);
        assert_eq!(
            attempt.status,
            AttemptStatus::Completed,
            "{}: {:?}",
            language.id(),
            attempt.error_message
        );
        assert_eq!(
            attempt.extracted_token,
            Some(format!("flag{{{}}}", language.id())),
            "{} stdout: {:?}",
            language.id(),
            attempt.stdout
        );
    }
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_every_language_times_out() {
    let root = tempfile::tempdir().unwrap();
    let engine = engine(root.path());

    for &language in Language::all() {
        if !toolchain_present(language) {
            continue;
        }
        let attempt = engine
            .submit(
                SolveRequest::custom(spin_forever(language))
                    .language(language.id())
                    .timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(attempt.status, AttemptStatus::Failed, "{}", language.id());
        assert_eq!(
            attempt.failure_kind,
            Some(FailureKind::Timeout),
            "{}: {:?}",
            language.id(),
            attempt.error_message
        );
        assert!(attempt.execution_time_seconds >= 1.0, "{}", language.id());
        assert!(attempt.execution_time_seconds < 3.0, "{}", language.id());
    }
    assert_no_workspaces(root.path());
}

#[tokio::test]
async fn test_max_concurrent_bounds_running_attempts() {
    if !has("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let log = scratch.path().join("spans.log");

    let mut config = AutoSolveConfig::default();
    config.engine.workspace_root = Some(root.path().to_path_buf());
    config.engine.max_concurrent = 2;
    let engine = Arc::new(SolveEngine::new(config).unwrap());

    let source = format!(
        "import time\nstart = time.time()\ntime.sleep(1)\nwith open({:?}, 'a') as f:\n    f.write(f'{{start}} {{time.time()}}\\n')\n",
        log.display().to_string()
    );
    let started = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let source = source.clone();
            tokio::spawn(async move {
                engine
                    .submit(SolveRequest::custom(source).language("python"))
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        let attempt = handle.await.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Completed, "{:?}", attempt.error_message);
    }
    assert!(started.elapsed() >= Duration::from_secs(2));

    let spans: Vec<(f64, f64)> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(|line| {
            let (start, end) = line.split_once(' ').unwrap();
            (start.parse().unwrap(), end.parse().unwrap())
        })
        .collect();
    assert_eq!(spans.len(), 4);
    for &(at, _) in &spans {
        let overlapping = spans.iter().filter(|&&(s, e)| s <= at && at < e).count();
        assert!(overlapping <= 2, "{overlapping} attempts ran at once: {spans:?}");
    }
    assert_no_workspaces(root.path());
}
