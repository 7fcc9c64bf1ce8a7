use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use autosolve_core::ResourceLimits;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 8192;
const MIN_DRAIN_WAIT: Duration = Duration::from_millis(200);

/// How a spawned process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One child process to run to completion or deadline.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub limits: Option<ResourceLimits>,
    pub clear_env: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.to_path_buf(),
            stdin: None,
            timeout: Duration::from_secs(60),
            kill_grace: Duration::from_millis(500),
            max_output_bytes: 1024 * 1024,
            limits: None,
            clear_env: false,
        }
    }
}

/// Spawn `spec` as the leader of a fresh process group, feed stdin, capture
/// both streams and wait up to `spec.timeout`.
///
/// On timeout the group gets SIGTERM, then SIGKILL after `kill_grace`. The
/// group is SIGKILLed after a normal exit too, and when the returned future
/// is dropped mid-wait, so nothing the program forked outlives this call.
/// Only spawn and wait failures are errors.
pub async fn run_process(spec: &ProcessSpec) -> io::Result<ProcessOutput> {
    let mut cmd = build_command(spec);

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id();
    let mut group = GroupGuard::new(pid);
    tracing::debug!("Spawned {} (pid {:?}) in {:?}", spec.program, pid, spec.cwd);

    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), spec.max_output_bytes));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), spec.max_output_bytes));

    if let (Some(bytes), Some(mut pipe)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            // The program may exit without reading; a broken pipe is fine.
            let _ = pipe.write_all(&bytes).await;
            let _ = pipe.shutdown().await;
        });
    }

    let waited = tokio::time::timeout(spec.timeout, child.wait()).await;
    let termination = match waited {
        Ok(Ok(status)) => termination_of(status),
        Ok(Err(e)) => {
            group.kill();
            let _ = child.kill().await;
            return Err(e);
        }
        Err(_) => {
            tracing::warn!(
                "{} (pid {:?}) exceeded {:?}, terminating its process group",
                spec.program,
                pid,
                spec.timeout
            );
            terminate(&mut child, pid, spec.kill_grace).await;
            Termination::TimedOut
        }
    };
    let elapsed = start.elapsed();

    // Reap anything the program left running in its group.
    group.kill();

    let drain_wait = spec.kill_grace.max(MIN_DRAIN_WAIT);
    let (stdout, stdout_truncated) = collect(stdout_task, drain_wait).await;
    let (stderr, stderr_truncated) = collect(stderr_task, drain_wait).await;

    Ok(ProcessOutput {
        termination,
        stdout,
        stderr,
        elapsed,
        truncated: stdout_truncated || stderr_truncated,
    })
}

fn build_command(spec: &ProcessSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(match spec.stdin {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if spec.clear_env {
        let path = std::env::var_os("PATH").unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());
        cmd.env_clear()
            .env("PATH", path)
            .env("HOME", &spec.cwd)
            .env("TMPDIR", &spec.cwd)
            .env("LANG", "C.UTF-8");
    }

    #[cfg(unix)]
    {
        cmd.process_group(0);
        if let Some(limits) = spec.limits.as_ref().map(RawLimits::from) {
            // SAFETY: the hook only calls getrlimit/setrlimit, which are
            // async-signal-safe, and touches no shared state.
            unsafe {
                cmd.pre_exec(move || limits.apply());
            }
        }
    }

    cmd
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };

    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        // Keep draining past the cap so the writer never blocks on a full pipe.
        let room = limit.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }
    (kept, truncated)
}

async fn collect(mut task: JoinHandle<(Vec<u8>, bool)>, wait: Duration) -> (Vec<u8>, bool) {
    match tokio::time::timeout(wait, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            tracing::warn!("Output reader failed: {}", e);
            (Vec::new(), true)
        }
        Err(_) => {
            // A process outside the group still holds the pipe open.
            tracing::warn!("Output pipe still open after {:?}, abandoning it", wait);
            task.abort();
            (Vec::new(), true)
        }
    }
}

async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, Signal::Term);
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    tracing::warn!("pid {:?} ignored SIGTERM for {:?}, sending SIGKILL", pid, grace);
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill pid {:?}: {}", pid, e);
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    if let Some(code) = status.code() {
        return Termination::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Termination::Signaled(signal);
        }
    }
    Termination::Exited(-1)
}

// =============================================================================
// Signals
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

fn kill_group(pid: Option<u32>) {
    signal_group(pid, Signal::Kill);
}

/// SIGKILLs the process group on drop unless [`GroupGuard::kill`] already ran.
///
/// `kill_on_drop` only reaches the direct child; background jobs it started
/// would otherwise survive a cancelled `run_process`.
struct GroupGuard {
    pid: Option<u32>,
}

impl GroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    fn kill(&mut self) {
        kill_group(self.pid.take());
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if self.pid.is_some() {
            tracing::debug!("Run dropped before completion, killing group {:?}", self.pid);
            self.kill();
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pgid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        // ESRCH: the whole group is already gone.
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!("kill(-{}, {:?}) failed: {}", pgid, signal, err);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

// =============================================================================
// Resource Limits
// =============================================================================

/// Plain-data copy of [`ResourceLimits`] that is safe to use after fork.
#[derive(Debug, Clone, Copy)]
struct RawLimits {
    cpu_secs: Option<u64>,
    address_space_bytes: Option<u64>,
    file_size_bytes: Option<u64>,
    open_files: Option<u64>,
    disable_core_dumps: bool,
}

impl From<&ResourceLimits> for RawLimits {
    fn from(limits: &ResourceLimits) -> Self {
        const MB: u64 = 1024 * 1024;
        Self {
            cpu_secs: limits.cpu_secs,
            address_space_bytes: limits.address_space_mb.map(|m| m.saturating_mul(MB)),
            file_size_bytes: limits.file_size_mb.map(|m| m.saturating_mul(MB)),
            open_files: limits.open_files,
            disable_core_dumps: limits.disable_core_dumps,
        }
    }
}

/// Lower both soft and hard limit to `value`, never raising the hard limit.
#[cfg(unix)]
macro_rules! lower_rlimit {
    ($resource:expr, $value:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `current` is a valid, writable rlimit.
        if unsafe { libc::getrlimit($resource, &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let value = ($value as libc::rlim_t).min(current.rlim_max);
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        // SAFETY: `limit` is a valid rlimit.
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

#[cfg(unix)]
impl RawLimits {
    fn apply(&self) -> io::Result<()> {
        if let Some(secs) = self.cpu_secs {
            lower_rlimit!(libc::RLIMIT_CPU, secs);
        }
        if let Some(bytes) = self.address_space_bytes {
            lower_rlimit!(libc::RLIMIT_AS, bytes);
        }
        if let Some(bytes) = self.file_size_bytes {
            lower_rlimit!(libc::RLIMIT_FSIZE, bytes);
        }
        if let Some(n) = self.open_files {
            lower_rlimit!(libc::RLIMIT_NOFILE, n);
        }
        if self.disable_core_dumps {
            lower_rlimit!(libc::RLIMIT_CORE, 0u64);
        }
        Ok(())
    }
}
