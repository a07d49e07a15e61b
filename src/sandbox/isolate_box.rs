//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox for secure code execution.
//! Manages box initialization, cleanup, file I/O and command execution.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::meta::{read_meta_file, RunResult, RunStatus};
use super::retry::{retry, RetryPolicy};
use super::run_config::{effective_memory_limit, RunConfig};
use super::Sandbox;
use crate::error::{EvalError, Result};

/// Transient isolate failures are retried this many times in total
pub const RUN_RETRY_POLICY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(200));

/// Replaced with the run's memory limit (KB) inside command arguments
pub const MEMORY_PLACEHOLDER: &str = "<MEMORY>";

/// Tracing target of the per-run audit records
pub const AUDIT_TARGET: &str = "judge_eval::audit";

/// Upper bound on corrective passes while initializing a box
const MAX_INIT_REPAIRS: usize = 3;

/// How long isolate gets to clean up after SIGINT before it is killed
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Known bad states a box can be found in at init time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repair {
    /// Left over from a run that was never cleaned up
    StaleBox,
    /// Created earlier without `--cg`
    CgroupMismatch,
    /// isolate lost its setuid-root ownership
    NeedsRoot,
}

#[derive(Debug, PartialEq)]
enum InitState {
    Ready(PathBuf),
    NeedsRepair(Repair),
    Failed,
}

fn classify_init(success: bool, stdout: &str, stderr: &str) -> InitState {
    let combined = format!("{}{}", stdout, stderr);

    if combined.contains("Box already exists") {
        InitState::NeedsRepair(Repair::StaleBox)
    } else if combined.contains("incompatible control group mode") {
        InitState::NeedsRepair(Repair::CgroupMismatch)
    } else if combined.contains("Must be started as root") {
        InitState::NeedsRepair(Repair::NeedsRoot)
    } else if success && !stdout.trim().is_empty() {
        InitState::Ready(PathBuf::from(stdout.trim()))
    } else {
        InitState::Failed
    }
}

async fn isolate_output(isolate_path: &Path, args: &[String]) -> Result<Output> {
    Command::new(isolate_path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| EvalError::IsolateSpawn {
            path: isolate_path.to_path_buf(),
            source,
        })
}

async fn repair_box(isolate_path: &Path, box_id: u32, repair: Repair) -> Result<()> {
    let box_flag = format!("--box-id={}", box_id);

    match repair {
        Repair::StaleBox | Repair::CgroupMismatch => {
            let mut args = Vec::new();
            if repair == Repair::StaleBox {
                args.push("--cg".to_string());
            }
            args.push(box_flag);
            args.push("--cleanup".to_string());

            let output = isolate_output(isolate_path, &args).await?;
            if !output.status.success() {
                warn!(
                    "Could not clean up box {}: {}",
                    box_id,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Repair::NeedsRoot => {
            chown(isolate_path, Some(Uid::from_raw(0)), Some(Gid::from_raw(0))).map_err(|errno| {
                warn!("Could not chown root the isolate binary: {}", errno);
                EvalError::Io(errno.into())
            })?;
        }
    }

    Ok(())
}

/// Build the isolate flags for one run, up to and including `--`
pub fn build_run_flags(box_id: u32, memory_quota: u32, config: &RunConfig, meta_path: &Path) -> Vec<String> {
    let mut args = vec![format!("--box-id={}", box_id), "--cg".to_string()];

    match config.max_processes {
        Some(max) => args.push(format!("--processes={}", max)),
        None => args.push("--processes".to_string()),
    }

    args.extend(config.directories.iter().map(|dir| dir.to_flag()));

    if config.inherit_env {
        args.push("--full-env".to_string());
    }
    for name in &config.env_to_inherit {
        args.push(format!("--env={}", name));
    }
    for (key, value) in &config.env {
        args.push(format!("--env={}={}", key, value));
    }

    if config.time_limit > 0.0 {
        args.push(format!("--time={}", config.time_limit));
    }
    if config.wall_time_limit > 0.0 {
        args.push(format!("--wall-time={}", config.wall_time_limit));
    }

    if let Some(limit) = effective_memory_limit(config.memory_limit_kb, memory_quota) {
        if config.memory_limit_kb > limit {
            info!(
                "Memory limit of {} KB exceeds quota, clamping to {} KB",
                config.memory_limit_kb, limit
            );
        }
        args.push(format!("--cg-mem={}", limit));
    }

    args.push(format!(
        "--stdin={}",
        config.stdin_path.as_deref().unwrap_or("/dev/null")
    ));
    args.push(format!(
        "--stdout={}",
        config.stdout_path.as_deref().unwrap_or("/dev/null")
    ));
    if config.stderr_to_stdout {
        args.push("--stderr-to-stdout".to_string());
    } else {
        args.push(format!(
            "--stderr={}",
            config.stderr_path.as_deref().unwrap_or("/dev/null")
        ));
    }

    args.push(format!("--meta={}", meta_path.display()));
    args.extend(["--silent", "--run", "--"].map(String::from));
    args
}

fn substitute_memory(command: &[String], memory_limit: Option<u32>) -> Vec<String> {
    match memory_limit {
        Some(limit) => {
            let limit = limit.to_string();
            command
                .iter()
                .map(|arg| arg.replace(MEMORY_PLACEHOLDER, &limit))
                .collect()
        }
        None => command.to_vec(),
    }
}

/// Outcomes caused by isolate itself rather than by the program under test
fn is_transient(result: &Option<RunResult>) -> bool {
    match result {
        Some(r) if r.status == RunStatus::InternalError => true,
        // "Text file busy" on execve shows up as exit code 127
        Some(r) => r.exit_code == 127 && r.internal_message.contains("execve"),
        None => false,
    }
}

async fn interrupt(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!("Could not interrupt isolate ({}): {}", pid, e);
        }
    }
    if tokio::time::timeout(CANCEL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

/// Isolate box manager
pub struct IsolateBox {
    isolate_path: PathBuf,
    box_id: u32,
    /// Directory printed by `isolate --init`; sandbox paths start below it
    root: PathBuf,
    memory_quota: u32,
    retry_policy: RetryPolicy,
    lock: Mutex<()>,
}

impl IsolateBox {
    /// Create and initialize a new isolate box, repairing known bad states
    pub async fn new(isolate_path: impl Into<PathBuf>, box_id: u32, memory_quota: u32) -> Result<Self> {
        let isolate_path = isolate_path.into();
        let args = vec![
            "--cg".to_string(),
            format!("--box-id={}", box_id),
            "--init".to_string(),
        ];
        let mut applied: Vec<Repair> = Vec::new();

        for _ in 0..=MAX_INIT_REPAIRS {
            let output = isolate_output(&isolate_path, &args).await?;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            match classify_init(output.status.success(), &stdout, &stderr) {
                InitState::Ready(root) => {
                    info!("Initialized isolate box {} at {:?}", box_id, root);
                    return Ok(Self {
                        isolate_path,
                        box_id,
                        root,
                        memory_quota,
                        retry_policy: RUN_RETRY_POLICY,
                        lock: Mutex::new(()),
                    });
                }
                InitState::NeedsRepair(repair) if !applied.contains(&repair) => {
                    info!("Box {} reset ({:?})", box_id, repair);
                    repair_box(&isolate_path, box_id, repair).await?;
                    applied.push(repair);
                }
                _ => {
                    return Err(EvalError::BoxInit {
                        box_id,
                        output: format!("{}{}", stdout, stderr).trim().to_string(),
                    });
                }
            }
        }

        Err(EvalError::BoxInit {
            box_id,
            output: "box did not become ready after repairs".to_string(),
        })
    }

    /// Override the retry policy for transient isolate failures
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Get the path to the box directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a sandbox path onto the host filesystem
    fn host_path(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(EvalError::InvalidPath(path.to_string()));
                }
            }
        }
        Ok(resolved)
    }

    /// Map a sandbox path, refusing to pass through any symlink below the root.
    ///
    /// Everything under the box is writable by the program that just ran there.
    async fn checked_path(&self, path: &str) -> Result<PathBuf> {
        let target = self.host_path(path)?;
        let relative = target.strip_prefix(&self.root).unwrap_or(Path::new(""));

        let mut current = self.root.clone();
        for part in relative.components() {
            current.push(part);
            match fs::symlink_metadata(&current).await {
                Ok(meta) if meta.file_type().is_symlink() => {
                    warn!("Refusing to follow symlink {:?} in box {}", current, self.box_id);
                    return Err(EvalError::InvalidPath(path.to_string()));
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(target)
    }

    async fn run_once(
        &self,
        token: &CancellationToken,
        command: &[String],
        config: &RunConfig,
        attempt: u32,
    ) -> Result<Option<RunResult>> {
        if token.is_cancelled() {
            return Err(EvalError::Cancelled);
        }

        let meta_file = tempfile::Builder::new().prefix("judge-meta-").tempfile()?;
        let diagnostics = tempfile::Builder::new().prefix("judge-isolate-").tempfile()?;

        let mut args = build_run_flags(self.box_id, self.memory_quota, config, meta_file.path());
        args.extend(command.iter().cloned());
        debug!("Running isolate (attempt {}) with args: {:?}", attempt, args);

        let mut child = Command::new(&self.isolate_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(diagnostics.as_file().try_clone()?)
            .stderr(diagnostics.as_file().try_clone()?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EvalError::IsolateSpawn {
                path: self.isolate_path.clone(),
                source,
            })?;

        tokio::select! {
            status = child.wait() => {
                // isolate exits non-zero whenever the program fails; the meta file says why
                debug!("isolate exited with {}", status?);
            }
            _ = token.cancelled() => {
                interrupt(&mut child).await;
                return Err(EvalError::Cancelled);
            }
        }

        let mut result = read_meta_file(meta_file.path()).await;
        if let Some(result) = result.as_mut() {
            result.internal_message = fs::read_to_string(diagnostics.path())
                .await
                .unwrap_or_default()
                .trim()
                .to_string();
        }
        Ok(result)
    }
}

#[async_trait]
impl Sandbox for IsolateBox {
    fn box_id(&self) -> u32 {
        self.box_id
    }

    fn memory_quota(&self) -> u32 {
        self.memory_quota
    }

    async fn write_file(&self, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        let target = self.checked_path(path).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(&target)
            .await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        // umask and pre-existing files both ignore the open mode
        file.set_permissions(std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let target = self.checked_path(path).await?;
        // FIFOs and devices would block or read forever
        if !fs::symlink_metadata(&target).await?.is_file() {
            return Err(EvalError::InvalidPath(path.to_string()));
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .open(&target)
            .await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn file_exists(&self, path: &str) -> bool {
        let _guard = self.lock.lock().await;
        let target = match self.checked_path(path).await {
            Ok(target) => target,
            Err(e) => {
                debug!("File stat ({:?}) rejected: {}", path, e);
                return false;
            }
        };
        match fs::try_exists(&target).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!("File stat ({:?}) returned weird error: {}", path, e);
                false
            }
        }
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        Ok(fs::remove_file(self.checked_path(path).await?).await?)
    }

    #[instrument(skip_all, fields(box_id))]
    async fn run_command(
        &self,
        token: &CancellationToken,
        command: &[String],
        config: &RunConfig,
    ) -> Result<Option<RunResult>> {
        tracing::Span::current().record("box_id", self.box_id);
        let _guard = self.lock.lock().await;

        let Some(program) = command.first() else {
            return Err(EvalError::CommandResolve {
                command: String::new(),
                reason: "empty command".to_string(),
            });
        };
        if program.starts_with("/box") {
            let exists = match self.host_path(program) {
                Ok(path) => fs::try_exists(path).await.unwrap_or(false),
                Err(_) => false,
            };
            if !exists {
                warn!("Executable {} does not exist in sandbox and will probably error", program);
            }
        }

        let memory_limit = effective_memory_limit(config.memory_limit_kb, self.memory_quota);
        let command = substitute_memory(command, memory_limit);

        let result = retry(
            self.retry_policy,
            |attempt| self.run_once(token, &command, config, attempt),
            is_transient,
        )
        .await?;

        info!(
            target: AUDIT_TARGET,
            box_id = self.box_id,
            memory_quota = self.memory_quota,
            command = ?command,
            stats = %serde_json::to_string(&result).unwrap_or_default(),
            "Ran command"
        );

        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let args = vec![
            "--cg".to_string(),
            format!("--box-id={}", self.box_id),
            "--cleanup".to_string(),
        ];
        let output = isolate_output(&self.isolate_path, &args).await?;
        if !output.status.success() {
            return Err(EvalError::BoxCleanup {
                box_id: self.box_id,
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!("Cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}

/// Report the installed isolate version
pub async fn isolate_version(isolate_path: &Path) -> String {
    match isolate_output(isolate_path, &["--version".to_string()]).await {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            let line = text.lines().next().unwrap_or_default();
            line.trim_start_matches("The process isolator ").trim().to_string()
        }
        _ => "unknown".to_string(),
    }
}

/// Check that a box can be created and destroyed on this host
pub async fn check_can_run(isolate_path: &Path) -> bool {
    let sandbox = match IsolateBox::new(isolate_path, 0, 0).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            warn!("Error creating sandbox: {}", e);
            return false;
        }
    };
    if let Err(e) = sandbox.close().await {
        warn!("Error closing sandbox: {}", e);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::run_config::Directory;
    use crate::sandbox::testutil::FakeIsolate;

    const FAST_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(1));

    #[test]
    fn test_classify_init() {
        assert_eq!(
            classify_init(true, "/var/local/lib/isolate/3\n", ""),
            InitState::Ready(PathBuf::from("/var/local/lib/isolate/3"))
        );
        assert_eq!(
            classify_init(false, "", "Box already exists\n"),
            InitState::NeedsRepair(Repair::StaleBox)
        );
        assert_eq!(
            classify_init(false, "", "Box 3 was created in incompatible control group mode\n"),
            InitState::NeedsRepair(Repair::CgroupMismatch)
        );
        assert_eq!(
            classify_init(false, "Must be started as root\n", ""),
            InitState::NeedsRepair(Repair::NeedsRoot)
        );
        assert_eq!(classify_init(false, "", "Cannot create box\n"), InitState::Failed);
        assert_eq!(classify_init(true, "", ""), InitState::Failed);
    }

    #[test]
    fn test_build_run_flags() {
        let env: std::collections::BTreeMap<String, String> =
            [("GOMAXPROCS".to_string(), "1".to_string())].into();
        let config = RunConfig::new()
            .with_directories([Directory::new("/etc"), Directory::removed("/lib64")])
            .with_inherit_env(true)
            .with_env(&env)
            .with_time_limits(1.0, 3.0)
            .with_memory_limit(32768)
            .with_stdout("/box/out")
            .with_stderr_to_stdout(true);

        let flags = build_run_flags(7, 0, &config, Path::new("/tmp/meta"));
        assert_eq!(
            flags,
            [
                "--box-id=7",
                "--cg",
                "--processes",
                "--dir=/etc=/etc",
                "--dir=/lib64=",
                "--full-env",
                "--env=GOMAXPROCS=1",
                "--time=1",
                "--wall-time=3",
                "--cg-mem=32768",
                "--stdin=/dev/null",
                "--stdout=/box/out",
                "--stderr-to-stdout",
                "--meta=/tmp/meta",
                "--silent",
                "--run",
                "--",
            ]
        );
    }

    #[test]
    fn test_build_run_flags_clamps_to_quota() {
        let config = RunConfig::new().with_memory_limit(1 << 20);
        let flags = build_run_flags(1, 65536, &config, Path::new("/tmp/meta"));
        assert!(flags.contains(&"--cg-mem=65536".to_string()));
        assert!(flags.contains(&"--stderr=/dev/null".to_string()));

        let flags = build_run_flags(1, 65536, &RunConfig::new(), Path::new("/tmp/meta"));
        assert!(flags.contains(&"--cg-mem=65536".to_string()));

        let flags = build_run_flags(1, 0, &RunConfig::new(), Path::new("/tmp/meta"));
        assert!(!flags.iter().any(|f| f.starts_with("--cg-mem")));
        assert!(!flags.iter().any(|f| f.starts_with("--time")));
    }

    #[test]
    fn test_substitute_memory() {
        let command = vec!["java".to_string(), "-Xmx<MEMORY>k".to_string()];
        assert_eq!(substitute_memory(&command, Some(2048))[1], "-Xmx2048k");
        assert_eq!(substitute_memory(&command, None)[1], "-Xmx<MEMORY>k");
    }

    #[test]
    fn test_is_transient() {
        let internal = RunResult {
            status: RunStatus::InternalError,
            ..Default::default()
        };
        let busy = RunResult {
            status: RunStatus::RuntimeError,
            exit_code: 127,
            internal_message: "execve(\"/box/output\"): Text file busy".into(),
            ..Default::default()
        };
        let timeout = RunResult {
            status: RunStatus::TimedOut,
            ..Default::default()
        };
        assert!(is_transient(&Some(internal)));
        assert!(is_transient(&Some(busy)));
        assert!(!is_transient(&Some(timeout)));
        assert!(!is_transient(&None));
    }

    #[tokio::test]
    async fn test_init_and_file_io() {
        let fake = FakeIsolate::shared();
        let sandbox = IsolateBox::new(fake.path(), fake.next_box_id(), 0).await.unwrap();

        sandbox.write_file("/box/main.c", b"int main(){}", 0o644).await.unwrap();
        assert!(sandbox.file_exists("/box/main.c").await);
        assert_eq!(sandbox.read_file("/box/main.c").await.unwrap(), b"int main(){}");

        let mode = std::fs::metadata(sandbox.root().join("box/main.c"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);

        sandbox.remove_file("/box/main.c").await.unwrap();
        assert!(!sandbox.file_exists("/box/main.c").await);

        sandbox.close().await.unwrap();
        assert!(!sandbox.root().exists());
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_root() {
        let fake = FakeIsolate::shared();
        let sandbox = IsolateBox::new(fake.path(), fake.next_box_id(), 0).await.unwrap();

        let err = sandbox.write_file("/box/../../escape", b"x", 0o644).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));
        assert!(!sandbox.file_exists("../secret").await);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_symlinks_in_box_are_not_followed() {
        let fake = FakeIsolate::shared();
        let sandbox = IsolateBox::new(fake.path(), fake.next_box_id(), 0).await.unwrap();

        let host_dir = tempfile::tempdir().unwrap();
        let secret = host_dir.path().join("secret.txt");
        std::fs::write(&secret, "HOST-SECRET").unwrap();
        let box_dir = sandbox.root().join("box");
        std::os::unix::fs::symlink(&secret, box_dir.join("output.txt")).unwrap();
        std::os::unix::fs::symlink(host_dir.path(), box_dir.join("outdir")).unwrap();

        assert!(!sandbox.file_exists("/box/output.txt").await);
        let err = sandbox.read_file("/box/output.txt").await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));
        let err = sandbox.read_file("/box/outdir/secret.txt").await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));

        let err = sandbox.write_file("/box/output.txt", b"overwritten", 0o644).await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));
        let err = sandbox.remove_file("/box/outdir/secret.txt").await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));
        assert_eq!(std::fs::read_to_string(&secret).unwrap(), "HOST-SECRET");

        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_rejects_fifo() {
        let fake = FakeIsolate::shared();
        let sandbox = IsolateBox::new(fake.path(), fake.next_box_id(), 0).await.unwrap();

        let fifo = sandbox.root().join("box/output.txt");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();
        let err = sandbox.read_file("/box/output.txt").await.unwrap_err();
        assert!(matches!(err, EvalError::InvalidPath(_)));

        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_repairs_each_state_once() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.queue_init_failures(
            box_id,
            &["Box already exists", "Box was created in incompatible control group mode"],
        );

        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();
        let cleanups: Vec<String> = fake
            .calls(box_id)
            .into_iter()
            .filter(|c| c.starts_with("cleanup"))
            .collect();
        // A box from the other cgroup mode can only be removed without --cg
        assert_eq!(
            cleanups,
            [
                format!("cleanup --cg --box-id={} --cleanup", box_id),
                format!("cleanup --box-id={} --cleanup", box_id),
            ]
        );
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_gives_up_on_repeated_state() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.queue_init_failures(box_id, &["Box already exists", "Box already exists"]);

        let err = IsolateBox::new(fake.path(), box_id, 0).await.err().unwrap();
        assert!(matches!(err, EvalError::BoxInit { .. }));
    }

    #[tokio::test]
    async fn test_missing_isolate_is_fatal() {
        let err = IsolateBox::new("/nonexistent/isolate", 1, 0).await.err().unwrap();
        assert!(matches!(err, EvalError::IsolateSpawn { .. }));
    }

    #[tokio::test]
    async fn test_run_parses_meta() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.set_meta(box_id, "status:RE\nexitcode:1\nexitsig:11\ntime:0.42\ncg-mem:2048\n");
        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();

        let token = CancellationToken::new();
        let result = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.status, RunStatus::RuntimeError);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.memory_kb, 2048);
        assert_eq!(fake.run_count(box_id), 1);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_internal_error_is_retried_three_times() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.set_meta(box_id, "status:XX\nmessage:cgroup setup failed\n");
        let sandbox = IsolateBox::new(fake.path(), box_id, 0)
            .await
            .unwrap()
            .with_retry_policy(FAST_RETRY);

        let token = CancellationToken::new();
        let result = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.status, RunStatus::InternalError);
        assert_eq!(fake.run_count(box_id), 3);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_program_timeout_is_not_retried() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.set_meta(box_id, "status:TO\ntime:1.001\nkilled:1\n");
        let sandbox = IsolateBox::new(fake.path(), box_id, 0)
            .await
            .unwrap()
            .with_retry_policy(FAST_RETRY);

        let token = CancellationToken::new();
        let result = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.status, RunStatus::TimedOut);
        assert_eq!(fake.run_count(box_id), 1);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_meta_yields_none() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.set_meta(box_id, "");
        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();

        let token = CancellationToken::new();
        let result = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(fake.run_count(box_id), 1);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_passes_clamped_memory() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        let sandbox = IsolateBox::new(fake.path(), box_id, 4096).await.unwrap();

        let token = CancellationToken::new();
        let config = RunConfig::new().with_memory_limit(65536);
        sandbox
            .run_command(&token, &["/box/output".to_string(), "<MEMORY>".to_string()], &config)
            .await
            .unwrap();

        let args = fake.last_run_args(box_id);
        assert!(args.contains(&"--cg-mem=4096".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("4096"));
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_run() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::Cancelled));
        assert_eq!(fake.run_count(box_id), 0);
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_isolate() {
        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        fake.set_sleep(box_id, 5);
        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = sandbox
            .run_command(&token, &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(4));
        sandbox.close().await.unwrap();
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_runs_are_audited_on_their_own_target() {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::{filter::Targets, fmt, Layer};

        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .with_filter(Targets::new().with_target(AUDIT_TARGET, tracing::Level::INFO)),
        );
        let _guard = tracing::subscriber::set_default(subscriber);

        let fake = FakeIsolate::shared();
        let box_id = fake.next_box_id();
        let sandbox = IsolateBox::new(fake.path(), box_id, 0).await.unwrap();
        sandbox
            .run_command(&CancellationToken::new(), &["/box/output".to_string()], &RunConfig::new())
            .await
            .unwrap();
        sandbox.close().await.unwrap();

        let logged = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = logged.lines().collect();
        // Init and cleanup messages stay off the audit target
        assert_eq!(lines.len(), 1, "{}", logged);
        assert!(lines[0].contains("Ran command"));
        assert!(lines[0].contains(&format!("box_id={}", box_id)));
    }

    #[tokio::test]
    async fn test_version_and_can_run() {
        let fake = FakeIsolate::shared();
        assert_eq!(isolate_version(fake.path()).await, "2.0");
        assert!(check_can_run(fake.path()).await);
        assert_eq!(isolate_version(Path::new("/nonexistent/isolate")).await, "unknown");
    }
}
