//! Execution of one run's phase as an ordered pipeline of fallible steps.
//!
//! An operation owns a freshly created working directory and a cancelable
//! context. Steps run strictly in order, share the working directory and the
//! run's live log stream, and the first failure aborts the remainder. A
//! graceful cancellation stops the pipeline before its next step; a forced
//! cancellation also kills whichever subprocess is currently running.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::client::{EngineClients, LogSink, PlanFormat, RunService};
use crate::config::{Config, DEFAULT_ENVS, plugin_cache_dir};
use crate::download::Downloader;
use crate::error::EngineError;
use crate::report::PlanReport;
use crate::run::{Phase, Run};
use crate::sandbox;
use crate::terminator::Cancelable;
use crate::variable::{Variable, VariableCategory, write_terraform_vars};

pub const LOCAL_STATE_FILENAME: &str = "terraform.tfstate";
pub const PLAN_FILENAME: &str = "plan.out";
pub const JSON_PLAN_FILENAME: &str = "plan.out.json";
pub const LOCK_FILENAME: &str = ".terraform.lock.hcl";

/// The cancelable handle checked in with the terminator while an operation
/// executes.
#[derive(Default)]
pub struct OperationHandle {
    canceled: AtomicBool,
    token: CancellationToken,
}

impl OperationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation (graceful or forced) has been requested.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Cancelable for OperationHandle {
    fn cancel(&self, force: bool) {
        self.canceled.store(true, Ordering::SeqCst);
        // only a forced cancellation interrupts the step in flight
        if force {
            self.token.cancel();
        }
    }
}

/// Forwards output to the run's live phase log.
#[derive(Clone)]
pub struct PhaseWriter {
    runs: Arc<dyn RunService>,
    run_id: String,
    phase: Phase,
}

impl PhaseWriter {
    pub fn new(runs: Arc<dyn RunService>, run_id: String, phase: Phase) -> Self {
        Self {
            runs,
            run_id,
            phase,
        }
    }
}

#[async_trait]
impl LogSink for PhaseWriter {
    async fn write(&self, chunk: &[u8]) -> Result<(), EngineError> {
        self.runs
            .put_log_chunk(&self.run_id, self.phase, chunk.to_vec())
            .await
    }
}

/// One step of a run's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DownloadTerraform,
    DownloadConfig,
    WriteVars,
    StripBackend,
    DownloadState,
    Init,
    Plan,
    ConvertPlanToJson,
    UploadPlan,
    UploadJsonPlan,
    UploadLockFile,
    FinishPlan,
    DownloadLockFile,
    DownloadPlanFile,
    Apply,
    FinishApply,
}

/// Ordered steps comprising the execution of `phase`.
pub fn steps_for(phase: Phase) -> Result<Vec<Step>, EngineError> {
    let mut steps = vec![
        Step::DownloadTerraform,
        Step::DownloadConfig,
        Step::WriteVars,
        Step::StripBackend,
        Step::DownloadState,
    ];
    match phase {
        Phase::Plan => {
            steps.extend([
                Step::Init,
                Step::Plan,
                Step::ConvertPlanToJson,
                Step::UploadPlan,
                Step::UploadJsonPlan,
                Step::UploadLockFile,
                Step::FinishPlan,
            ]);
            Ok(steps)
        }
        Phase::Apply => {
            // the lock file from the plan phase pins provider versions so
            // both phases resolve the same providers
            steps.extend([
                Step::DownloadLockFile,
                Step::DownloadPlanFile,
                Step::Init,
                Step::Apply,
                Step::FinishApply,
            ]);
            Ok(steps)
        }
        other => Err(anyhow!("phase {other} is not executable").into()),
    }
}

/// The working directory of one execution: a temp directory holding the
/// unpacked configuration, removed on drop whatever the outcome. `relative`
/// is the workspace's configured sub-path that terraform runs from.
struct Workdir {
    root: tempfile::TempDir,
    relative: String,
}

impl Workdir {
    fn new(relative: &str) -> Result<Self, EngineError> {
        let root = tempfile::TempDir::with_prefix("terraflow-run-")?;
        Ok(Self {
            root,
            relative: relative.to_string(),
        })
    }

    fn root(&self) -> &Path {
        self.root.path()
    }

    fn path(&self) -> PathBuf {
        if self.relative.is_empty() {
            self.root.path().to_path_buf()
        } else {
            self.root.path().join(&self.relative)
        }
    }

    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<(), EngineError> {
        tokio::fs::write(self.path().join(name), contents).await?;
        Ok(())
    }

    async fn read_file(&self, name: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.path().join(name)).await
    }
}

struct ExecOptions {
    /// Sandbox the invocation if the engine is configured with a sandbox.
    sandbox_if_enabled: bool,
    /// Redirect stdout into this file in the working directory instead of
    /// the live log.
    redirect_stdout: Option<&'static str>,
    /// Append stdout to the captured output used for summary parsing.
    capture: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            sandbox_if_enabled: false,
            redirect_stdout: None,
            capture: false,
        }
    }
}

/// Executes one run's phase.
pub struct Operation {
    run: Run,
    config: Config,
    clients: EngineClients,
    downloader: Arc<Downloader>,
    handle: Arc<OperationHandle>,
    out: PhaseWriter,
    workdir: Workdir,
    envs: Vec<(String, String)>,
    variables: Vec<Variable>,
    terraform_path: PathBuf,
    /// Combined init+plan (or apply) output, parsed into the change summary.
    captured: Vec<u8>,
}

impl Operation {
    pub fn new(
        run: Run,
        config: Config,
        clients: EngineClients,
        downloader: Arc<Downloader>,
        handle: Arc<OperationHandle>,
    ) -> Result<Self, EngineError> {
        let workdir = Workdir::new(&run.working_directory)?;
        let out = PhaseWriter::new(clients.runs.clone(), run.id.clone(), run.phase);
        let mut envs: Vec<(String, String)> = DEFAULT_ENVS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if config.plugin_cache {
            envs.push((
                "TF_PLUGIN_CACHE_DIR".to_string(),
                plugin_cache_dir().to_string_lossy().into_owned(),
            ));
        }
        Ok(Self {
            run,
            config,
            clients,
            downloader,
            handle,
            out,
            workdir,
            envs,
            variables: Vec::new(),
            terraform_path: PathBuf::new(),
            captured: Vec::new(),
        })
    }

    /// Run the phase's pipeline to completion, cancellation or first error.
    /// Errors other than cancellation are written to the live log with a
    /// highlighted banner before being returned.
    pub async fn execute(mut self) -> Result<(), EngineError> {
        let result = self.do_steps().await;
        if let Err(err) = &result
            && !err.is_canceled()
        {
            // force color on the non-tty log stream, as terraform itself does
            let banner = console::Style::new()
                .red()
                .bright()
                .force_styling(true)
                .apply_to("Error: ");
            // a log-delivery failure must not mask the step error
            let _ = self.out.write(format!("\n{banner}{err}\n").as_bytes()).await;
        }
        result
    }

    async fn do_steps(&mut self) -> Result<(), EngineError> {
        let steps = steps_for(self.run.phase)?;

        self.variables = self.clients.runs.list_variables(&self.run.id).await?;
        for v in &self.variables {
            if v.category == VariableCategory::Env {
                self.envs.push((v.key.clone(), v.value.clone()));
            }
        }

        if self.config.debug {
            let info = format!(
                "\nDebug mode enabled\n------------------\nPhase: {}\nSandbox mode: {}\n------------------\n\n",
                self.run.phase, self.config.sandbox,
            );
            self.out.write(info.as_bytes()).await?;
        }

        for step in steps {
            // skip remaining steps if the operation was canceled
            if self.handle.is_canceled() {
                return Err(EngineError::Canceled);
            }
            self.run_step(step).await?;
        }
        Ok(())
    }

    async fn run_step(&mut self, step: Step) -> Result<(), EngineError> {
        match step {
            Step::DownloadTerraform => self.download_terraform().await,
            Step::DownloadConfig => self.download_config().await,
            Step::WriteVars => self.write_vars().await,
            Step::StripBackend => self.strip_backend(),
            Step::DownloadState => self.download_state().await,
            Step::Init => self.terraform_init().await,
            Step::Plan => self.terraform_plan().await,
            Step::ConvertPlanToJson => self.convert_plan_to_json().await,
            Step::UploadPlan => self.upload_plan().await,
            Step::UploadJsonPlan => self.upload_json_plan().await,
            Step::UploadLockFile => self.upload_lock_file().await,
            Step::FinishPlan => self.finish_plan().await,
            Step::DownloadLockFile => self.download_lock_file().await,
            Step::DownloadPlanFile => self.download_plan_file().await,
            Step::Apply => self.terraform_apply().await,
            Step::FinishApply => self.finish_apply().await,
        }
    }

    async fn download_terraform(&mut self) -> Result<(), EngineError> {
        self.terraform_path = self
            .downloader
            .download(&self.handle.token, &self.run.terraform_version, &self.out)
            .await?;
        Ok(())
    }

    async fn download_config(&mut self) -> Result<(), EngineError> {
        let tarball = self
            .clients
            .configs
            .download(&self.run.configuration_version_id)
            .await
            .context("unable to download config")?;
        crate::archive::unpack(std::io::Cursor::new(tarball), self.workdir.root())
            .context("unable to unpack config")?;
        Ok(())
    }

    async fn write_vars(&mut self) -> Result<(), EngineError> {
        write_terraform_vars(&self.workdir.path(), &self.variables)
            .context("writing terraform.tfvars")?;
        Ok(())
    }

    fn strip_backend(&mut self) -> Result<(), EngineError> {
        self.clients.hcl.strip_backend(&self.workdir.path())
    }

    /// Download current state to disk. The workspace having no state yet is
    /// not an error; nothing is written.
    async fn download_state(&mut self) -> Result<(), EngineError> {
        let current = match self.clients.states.current(&self.run.workspace_id).await {
            Err(err) if err.is_not_found() => return Ok(()),
            other => other.context("retrieving current state version")?,
        };
        let statefile = self
            .clients
            .states
            .download(&current.id)
            .await
            .context("downloading state version")?;
        self.workdir
            .write_file(LOCAL_STATE_FILENAME, &statefile)
            .await
    }

    async fn terraform_init(&mut self) -> Result<(), EngineError> {
        self.terraform(
            &["init"],
            ExecOptions {
                capture: self.run.phase == Phase::Plan,
                ..Default::default()
            },
        )
        .await
    }

    async fn terraform_plan(&mut self) -> Result<(), EngineError> {
        let mut args = vec!["plan"];
        if self.run.is_destroy {
            args.push("-destroy");
        }
        let out_flag = format!("-out={PLAN_FILENAME}");
        args.push(&out_flag);
        self.terraform(
            &args,
            ExecOptions {
                capture: true,
                ..Default::default()
            },
        )
        .await
    }

    async fn convert_plan_to_json(&mut self) -> Result<(), EngineError> {
        self.terraform(
            &["show", "-json", PLAN_FILENAME],
            ExecOptions {
                redirect_stdout: Some(JSON_PLAN_FILENAME),
                ..Default::default()
            },
        )
        .await
    }

    async fn upload_plan(&mut self) -> Result<(), EngineError> {
        let file = self.workdir.read_file(PLAN_FILENAME).await?;
        self.clients
            .runs
            .upload_plan_file(&self.run.id, &file, PlanFormat::Binary)
            .await
            .context("unable to upload plan")?;
        Ok(())
    }

    async fn upload_json_plan(&mut self) -> Result<(), EngineError> {
        let file = self.workdir.read_file(JSON_PLAN_FILENAME).await?;
        self.clients
            .runs
            .upload_plan_file(&self.run.id, &file, PlanFormat::Json)
            .await
            .context("unable to upload JSON plan")?;
        Ok(())
    }

    /// Upload the provider lock file for the apply phase. Terraform not
    /// having produced one is fine.
    async fn upload_lock_file(&mut self) -> Result<(), EngineError> {
        let file = match self.workdir.read_file(LOCK_FILENAME).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            other => other.context("reading lock file")?,
        };
        self.clients
            .runs
            .upload_lock_file(&self.run.id, &file)
            .await
            .context("unable to upload lock file")?;
        Ok(())
    }

    async fn finish_plan(&mut self) -> Result<(), EngineError> {
        let output = String::from_utf8_lossy(&self.captured);
        let report = PlanReport::from_plan_output(&output)?;
        tracing::info!(
            run_id = %self.run.id,
            adds = report.adds,
            changes = report.changes,
            deletions = report.deletions,
            "finished plan",
        );
        self.clients.runs.finish_plan(&self.run.id, report).await
    }

    /// Write the lock file uploaded by the plan phase into the working
    /// directory; an empty file when none was uploaded, which is harmless.
    async fn download_lock_file(&mut self) -> Result<(), EngineError> {
        let file = match self.clients.runs.download_lock_file(&self.run.id).await {
            Err(err) if err.is_not_found() => Vec::new(),
            other => other?,
        };
        self.workdir.write_file(LOCK_FILENAME, &file).await
    }

    async fn download_plan_file(&mut self) -> Result<(), EngineError> {
        let plan = self.clients.runs.download_plan_file(&self.run.id).await?;
        self.workdir.write_file(PLAN_FILENAME, &plan).await
    }

    /// Run `terraform apply` and upload the state file it leaves behind.
    /// Terraform v1.5+ can persist partially-applied state from a failed
    /// apply, so the upload happens whatever the apply's outcome; state
    /// that did not change is not re-uploaded.
    async fn terraform_apply(&mut self) -> Result<(), EngineError> {
        let before = self.read_state_file().await?;

        let mut args = vec!["apply"];
        if self.run.is_destroy {
            args.push("-destroy");
        }
        args.push(PLAN_FILENAME);
        let applied = self
            .terraform(
                &args,
                ExecOptions {
                    sandbox_if_enabled: true,
                    capture: true,
                    ..Default::default()
                },
            )
            .await;

        let uploaded = self.upload_changed_state(before.as_deref()).await;
        match (applied, uploaded) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(apply), Ok(())) => Err(apply),
            (Ok(()), Err(upload)) => Err(upload),
            (Err(apply), Err(upload)) => {
                if apply.is_canceled() {
                    tracing::error!(
                        run_id = %self.run.id,
                        error = %upload,
                        "uploading state after canceled apply",
                    );
                    Err(apply)
                } else {
                    Err(anyhow!("{apply}; state upload also failed: {upload}").into())
                }
            }
        }
    }

    async fn read_state_file(&self) -> Result<Option<Vec<u8>>, EngineError> {
        match self.workdir.read_file(LOCAL_STATE_FILENAME).await {
            Ok(statefile) => Ok(Some(statefile)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Sanity-check and upload the local state file if the apply created or
    /// changed it.
    async fn upload_changed_state(&self, before: Option<&[u8]>) -> Result<(), EngineError> {
        let Some(statefile) = self.read_state_file().await? else {
            return Ok(());
        };
        if before == Some(statefile.as_slice()) {
            return Ok(());
        }
        let parsed: StateFile =
            serde_json::from_slice(&statefile).context("malformed state file")?;
        tracing::debug!(
            run_id = %self.run.id,
            serial = parsed.serial,
            "uploading state version",
        );
        self.clients
            .states
            .create(&self.run.workspace_id, &statefile)
            .await?;
        Ok(())
    }

    async fn finish_apply(&mut self) -> Result<(), EngineError> {
        let output = String::from_utf8_lossy(&self.captured);
        let report = PlanReport::from_apply_output(&output)?;
        tracing::info!(
            run_id = %self.run.id,
            adds = report.adds,
            changes = report.changes,
            deletions = report.deletions,
            "finished apply",
        );
        self.clients.runs.finish_apply(&self.run.id, report).await
    }

    async fn terraform(&mut self, args: &[&str], opts: ExecOptions) -> Result<(), EngineError> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.terraform_path.to_string_lossy().into_owned());
        argv.extend(args.iter().map(|a| a.to_string()));
        self.execute_cmd(argv, opts).await
    }

    /// Spawn a subprocess in the working directory, streaming its output to
    /// the live log. A forced cancellation kills it.
    async fn execute_cmd(
        &mut self,
        args: Vec<String>,
        opts: ExecOptions,
    ) -> Result<(), EngineError> {
        if args.is_empty() {
            return Err(anyhow!("missing command name").into());
        }
        let args = if opts.sandbox_if_enabled && self.config.sandbox {
            let cache = self.config.plugin_cache.then(plugin_cache_dir);
            sandbox::wrap(
                &args,
                self.workdir.root(),
                &self.workdir.relative,
                cache.as_deref(),
            )
        } else {
            args
        };

        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(self.workdir.path())
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", args[0]))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("child stderr not piped"))?;

        let stdout_to_log = opts.redirect_stdout.is_none();
        let out = self.out.clone();
        let run = async {
            let (stdout_cap, stderr_cap) = tokio::try_join!(
                pump(stdout, stdout_to_log.then_some(&out)),
                // stderr goes to the log and is also retained so a failure
                // can relay it
                pump(stderr, Some(&out)),
            )?;
            let status = child.wait().await?;
            Ok::<_, EngineError>((status, stdout_cap, stderr_cap))
        };

        let token = self.handle.token.clone();
        let (status, stdout_cap, stderr_cap) = tokio::select! {
            biased;
            _ = token.cancelled() => {
                child.start_kill().ok();
                let _ = child.wait().await;
                return Err(EngineError::Canceled);
            }
            finished = run => finished?,
        };

        if let Some(name) = opts.redirect_stdout {
            self.workdir.write_file(name, &stdout_cap).await?;
        } else if opts.capture {
            self.captured.extend_from_slice(&stdout_cap);
        }

        if !status.success() {
            return Err(EngineError::CommandFailed {
                program: args[0].clone(),
                code: status.code(),
                stderr: clean_stderr(&String::from_utf8_lossy(&stderr_cap)),
            });
        }
        Ok(())
    }
}

/// Forward a child stream to the live log while retaining a copy.
async fn pump(
    mut reader: impl AsyncReadExt + Unpin,
    out: Option<&PhaseWriter>,
) -> Result<Vec<u8>, EngineError> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(out) = out {
            out.write(&buf[..n]).await?;
        }
        captured.extend_from_slice(&buf[..n]);
    }
    Ok(captured)
}

#[derive(Debug, Deserialize)]
struct StateFile {
    serial: i64,
}

static ANSI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());
static NON_ASCII: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^[:ascii:]]").unwrap());

/// Clean up stderr output to make it suitable for an error message:
/// newlines, ansi escape sequences and non-ascii characters are removed.
fn clean_stderr(stderr: &str) -> String {
    let stripped = ANSI.replace_all(stderr, "");
    let ascii = NON_ASCII.replace_all(&stripped, "");
    ascii.split_whitespace().collect::<Vec<_>>().join(" ")
}
