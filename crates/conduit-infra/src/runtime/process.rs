//! Runtime hosts for `run` tasks backed by `tokio::process`.
//!
//! [`ShellHost`] runs `shell` processes as a program plus arguments without
//! a shell in between. [`ScriptHost`] hands inline `script` code to a
//! language interpreter. Both capture stdout and stderr in full, and both
//! kill the child when the task's cancellation token fires.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;

use conduit_core::workflow::capability::{ProcessOutput, ProcessRequest, RuntimeHost};
use conduit_types::error::TaskError;
use conduit_types::task::ProcessSpec;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ShellHost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ShellHost;

impl ShellHost {
    pub fn new() -> Self {
        Self
    }
}

impl RuntimeHost for ShellHost {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, TaskError> {
        let ProcessSpec::Shell(shell) = &request.process else {
            return Err(TaskError::configuration(format!(
                "shell host cannot run {} processes",
                request.process.kind()
            )));
        };

        let mut command = Command::new(&shell.command);
        command.args(&shell.arguments);
        run_command(command, &shell.environment, &request, cancel).await
    }
}

// ---------------------------------------------------------------------------
// ScriptHost
// ---------------------------------------------------------------------------

/// Program and flag used to run inline code, e.g. `python3 -c <code>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageRuntime {
    pub program: String,
    pub inline_flag: String,
}

impl LanguageRuntime {
    fn new(program: &str, inline_flag: &str) -> Self {
        Self {
            program: program.to_string(),
            inline_flag: inline_flag.to_string(),
        }
    }
}

/// Runs `script` processes through a language-to-interpreter table.
#[derive(Debug, Clone)]
pub struct ScriptHost {
    interpreters: HashMap<String, LanguageRuntime>,
}

impl ScriptHost {
    /// Host with interpreters for `python`, `js`/`javascript`, `bash` and `sh`.
    pub fn new() -> Self {
        let mut interpreters = HashMap::new();
        interpreters.insert("python".to_string(), LanguageRuntime::new("python3", "-c"));
        interpreters.insert("js".to_string(), LanguageRuntime::new("node", "-e"));
        interpreters.insert("javascript".to_string(), LanguageRuntime::new("node", "-e"));
        interpreters.insert("bash".to_string(), LanguageRuntime::new("bash", "-c"));
        interpreters.insert("sh".to_string(), LanguageRuntime::new("sh", "-c"));
        Self { interpreters }
    }

    /// Add or replace the interpreter for `language`.
    pub fn with_interpreter(mut self, language: &str, program: &str, inline_flag: &str) -> Self {
        self.interpreters
            .insert(language.to_lowercase(), LanguageRuntime::new(program, inline_flag));
        self
    }

    pub fn languages(&self) -> Vec<&str> {
        let mut languages: Vec<&str> = self.interpreters.keys().map(String::as_str).collect();
        languages.sort_unstable();
        languages
    }
}

impl Default for ScriptHost {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeHost for ScriptHost {
    async fn run(
        &self,
        request: ProcessRequest,
        cancel: CancellationToken,
    ) -> Result<ProcessOutput, TaskError> {
        let ProcessSpec::Script(script) = &request.process else {
            return Err(TaskError::configuration(format!(
                "script host cannot run {} processes",
                request.process.kind()
            )));
        };
        let Some(interpreter) = self.interpreters.get(&script.language.to_lowercase()) else {
            return Err(TaskError::configuration(format!(
                "unsupported script language '{}'",
                script.language
            )));
        };

        let mut command = Command::new(&interpreter.program);
        command.arg(&interpreter.inline_flag).arg(&script.code);
        // Positional arguments follow the inline code; `sh -c` binds the
        // first one to $0.
        if matches!(script.language.as_str(), "sh" | "bash") && !script.arguments.is_empty() {
            command.arg(&interpreter.program);
        }
        command.args(&script.arguments);
        run_command(command, &script.environment, &request, cancel).await
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

async fn run_command(
    mut command: Command,
    environment: &BTreeMap<String, String>,
    request: &ProcessRequest,
    cancel: CancellationToken,
) -> Result<ProcessOutput, TaskError> {
    command
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let child = command.spawn().map_err(|e| {
        TaskError::runtime(format!("failed to spawn '{program}'"))
            .with_detail(e.to_string())
            .with_instance(request.reference.as_str())
    })?;
    tracing::debug!(
        task = request.reference.as_str(),
        program = program.as_str(),
        pid = child.id(),
        "process spawned"
    );

    // Dropping the wait future on cancellation kills the child.
    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| {
            TaskError::runtime(format!("failed to wait for '{program}'"))
                .with_detail(e.to_string())
                .with_instance(request.reference.as_str())
        })?,
        _ = cancel.cancelled() => {
            tracing::debug!(task = request.reference.as_str(), program = program.as_str(), "process killed");
            return Err(TaskError::runtime(format!("process '{program}' was cancelled"))
                .with_instance(request.reference.as_str()));
        }
    };

    // Killed by a signal: no exit code, report it as a failure.
    let exit_code = output.status.code().unwrap_or(-1);
    tracing::debug!(
        task = request.reference.as_str(),
        program = program.as_str(),
        exit_code,
        "process exited"
    );
    Ok(ProcessOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
