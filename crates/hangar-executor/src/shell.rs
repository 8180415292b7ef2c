//! Local process launcher.

use async_trait::async_trait;
use hangar_core::{Error, Launcher, Result, WorkUnit};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs a task's command as a child process in a per-task workspace.
///
/// A single-element command is handed to the shell (`sh -c`), a longer one
/// is executed directly as program plus arguments. The child is killed if
/// the launch is aborted.
pub struct ShellLauncher {
    workspace_root: PathBuf,
    shell: String,
}

impl ShellLauncher {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            shell: "sh".to_string(),
        }
    }

    /// Use another shell for single-string commands.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Workspace directory for a task.
    pub fn workspace_for(&self, task_id: &str) -> PathBuf {
        let dir: String = task_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.workspace_root.join(dir)
    }

    fn command(&self, program: &str, args: &[String], workspace: &Path) -> Command {
        let mut cmd = if args.is_empty() {
            let mut cmd = Command::new(&self.shell);
            cmd.arg("-c").arg(program);
            cmd
        } else {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        };
        cmd.current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Launcher for ShellLauncher {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn launch(&self, unit: &WorkUnit) -> Result<()> {
        let task = unit.task();
        let Some((program, args)) = task.command.split_first() else {
            debug!(unit = %unit.id, task = %task.id, "Task has no command, nothing to run");
            return Ok(());
        };

        let workspace = self.workspace_for(task.id.as_str());
        tokio::fs::create_dir_all(&workspace).await?;

        let mut cmd = self.command(program, args, &workspace);
        cmd.envs(unit.env()).env("WORKSPACE", &workspace);

        info!(unit = %unit.id, task = %task.id, workspace = %workspace.display(), "Spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn {}: {}", program, e)))?;

        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(log_lines(out, unit.id.to_string(), "stdout"))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(log_lines(err, unit.id.to_string(), "stderr"))
        });

        let status = child.wait().await?;
        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = reader.await;
        }

        if status.success() {
            Ok(())
        } else {
            let message = match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            warn!(unit = %unit.id, task = %task.id, %message, "Process failed");
            Err(Error::ExecutionFailed(message))
        }
    }
}

async fn log_lines(stream: impl AsyncRead + Unpin, unit: String, source: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(unit = %unit, stream = source, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(unit = %unit, stream = source, error = %e, "Failed reading process output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hangar_core::{
        CauseSet, ExecutorRef, ItemId, ItemState, ParametersAction, QueueItem, Task, WorkUnitId,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn unit(task: Task) -> WorkUnit {
        WorkUnit {
            id: WorkUnitId::new(),
            item: QueueItem {
                id: ItemId::new(1),
                task: Arc::new(task),
                state: ItemState::Buildable,
                in_queue_since: Utc::now(),
                deadline: tokio::time::Instant::now(),
                causes: CauseSet::new(),
                actions: vec![Arc::new(ParametersAction::new([(
                    "GREETING".to_string(),
                    "hello".to_string(),
                )]))],
            },
            executor: ExecutorRef {
                node: "main".to_string(),
                number: 0,
                one_off: false,
            },
            dispatched_at: Utc::now(),
        }
    }

    fn shell_task(id: &str, script: &str) -> Task {
        Task::new(id).with_command(vec![script.to_string()])
    }

    #[tokio::test]
    async fn test_successful_command() {
        let root = TempDir::new().unwrap();
        let launcher = ShellLauncher::new(root.path());
        launcher
            .launch(&unit(shell_task("ok", "true")))
            .await
            .unwrap();
        assert!(root.path().join("ok").is_dir());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error() {
        let root = TempDir::new().unwrap();
        let launcher = ShellLauncher::new(root.path());
        let err = launcher
            .launch(&unit(shell_task("bad", "exit 3")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn test_runs_in_workspace_with_env() {
        let root = TempDir::new().unwrap();
        let launcher = ShellLauncher::new(root.path());
        let task = shell_task(
            "env/check",
            r#"echo "$GREETING $HANGAR_TASK $NODE_NAME" > out.txt"#,
        );
        launcher.launch(&unit(task)).await.unwrap();

        let workspace = launcher.workspace_for("env/check");
        assert_eq!(workspace, root.path().join("env_check"));
        let out = std::fs::read_to_string(workspace.join("out.txt")).unwrap();
        assert_eq!(out.trim(), "hello env/check main");
    }

    #[tokio::test]
    async fn test_argv_command_runs_without_shell() {
        let root = TempDir::new().unwrap();
        let launcher = ShellLauncher::new(root.path());
        let task = Task::new("argv").with_command(vec![
            "sh".to_string(),
            "-c".to_string(),
            "exit 0".to_string(),
        ]);
        launcher.launch(&unit(task)).await.unwrap();

        let missing = Task::new("missing").with_command(vec![
            "/nonexistent/hangar-tool".to_string(),
            "--flag".to_string(),
        ]);
        assert!(matches!(
            launcher.launch(&unit(missing)).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_command_is_a_no_op() {
        let root = TempDir::new().unwrap();
        let launcher = ShellLauncher::new(root.path());
        launcher.launch(&unit(Task::new("noop"))).await.unwrap();
        assert!(!root.path().join("noop").exists());
    }

    #[tokio::test]
    async fn test_aborted_launch_kills_the_child() {
        let root = TempDir::new().unwrap();
        let launcher = Arc::new(ShellLauncher::new(root.path()));
        let marker = root.path().join("sleepy").join("finished");
        let task = shell_task("sleepy", "sleep 1 && touch finished");

        let handle = tokio::spawn({
            let launcher = launcher.clone();
            let unit = unit(task);
            async move { launcher.launch(&unit).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
