//! Running system networking tools (`ip`, `bridge`, `ovs-vsctl`, `ethtool`,
//! `iptables`).

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

/// A system tool that could not be run or reported failure.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The program could not be started.
    #[error("failed to execute {command}: {source}")]
    Spawn {
        /// Command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully.
    #[error("{command} failed ({status}): {stderr}")]
    Failed {
        /// Command line.
        command: String,
        /// Exit status.
        status: std::process::ExitStatus,
        /// Trimmed standard error.
        stderr: String,
    },
}

impl CommandError {
    /// Whether the failure says the object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Failed { stderr, .. } => {
                let stderr = stderr.to_ascii_lowercase();
                stderr.contains("cannot find device")
                    || stderr.contains("does not exist")
                    || stderr.contains("no such device")
            }
            Self::Spawn { .. } => false,
        }
    }

    /// Standard error of a program that ran and failed.
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            Self::Spawn { .. } => None,
        }
    }
}

/// A tool invocation prefix: the program plus any arguments that precede
/// every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    program: String,
    leading: Vec<String>,
}

impl Tool {
    /// Run `program` directly.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading: Vec::new(),
        }
    }

    /// Run `program` with `leading` before the per-call arguments, e.g. an
    /// interpreter and its script.
    #[must_use]
    pub fn with_args<I, S>(program: impl Into<String>, leading: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            leading: leading.into_iter().map(Into::into).collect(),
        }
    }

    /// Run the tool with `args`.
    ///
    /// # Errors
    ///
    /// Same as [`run`].
    pub async fn run(&self, args: &[&str]) -> Result<String, CommandError> {
        if self.leading.is_empty() {
            return run(&self.program, args).await;
        }
        let full: Vec<&str> = self
            .leading
            .iter()
            .map(String::as_str)
            .chain(args.iter().copied())
            .collect();
        run(&self.program, &full).await
    }
}

/// Run `program args...` and return its standard output.
///
/// # Errors
///
/// [`CommandError`] when the program is missing or exits non-zero.
pub async fn run(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let command = format!("{program} {}", args.join(" "));
    tracing::trace!(%command, "Running");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(CommandError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let out = run("sh", &["-c", "echo hello"]).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn failure_carries_stderr() {
        let err = run("sh", &["-c", "echo 'Cannot find device \"br-x\"' >&2; exit 1"])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("br-x"));
    }

    #[tokio::test]
    async fn tool_prepends_leading_args() {
        let tool = Tool::with_args("sh", ["-c", "echo \"$0 $1\""]);
        let out = tool.run(&["link", "show"]).await.unwrap();
        assert_eq!(out.trim(), "link show");

        let err = Tool::new("sh").run(&["-c", "echo oops >&2; exit 3"]).await.unwrap_err();
        assert_eq!(err.stderr(), Some("oops"));
    }

    #[tokio::test]
    async fn missing_program() {
        let err = run("/nonexistent/skiff-tool", &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}

/// Stand-in tools for exercising command sequences without touching the
/// host.
#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;

    use super::Tool;

    /// Scripts that append their command line to a shared log and fail when
    /// the arguments contain a pattern.
    pub(crate) struct FakeTools {
        dir: tempfile::TempDir,
    }

    impl FakeTools {
        pub(crate) fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn calls_path(&self) -> PathBuf {
            self.dir.path().join("calls")
        }

        /// A tool logged as `name`; with `fail = Some((pattern, stderr))`
        /// any call whose arguments contain `pattern` exits 1 printing
        /// `stderr`.
        pub(crate) fn tool(&self, name: &str, fail: Option<(&str, &str)>) -> Tool {
            let script = self.dir.path().join(name);
            let mut body = format!("echo \"{name} $*\" >> {}\n", self.calls_path().display());
            if let Some((pattern, stderr)) = fail {
                body.push_str(&format!(
                    "case \"$*\" in *\"{pattern}\"*) echo '{stderr}' >&2; exit 1 ;; esac\n"
                ));
            }
            body.push_str("echo ok\n");
            std::fs::write(&script, body).unwrap();
            Tool::with_args("sh", [script.display().to_string()])
        }

        /// Every call so far, in order.
        pub(crate) fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.calls_path())
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        pub(crate) fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }
}
