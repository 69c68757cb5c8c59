//! [`ContainerRuntime`] backed by launcher commands and hybrid vsock.

use std::io;

use async_trait::async_trait;
use skiff_common::{ContainerId, SkiffError, SkiffPaths, SkiffResult};
use skiff_network::command;
use skiff_network::runtime::{ContainerRuntime, ProcessHandle};
use skiff_network::transport::{ChannelStream, ControlChannel, HybridVsockChannel};

use crate::config::{CONTAINER_PLACEHOLDER, LauncherConfig};

/// Reaches container VMs through the VM manager's command line and their
/// hybrid vsock sockets.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    paths: SkiffPaths,
    launcher: LauncherConfig,
}

impl CommandRuntime {
    /// Runtime for VMs under `paths`.
    #[must_use]
    pub const fn new(paths: SkiffPaths, launcher: LauncherConfig) -> Self {
        Self { paths, launcher }
    }

    fn vsock(&self, container: &ContainerId) -> HybridVsockChannel {
        HybridVsockChannel::new(self.paths.container_vsock(container.as_str()))
    }
}

/// Substitute the container id into a command template.
#[must_use]
pub fn expand(template: &[String], container: &ContainerId) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(CONTAINER_PLACEHOLDER, container.as_str()))
        .collect()
}

async fn run(argv: &[String]) -> Result<String, command::CommandError> {
    let args: Vec<&str> = argv.iter().skip(1).map(String::as_str).collect();
    let program = argv.first().map_or("", String::as_str);
    command::run(program, &args).await
}

#[async_trait]
impl ContainerRuntime for CommandRuntime {
    async fn is_running(&self, container: &ContainerId) -> bool {
        if self.launcher.status.is_empty() {
            return self.paths.container_vsock(container.as_str()).exists();
        }
        match run(&expand(&self.launcher.status, container)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(container = %container.short(), error = %e, "Container is not running");
                false
            }
        }
    }

    async fn exec_in_namespace(&self, container: &ContainerId, argv: &[String]) -> SkiffResult<ProcessHandle> {
        let mut command = expand(&self.launcher.exec, container);
        command.extend_from_slice(argv);
        let output = run(&command)
            .await
            .map_err(|e| SkiffError::AgentOperationFailed {
                container: container.to_string(),
                message: e.to_string(),
            })?;
        let pid = output.lines().next().and_then(|line| line.trim().parse().ok());
        Ok(ProcessHandle {
            container_id: container.clone(),
            pid,
            argv: argv.to_vec(),
        })
    }

    async fn open_control_channel(&self, container: &ContainerId, port: u32) -> io::Result<ChannelStream> {
        self.vsock(container).open(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(root: &std::path::Path, exec: &[&str], status: &[&str]) -> CommandRuntime {
        CommandRuntime::new(
            SkiffPaths::with_root(root),
            LauncherConfig {
                exec: exec.iter().map(ToString::to_string).collect(),
                status: status.iter().map(ToString::to_string).collect(),
            },
        )
    }

    #[test]
    fn expands_the_container_placeholder() {
        let id = ContainerId::new("abc").unwrap();
        let template = vec!["vmctl".to_string(), "--vm={container}".to_string()];
        assert_eq!(expand(&template, &id), vec!["vmctl", "--vm=abc"]);
    }

    #[tokio::test]
    async fn running_means_the_vsock_socket_exists() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), &["true"], &[]);
        let id = ContainerId::new("c1").unwrap();
        assert!(!runtime.is_running(&id).await);

        let socket = SkiffPaths::with_root(dir.path()).container_vsock("c1");
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        std::fs::write(&socket, b"").unwrap();
        assert!(runtime.is_running(&id).await);
    }

    #[tokio::test]
    async fn status_command_decides_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let id = ContainerId::new("c1").unwrap();
        assert!(runtime(dir.path(), &["true"], &["true"]).is_running(&id).await);
        assert!(!runtime(dir.path(), &["true"], &["false"]).is_running(&id).await);
    }

    #[tokio::test]
    async fn exec_records_the_printed_pid() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), &["sh", "-c", "echo 4242", "{container}"], &[]);
        let id = ContainerId::new("c1").unwrap();
        let argv = vec!["/sbin/skiff-agent".to_string(), "--port".to_string(), "5555".to_string()];
        let handle = runtime.exec_in_namespace(&id, &argv).await.unwrap();
        assert_eq!(handle.pid, Some(4242));
        assert_eq!(handle.argv, argv);
    }

    #[tokio::test]
    async fn exec_failure_is_an_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), &["false"], &[]);
        let id = ContainerId::new("c1").unwrap();
        let err = runtime.exec_in_namespace(&id, &[]).await.unwrap_err();
        assert!(matches!(err, SkiffError::AgentOperationFailed { .. }));
    }

    #[tokio::test]
    async fn control_channel_needs_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = runtime(dir.path(), &["true"], &[]);
        let id = ContainerId::new("c1").unwrap();
        assert!(runtime.open_control_channel(&id, 5555).await.is_err());
    }
}
