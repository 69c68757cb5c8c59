//! The container runtime seam.
//!
//! The network subsystem never starts VMs itself. It asks the runtime
//! whether a container runs, to launch the agent inside it, and for control
//! streams to ports of its VM.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_common::{ContainerId, SkiffError, SkiffResult};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentService, MemoryInterfaces};
use crate::transport::{ChannelBinder, ChannelStream, ControlChannel, LoopbackHub};

/// A process started inside a container VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Container the process runs in.
    pub container_id: ContainerId,
    /// Guest pid, when the runtime reports one.
    pub pid: Option<u32>,
    /// Command line.
    pub argv: Vec<String>,
}

/// What the network subsystem needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the container's VM is running.
    async fn is_running(&self, container: &ContainerId) -> bool;

    /// Start a detached process inside the container's namespaces.
    async fn exec_in_namespace(&self, container: &ContainerId, argv: &[String]) -> SkiffResult<ProcessHandle>;

    /// Open a stream to `port` inside the container's VM.
    async fn open_control_channel(&self, container: &ContainerId, port: u32) -> io::Result<ChannelStream>;
}

/// [`ControlChannel`] to one container's VM through its runtime.
#[derive(Clone)]
pub struct ContainerChannel {
    runtime: Arc<dyn ContainerRuntime>,
    container: ContainerId,
}

impl ContainerChannel {
    /// Channel to `container`.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, container: ContainerId) -> Self {
        Self { runtime, container }
    }
}

#[async_trait]
impl ControlChannel for ContainerChannel {
    async fn open(&self, port: u32) -> io::Result<ChannelStream> {
        self.runtime.open_control_channel(&self.container, port).await
    }

    fn describe(&self) -> String {
        format!("container {}", self.container.short())
    }
}

/// Parse the agent control port from an agent command line.
#[must_use]
pub fn agent_port(argv: &[String]) -> Option<u32> {
    argv.windows(2)
        .find(|pair| pair[0] == "--port")
        .and_then(|pair| pair[1].parse().ok())
}

/// How long a stopped agent gets to remove its interfaces.
const AGENT_STOP_GRACE: Duration = Duration::from_secs(1);

struct LoopbackAgent {
    interfaces: MemoryInterfaces,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// In-process runtime: "containers" are endpoints of a [`LoopbackHub`] and
/// agents run as tasks with in-memory interfaces.
#[derive(Clone, Default)]
pub struct LoopbackRuntime {
    hub: LoopbackHub,
    running: Arc<Mutex<HashSet<ContainerId>>>,
    agents: Arc<Mutex<HashMap<ContainerId, LoopbackAgent>>>,
}

impl LoopbackRuntime {
    /// Runtime on `hub`.
    #[must_use]
    pub fn new(hub: LoopbackHub) -> Self {
        Self {
            hub,
            ..Self::default()
        }
    }

    /// Mark a container as running.
    pub fn start(&self, container: &ContainerId) {
        self.running.lock().insert(container.clone());
    }

    /// Stop a container. Returns once its agent is gone.
    pub async fn stop(&self, container: &ContainerId) {
        self.running.lock().remove(container);
        let agent = self.agents.lock().remove(container);
        if let Some(agent) = agent {
            agent.cancel.cancel();
            let mut task = agent.task;
            if tokio::time::timeout(AGENT_STOP_GRACE, &mut task).await.is_err() {
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// The in-memory interfaces of a container's agent.
    #[must_use]
    pub fn interfaces(&self, container: &ContainerId) -> Option<MemoryInterfaces> {
        self.agents
            .lock()
            .get(container)
            .map(|agent| agent.interfaces.clone())
    }

    /// Whether an agent was launched in the container.
    #[must_use]
    pub fn has_agent(&self, container: &ContainerId) -> bool {
        self.agents.lock().contains_key(container)
    }
}

#[async_trait]
impl ContainerRuntime for LoopbackRuntime {
    async fn is_running(&self, container: &ContainerId) -> bool {
        self.running.lock().contains(container)
    }

    async fn exec_in_namespace(&self, container: &ContainerId, argv: &[String]) -> SkiffResult<ProcessHandle> {
        if !self.is_running(container).await {
            return Err(SkiffError::AgentOperationFailed {
                container: container.to_string(),
                message: "container is not running".to_string(),
            });
        }
        let port = agent_port(argv).ok_or_else(|| SkiffError::InvalidRequest {
            message: format!("no --port in {argv:?}"),
        })?;

        let binder = self.hub.binder(container.as_str());
        let listener = binder.bind(port).await?;
        let interfaces = MemoryInterfaces::new();
        let agent = AgentService::new(Arc::new(interfaces.clone()), Arc::new(binder));
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let id = container.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = agent.serve(listener, stopped.cancelled_owned()).await {
                tracing::warn!(container = %id, error = %e, "Loopback agent failed");
            }
        });

        let previous = self.agents.lock().insert(
            container.clone(),
            LoopbackAgent {
                interfaces,
                cancel,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(ProcessHandle {
            container_id: container.clone(),
            pid: None,
            argv: argv.to_vec(),
        })
    }

    async fn open_control_channel(&self, container: &ContainerId, port: u32) -> io::Result<ChannelStream> {
        self.hub.channel(container.as_str()).open(port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(port: &str) -> Vec<String> {
        vec!["/sbin/skiff-agent".into(), "--port".into(), port.into()]
    }

    #[test]
    fn agent_port_from_argv() {
        assert_eq!(agent_port(&argv("5555")), Some(5555));
        assert_eq!(agent_port(&argv("x")), None);
        assert_eq!(agent_port(&["--port".to_string()]), None);
    }

    #[tokio::test]
    async fn agents_only_run_in_running_containers() {
        let runtime = LoopbackRuntime::new(LoopbackHub::new());
        let id = ContainerId::new("c1").unwrap();
        assert!(runtime.exec_in_namespace(&id, &argv("5555")).await.is_err());

        runtime.start(&id);
        let handle = runtime.exec_in_namespace(&id, &argv("5555")).await.unwrap();
        assert_eq!(handle.argv, argv("5555"));
        assert!(runtime.has_agent(&id));

        let channel = ContainerChannel::new(Arc::new(runtime.clone()), id.clone());
        assert!(channel.open(5555).await.is_ok());

        runtime.stop(&id).await;
        assert!(!runtime.has_agent(&id));
        assert!(!runtime.is_running(&id).await);
    }
}
