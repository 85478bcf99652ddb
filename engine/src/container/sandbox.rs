//! Container Sandbox (C1, spec §4.1): provisions an isolated container per agent run,
//! executes the agent's CLI inside it, and tears it down afterward.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use tokio::time::timeout;

use crate::config::{ContainerConfig, NetworkConfig};
use crate::container::network;
use crate::error::ContainerError;

/// A running sandbox: the container id plus the in-container workspace path the git
/// and prompt layers operate against.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub container_id: String,
    pub workspace_path: String,
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Contract the agent-execution workflow (C7) drives; faked in tests with a hand-rolled
/// implementation rather than `mockall`, matching how `GithubOperations` is faked.
#[async_trait]
pub trait AgentSandbox: Send + Sync {
    async fn provision(
        &self,
        agent_run_id: &str,
        firewall_script: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<SandboxHandle, ContainerError>;

    async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &[String],
        timeout_override: Option<Duration>,
    ) -> Result<ExecOutcome, ContainerError>;

    async fn cleanup(&self, handle: &SandboxHandle) -> Result<(), ContainerError>;

    async fn running(&self, handle: &SandboxHandle) -> Result<bool, ContainerError>;
}

/// Container workspace mount point inside every sandbox (spec §4.1).
const IN_CONTAINER_WORKSPACE: &str = "/workspace";
const CLAUDE_HOST_CONFIG_MOUNT: &str = "/home/agent/.claude-host";

/// Docker Engine-backed implementation over `bollard`.
pub struct DockerSandbox {
    docker: Docker,
    config: ContainerConfig,
    network: NetworkConfig,
}

impl DockerSandbox {
    pub fn connect(config: ContainerConfig, network: NetworkConfig) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::Provision(e.to_string()))?;
        Ok(Self {
            docker,
            config,
            network,
        })
    }

    fn host_workspace_path(&self, agent_run_id: &str) -> String {
        join_workspace_path(&self.config.workspace_root, agent_run_id)
    }
}

fn join_workspace_path(workspace_root: &str, agent_run_id: &str) -> String {
    format!("{}/{}", workspace_root.trim_end_matches('/'), agent_run_id)
}

#[async_trait]
impl AgentSandbox for DockerSandbox {
    async fn provision(
        &self,
        agent_run_id: &str,
        firewall_script: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<SandboxHandle, ContainerError> {
        let subscription_mode = self.config.subscription_mode();
        let host_workspace_path = self.host_workspace_path(agent_run_id);
        std::fs::create_dir_all(&host_workspace_path)
            .map_err(|e| ContainerError::Provision(e.to_string()))?;

        let name = format!("paid-agent-{agent_run_id}");
        let env_vec: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut mounts = vec![
            Mount {
                target: Some(IN_CONTAINER_WORKSPACE.to_string()),
                source: Some(host_workspace_path),
                typ: Some(MountTypeEnum::BIND),
                ..Default::default()
            },
            Mount {
                target: Some("/tmp".to_string()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: Some(bollard::models::MountTmpfsOptions {
                    size_bytes: Some(self.config.tmp_tmpfs_bytes),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Mount {
                target: Some("/home/agent/.cache".to_string()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: Some(bollard::models::MountTmpfsOptions {
                    size_bytes: Some(self.config.cache_tmpfs_bytes),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        if subscription_mode {
            if let Some(claude_dir) = &self.config.claude_config_dir {
                mounts.push(Mount {
                    target: Some(CLAUDE_HOST_CONFIG_MOUNT.to_string()),
                    source: Some(claude_dir.clone()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        }

        let network_name = if subscription_mode {
            &self.network.infra_network
        } else {
            &self.network.agent_network
        };
        let subnet = (!subscription_mode).then_some(self.network.agent_subnet.as_str());
        let internal = !subscription_mode && self.network.production;
        network::ensure_network(&self.docker, network_name, subnet, internal).await?;

        let host_config = HostConfig {
            memory: Some(self.config.memory_bytes),
            memory_swap: Some(self.config.memory_bytes),
            cpu_quota: Some(self.config.cpu_quota_us),
            cpu_period: Some(self.config.cpu_period_us),
            pids_limit: Some(self.config.pids_limit),
            network_mode: Some(network_name.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["NET_RAW".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            mounts: Some(mounts),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            env: Some(env_vec),
            user: Some("agent".to_string()),
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            working_dir: Some(IN_CONTAINER_WORKSPACE.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| ContainerError::Provision(e.to_string()))?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ContainerError::Provision(e.to_string()))?;

        let handle = SandboxHandle {
            container_id: created.id,
            workspace_path: IN_CONTAINER_WORKSPACE.to_string(),
        };

        self.chown_workspace(&handle).await?;

        if !subscription_mode {
            if let Some(script) = firewall_script {
                self.apply_firewall(&handle, script).await?;
            }
        }

        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &[String],
        timeout_override: Option<Duration>,
    ) -> Result<ExecOutcome, ContainerError> {
        let exec = self
            .docker
            .create_exec(
                &handle.container_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(handle.workspace_path.clone()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ContainerError::Execution(e.to_string()))?;

        let deadline = timeout_override.unwrap_or(self.config.default_exec_timeout);

        let run = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| ContainerError::Execution(e.to_string()))?
            {
                while let Some(Ok(msg)) = output.next().await {
                    match msg {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| ContainerError::Execution(e.to_string()))?;

            Ok::<_, ContainerError>(ExecOutcome {
                exit_code: inspect.exit_code.unwrap_or(-1),
                stdout,
                stderr,
            })
        };

        timeout(deadline, run)
            .await
            .map_err(|_| ContainerError::Timeout(deadline.as_secs()))?
    }

    async fn cleanup(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        let _ = self
            .docker
            .stop_container(&handle.container_id, Some(StopContainerOptions { t: 10 }))
            .await;

        self.docker
            .remove_container(
                &handle.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| ContainerError::Execution(e.to_string()))?;

        Ok(())
    }

    async fn running(&self, handle: &SandboxHandle) -> Result<bool, ContainerError> {
        let inspect = self
            .docker
            .inspect_container(&handle.container_id, None)
            .await
            .map_err(|e| ContainerError::Execution(e.to_string()))?;
        Ok(inspect
            .state
            .and_then(|s| s.running)
            .unwrap_or(false))
    }
}

impl DockerSandbox {
    /// The workspace bind mount is owned by the host uid that created it; `agent` must
    /// own it before the harness runs as that non-root user, so this one exec runs as
    /// root ahead of everything else.
    async fn chown_workspace(&self, handle: &SandboxHandle) -> Result<(), ContainerError> {
        let exec = self
            .docker
            .create_exec(
                &handle.container_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "chown".to_string(),
                        "-R".to_string(),
                        "agent:agent".to_string(),
                        IN_CONTAINER_WORKSPACE.to_string(),
                    ]),
                    user: Some("root".to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ContainerError::Provision(e.to_string()))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| ContainerError::Provision(e.to_string()))?
        {
            while output.next().await.is_some() {}
        }
        Ok(())
    }

    async fn apply_firewall(&self, handle: &SandboxHandle, script: &str) -> Result<(), ContainerError> {
        let outcome = self
            .execute(
                handle,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cat <<'PAID_FW_EOF' | sh\n{script}\nPAID_FW_EOF"),
                ],
                Some(Duration::from_secs(30)),
            )
            .await?;
        if !outcome.succeeded() {
            return Err(ContainerError::Provision(format!(
                "firewall script failed: {}",
                outcome.stderr
            )));
        }
        Ok(())
    }

    /// Wait for the container's exit via the Docker wait API, used when a command is
    /// launched as the container's entrypoint rather than via exec.
    pub async fn wait_for_exit(&self, handle: &SandboxHandle) -> Result<i64, ContainerError> {
        let mut stream = self.docker.wait_container(
            &handle.container_id,
            None::<WaitContainerOptions<String>>,
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(ContainerError::Execution(e.to_string())),
            None => Err(ContainerError::Execution("wait stream closed unexpectedly".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_path_joins_root_and_run_id() {
        assert_eq!(
            join_workspace_path(
                "/var/paid/workspaces/",
                "11111111-1111-1111-1111-111111111111"
            ),
            "/var/paid/workspaces/11111111-1111-1111-1111-111111111111"
        );
    }

    #[test]
    fn exec_outcome_succeeded_checks_exit_code() {
        let ok = ExecOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let failed = ExecOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        assert!(ok.succeeded());
        assert!(!failed.succeeded());
    }
}
