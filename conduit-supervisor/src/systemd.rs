/*!
SYSTEMD MANAGER - `ServiceManager` over unit files and systemctl

One unit per connection, `<unit_dir>/<prefix>-<conn_id>.service`, running
`<bin_dir>/<module> --conn-id=<id>` with `Restart=always`. The connector
process is not our child: systemd owns it, so it outlives the supervisor.
*/

use async_trait::async_trait;
use conduit_core::config::SupervisorSettings;
use conduit_core::{ManagerError, ServiceManager, UnitSpec};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub struct SystemdManager {
    unit_dir: PathBuf,
    bin_dir: PathBuf,
    prefix: String,
    systemctl: Vec<String>,
    timeout: Duration,
    restart_delay: Duration,
    start_limit_burst: u32,
    start_limit_interval: Duration,
}

impl SystemdManager {
    pub fn from_settings(settings: &SupervisorSettings) -> Result<Self, ManagerError> {
        let systemctl = shell_words::split(&settings.systemctl).map_err(|e| {
            ManagerError::Command {
                command: settings.systemctl.clone(),
                reason: e.to_string(),
            }
        })?;
        if systemctl.is_empty() {
            return Err(ManagerError::Command {
                command: settings.systemctl.clone(),
                reason: "empty command".into(),
            });
        }
        Ok(Self {
            unit_dir: settings.unit_dir.clone(),
            bin_dir: settings.bin_dir.clone(),
            prefix: settings.unit_prefix.clone(),
            systemctl,
            timeout: settings.command_timeout,
            restart_delay: settings.restart_delay,
            start_limit_burst: settings.start_limit_burst,
            start_limit_interval: settings.restart_window,
        })
    }

    pub fn unit_name(&self, id: &str) -> String {
        format!("{}-{}.service", self.prefix, id)
    }

    pub fn unit_path(&self, id: &str) -> PathBuf {
        self.unit_dir.join(self.unit_name(id))
    }

    fn executable(&self, module: &str) -> PathBuf {
        self.bin_dir.join(module)
    }

    pub fn render_unit(&self, spec: &UnitSpec) -> String {
        let mut exec = vec![self.executable(&spec.module).display().to_string()];
        exec.extend(spec.args.iter().cloned());

        format!(
            "[Unit]\n\
             Description=Conduit connector {id} ({module})\n\
             After=network.target\n\
             StartLimitIntervalSec={interval}\n\
             StartLimitBurst={burst}\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec}\n\
             Restart=always\n\
             RestartSec={delay}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            id = spec.id,
            module = spec.module,
            interval = self.start_limit_interval.as_secs(),
            burst = self.start_limit_burst,
            exec = shell_words::join(&exec),
            delay = self.restart_delay.as_secs(),
        )
    }

    async fn systemctl(&self, args: &[&str]) -> Result<Output, ManagerError> {
        let command_line = || format!("{} {}", self.systemctl.join(" "), args.join(" "));
        let mut cmd = Command::new(&self.systemctl[0]);
        cmd.args(&self.systemctl[1..]).args(args).kill_on_drop(true);

        debug!("Running {}", command_line());
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ManagerError::Command {
                command: command_line(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ManagerError::Command {
                command: command_line(),
                reason: format!("timed out after {:?}", self.timeout),
            }),
        }
    }

    /// Runs systemctl and turns a non-zero exit into the stderr text
    async fn systemctl_checked(&self, args: &[&str]) -> Result<(), String> {
        let output = self.systemctl(args).await.map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} ({})", stderr.trim(), output.status))
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn unit_exists(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.unit_path(id))
            .await
            .unwrap_or(false)
    }

    async fn create_unit(&self, spec: &UnitSpec) -> Result<(), ManagerError> {
        let create_err = |reason: String| ManagerError::Create {
            id: spec.id.clone(),
            reason,
        };
        let executable = self.executable(&spec.module);
        if !is_file(&executable).await {
            return Err(create_err(format!(
                "executable {} not found",
                executable.display()
            )));
        }

        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .map_err(|e| create_err(e.to_string()))?;
        let path = self.unit_path(&spec.id);
        tokio::fs::write(&path, self.render_unit(spec))
            .await
            .map_err(|e| create_err(e.to_string()))?;
        info!(conn_id = %spec.id, "Unit written to {}", path.display());
        Ok(())
    }

    async fn start_unit(&self, id: &str) -> Result<(), ManagerError> {
        self.systemctl_checked(&["start", &self.unit_name(id)])
            .await
            .map_err(|reason| ManagerError::Start {
                id: id.to_string(),
                reason,
            })
    }

    async fn stop_unit(&self, id: &str) -> Result<(), ManagerError> {
        self.systemctl_checked(&["stop", &self.unit_name(id)])
            .await
            .map_err(|reason| ManagerError::Stop {
                id: id.to_string(),
                reason,
            })
    }

    async fn remove_unit(&self, id: &str) -> Result<(), ManagerError> {
        match tokio::fs::remove_file(self.unit_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManagerError::Remove {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn reload_manager(&self) -> Result<(), ManagerError> {
        self.systemctl_checked(&["daemon-reload"])
            .await
            .map_err(|reason| ManagerError::Command {
                command: "daemon-reload".into(),
                reason,
            })
    }

    async fn is_active(&self, id: &str) -> bool {
        match self
            .systemctl(&["is-active", "--quiet", &self.unit_name(id)])
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!(conn_id = %id, "is-active: {}", e);
                false
            }
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
