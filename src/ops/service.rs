//! Control of the local consuming service

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::common::{Error, Result};

/// Start/stop/restart capability for the service that runs the binaries
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Stop the service; stopping a stopped service succeeds
    async fn stop(&self, service: &str, timeout: Duration) -> Result<()>;

    async fn start(&self, service: &str, timeout: Duration) -> Result<()>;

    async fn restart(&self, service: &str, timeout: Duration) -> Result<()>;

    async fn is_active(&self, service: &str) -> Result<bool>;
}

/// `systemctl`-backed service manager
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    program: String,
    leading_args: Vec<String>,
}

impl Default for SystemdServiceManager {
    fn default() -> Self {
        Self {
            program: "systemctl".into(),
            leading_args: Vec::new(),
        }
    }
}

impl SystemdServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Talk to the per-user manager (`systemctl --user`)
    pub fn user() -> Self {
        Self {
            leading_args: vec!["--user".into()],
            ..Self::default()
        }
    }

    /// Run `program` with `leading_args` in place of `systemctl`
    pub fn with_command(program: impl Into<String>, leading_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Run one subcommand; a non-zero exit is not an error here
    async fn run(&self, args: &[&str], service: &str, timeout: Duration) -> Result<Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .arg(service)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("{} {} {}", self.program, args.join(" "), service);
        tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| Error::ServiceManagement {
                service: service.to_string(),
                reason: format!(
                    "{} {} timed out after {:?}",
                    self.program,
                    args.join(" "),
                    timeout
                ),
            })?
            .map_err(|e| Error::ServiceManagement {
                service: service.to_string(),
                reason: format!("failed to run {}: {}", self.program, e),
            })
    }

    async fn systemctl(&self, args: &[&str], service: &str, timeout: Duration) -> Result<()> {
        let output = self.run(args, service, timeout).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::ServiceManagement {
                service: service.to_string(),
                reason: format!(
                    "{} {} exited with {}: {}",
                    self.program,
                    args.join(" "),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

#[async_trait]
impl ServiceManager for SystemdServiceManager {
    async fn stop(&self, service: &str, timeout: Duration) -> Result<()> {
        self.systemctl(&["stop"], service, timeout).await?;
        tracing::info!("Stopped {}", service);
        Ok(())
    }

    async fn start(&self, service: &str, timeout: Duration) -> Result<()> {
        self.systemctl(&["start"], service, timeout).await?;
        tracing::info!("Started {}", service);
        Ok(())
    }

    async fn restart(&self, service: &str, timeout: Duration) -> Result<()> {
        self.systemctl(&["restart"], service, timeout).await?;
        tracing::info!("Restarted {}", service);
        Ok(())
    }

    async fn is_active(&self, service: &str) -> Result<bool> {
        // non-zero exit just means "not active"
        let output = self
            .run(&["is-active", "--quiet"], service, Duration::from_secs(10))
            .await?;
        Ok(output.status.success())
    }
}
