//! Turns command-line arguments into a ready-to-open transport.

use std::path::PathBuf;
use std::sync::Arc;

use clap::ValueEnum;
use descriptor::ConnectionDescriptor;
use handoff::Secret;
use tracing::debug;
use transport::{ProcessOptions, ProcessTransport, SessionOptions, SessionTransport, Transport};

use crate::error::{CliError, Result};

/// Environment variable holding a password for non-interactive use.
pub const PASSWORD_ENV: &str = "SSHFORGE_PASSWORD";

/// Which transport implementation carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// Spawn the system ssh client.
    Process,
    /// Built-in SSH client.
    Session,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Everything needed to build a transport, minus the password.
#[derive(Debug, Clone)]
pub struct Plan {
    pub descriptor: ConnectionDescriptor,
    pub kind: TransportKind,
    pub skip_host_key_check: bool,
    pub executable: Option<PathBuf>,
    pub askpass: Option<PathBuf>,
}

/// Command-line overrides applied on top of the parsed target.
#[derive(Debug, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub user: Option<String>,
    pub subsystem: Option<String>,
}

/// Parse `target` and apply the overrides that were given.
pub fn resolve_target(target: &str, overrides: Overrides) -> Result<ConnectionDescriptor> {
    let mut descriptor = descriptor::parse(target)?;
    if let Some(port) = overrides.port {
        descriptor = descriptor.with_port(port)?;
    }
    if let Some(user) = overrides.user {
        descriptor = descriptor.with_user(user);
    }
    if let Some(subsystem) = overrides.subsystem {
        descriptor = descriptor.with_subsystem(subsystem)?;
    }
    Ok(descriptor)
}

/// Password from the environment, or an interactive prompt when asked for.
pub async fn password(prompt: bool, descriptor: &ConnectionDescriptor) -> Result<Option<Secret>> {
    if prompt {
        let label = match descriptor.user() {
            Some(user) => format!("Password for {user}@{}", descriptor.host()),
            None => format!("Password for {}", descriptor.host()),
        };
        let password = tokio::task::spawn_blocking(move || {
            dialoguer::Password::new().with_prompt(label).interact()
        })
        .await
        .map_err(|e| CliError::Prompt(e.to_string()))?
        .map_err(|e| CliError::Prompt(e.to_string()))?;
        return Ok(Some(Secret::from(password)));
    }

    Ok(std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(Secret::from))
}

pub fn build(plan: Plan, password: Option<Secret>) -> Result<Arc<dyn Transport>> {
    debug!(kind = %plan.kind, host = %plan.descriptor.host(), "building transport");
    let transport: Arc<dyn Transport> = match plan.kind {
        TransportKind::Process => {
            let mut options = ProcessOptions::new(plan.descriptor)
                .skip_host_key_check(plan.skip_host_key_check);
            if let Some(password) = password {
                options = options.with_password(password);
            }
            if let Some(executable) = plan.executable {
                options = options.with_executable(executable);
            }
            if let Some(askpass) = plan.askpass {
                options = options.with_askpass(askpass);
            }
            Arc::new(ProcessTransport::new(options))
        }
        TransportKind::Session => {
            let mut options = SessionOptions::new(plan.descriptor)
                .skip_host_key_check(plan.skip_host_key_check);
            if let Some(password) = password {
                options = options.with_password(password);
            }
            Arc::new(SessionTransport::new(options)?)
        }
    };
    Ok(transport)
}
