//! Network collaborator backed by operator shell commands.

use crate::config::CommandTemplates;
use async_trait::async_trait;
use common::{Error, Result};
use failover::{AdapterBinding, AdapterSnapshot, AssignmentHandle, NetworkProvider};
use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Values substituted into a template
#[derive(Debug, Default, Clone, Copy)]
struct Vars {
    ip: Option<IpAddr>,
    prefix: Option<u8>,
    index: Option<u32>,
    adapter: Option<IpAddr>,
}

fn render(template: &str, vars: Vars) -> String {
    let mut out = template.to_string();
    if let Some(ip) = vars.ip {
        out = out.replace("{ip}", &ip.to_string());
    }
    if let Some(prefix) = vars.prefix {
        out = out.replace("{prefix}", &prefix.to_string());
    }
    if let Some(index) = vars.index {
        out = out.replace("{index}", &index.to_string());
    }
    if let Some(adapter) = vars.adapter {
        out = out.replace("{adapter}", &adapter.to_string());
    }
    out
}

/// Result of one command run
struct Outcome {
    success: bool,
    stdout: String,
}

/// Runs the configured templates through `sh -c`
pub struct CommandNetwork {
    templates: CommandTemplates,
    next_handle: AtomicU64,
    assignments: Mutex<HashMap<AssignmentHandle, IpAddr>>,
}

impl CommandNetwork {
    pub fn new(templates: CommandTemplates) -> Self {
        Self {
            templates,
            next_handle: AtomicU64::new(1),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, template: &str, vars: Vars, limit: Duration) -> Result<Outcome> {
        let command = render(template, vars);
        debug!(command = %command, "Running network command");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(limit, child)
            .await
            .map_err(|_| Error::address(format!("command timed out after {:?}: {}", limit, command)))??;

        if !output.status.success() {
            debug!(
                command = %command,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Network command failed"
            );
        }

        Ok(Outcome {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        })
    }

    async fn run_checked(&self, what: &str, template: &str, vars: Vars) -> Result<()> {
        let outcome = self.run(template, vars, self.templates.timeout).await?;
        if outcome.success {
            Ok(())
        } else {
            Err(Error::address(format!("{} command failed", what)))
        }
    }

    fn forget(&self, ip: IpAddr) {
        if let Ok(mut map) = self.assignments.lock() {
            map.retain(|_, held| *held != ip);
        }
    }
}

#[async_trait]
impl NetworkProvider for CommandNetwork {
    async fn assign(&self, ip: IpAddr, prefix_len: u8, adapter_index: u32) -> Result<AssignmentHandle> {
        let vars = Vars {
            ip: Some(ip),
            prefix: Some(prefix_len),
            index: Some(adapter_index),
            adapter: None,
        };
        self.run_checked("assign", &self.templates.assign, vars).await?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.assignments
            .lock()
            .map_err(|_| Error::other("assignment table poisoned"))?
            .insert(handle, ip);
        Ok(handle)
    }

    async fn clear_handle(&self, handle: AssignmentHandle) -> Result<()> {
        let ip = self
            .assignments
            .lock()
            .map_err(|_| Error::other("assignment table poisoned"))?
            .get(&handle)
            .copied()
            .ok_or_else(|| Error::address(format!("unknown assignment handle {}", handle)))?;
        self.clear_address(ip).await
    }

    async fn clear_address(&self, ip: IpAddr) -> Result<()> {
        let vars = Vars {
            ip: Some(ip),
            ..Vars::default()
        };
        self.run_checked("clear", &self.templates.clear, vars).await?;
        self.forget(ip);
        Ok(())
    }

    async fn adapter_health(&self, bindings: &[AdapterBinding]) -> Result<AdapterSnapshot> {
        let mut snapshot = AdapterSnapshot::default();
        for (position, binding) in bindings.iter().enumerate() {
            let vars = Vars {
                adapter: Some(binding.adapter_ip),
                index: Some(position as u32),
                ..Vars::default()
            };
            let outcome = self
                .run(&self.templates.health, vars, self.templates.timeout)
                .await?;

            if outcome.success {
                snapshot.mask |= binding.adapter_mask;
                let index = outcome.stdout.parse::<u32>().unwrap_or(position as u32);
                snapshot.indices.push(Some(index));
            } else {
                snapshot.indices.push(None);
            }
        }
        Ok(snapshot)
    }

    async fn probe_reachable(&self, ip: IpAddr, timeout: Duration) -> bool {
        let vars = Vars {
            ip: Some(ip),
            ..Vars::default()
        };
        match self.run(&self.templates.probe, vars, timeout).await {
            Ok(outcome) => outcome.success,
            Err(e) => {
                debug!(ip = %ip, error = %e, "Probe did not complete");
                false
            }
        }
    }

    async fn flush_neighbor_cache(&self) -> Result<()> {
        let Some(template) = self.templates.flush.as_deref() else {
            return Ok(());
        };
        if let Err(e) = self.run_checked("flush", template, Vars::default()).await {
            warn!(error = %e, "Neighbor cache flush failed");
            return Err(e);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "command"
    }
}
