//! Shared fixtures

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use workspace_finder::config::{ResolvedService, RunMode, ServersConfig};
use workspace_finder::process::{default_base_env, Supervisor, SupervisorOptions};

/// Temporary directory holding executable shell scripts
pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write an executable `/bin/sh` script
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }
}

/// Supervisor launching each `(name, script)` pair in primary mode
pub fn supervisor_for(
    services: &[(&str, &Path)],
    readiness_timeout: Duration,
    max_restarts: u32,
) -> Supervisor {
    let mut definitions = BTreeMap::new();
    let mut resolved = BTreeMap::new();

    for (name, exec) in services {
        let toml = format!(
            "[services.{}.primary]\nexec = \"{}\"\n",
            name,
            exec.display()
        );
        let config = ServersConfig::from_toml(&toml).expect("valid config");
        definitions.extend(config.services);
        resolved.insert(name.to_string(), primary(name));
    }

    Supervisor::new(
        definitions,
        resolved,
        SupervisorOptions {
            readiness_timeout,
            max_restarts,
            base_env: default_base_env(),
        },
    )
}

pub fn primary(name: &str) -> ResolvedService {
    ResolvedService {
        name: name.to_string(),
        declared_mode: RunMode::Primary,
        selected_mode: RunMode::Primary,
        missing_keys: Vec::new(),
        missing_files: Vec::new(),
        warning: None,
    }
}
