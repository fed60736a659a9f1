//! Launch specification builder
//!
//! Turns a service's command template into a concrete argv, environment and
//! working directory. Nothing is spawned here; every problem surfaces as a
//! [`ConfigError`] before the supervisor touches the process table.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::{render_template, ConfigError, RunMode, ServerDefinition};

/// A fully resolved launch: argv[0] is an absolute executable path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProcessSpec {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: PathBuf,
}

impl ServiceProcessSpec {
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }
}

/// Build the launch spec for `definition` in `mode`
///
/// Env templates (service-level, overridden by command-level) are rendered
/// against `base_env`; the executable, arguments and working directory are
/// rendered against the merged result.
pub fn build_process_spec(
    definition: &ServerDefinition,
    mode: RunMode,
    base_env: &HashMap<String, String>,
) -> Result<ServiceProcessSpec, ConfigError> {
    let command = definition.command_for(mode);
    let allow_missing = mode.tolerates_missing_env();

    let mut templates = definition.env.clone();
    templates.extend(command.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut env = base_env.clone();
    for (key, template) in &templates {
        let value = render_template(template, base_env, allow_missing)?;
        env.insert(key.clone(), value);
    }

    let workdir = expand_path(&render_template(&command.workdir, &env, allow_missing)?);
    let workdir =
        std::fs::canonicalize(&workdir).map_err(|_| ConfigError::WorkdirMissing(workdir))?;

    let exec = render_template(&command.exec, &env, allow_missing)?;
    let args = command
        .args
        .iter()
        .map(|arg| render_template(arg, &env, allow_missing))
        .collect::<Result<Vec<_>, _>>()?;

    let executable = resolve_executable(&exec, &workdir, &env)?;

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(executable.display().to_string());
    argv.extend(args);

    Ok(ServiceProcessSpec { argv, env, workdir })
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).as_ref())
}

fn resolve_executable(
    raw_exec: &str,
    workdir: &Path,
    env: &HashMap<String, String>,
) -> Result<PathBuf, ConfigError> {
    let expanded = expand_path(raw_exec);

    let has_separator = raw_exec.contains(std::path::MAIN_SEPARATOR) || raw_exec.contains('/');
    if expanded.is_absolute() || has_separator {
        // `workdir` is canonical, so the join is absolute
        let candidate = if expanded.is_absolute() {
            expanded
        } else {
            workdir.join(expanded.strip_prefix(".").unwrap_or(&expanded))
        };

        if !candidate.exists() {
            return Err(ConfigError::ExecutableNotFound(candidate));
        }
        if !is_executable(&candidate) {
            return Err(ConfigError::NotExecutable(candidate));
        }
        return Ok(candidate);
    }

    search_path(raw_exec, env.get("PATH").map(String::as_str))
        .ok_or_else(|| ConfigError::NotOnPath(raw_exec.to_string()))
}

/// First executable named `name` in the `PATH`-style `path_var`
fn search_path(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file() && is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
