//! Git client: clones one reference of a repository into a directory.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use kpm_core::{GitRef, GitSource};

use crate::error::{RegistryError, Result};

#[cfg_attr(test, mockall::automock)]
pub trait GitClient {
    /// Clone `git` at its single reference into `dest`, which must not exist
    /// or be empty.
    fn clone_repo(&self, git: &GitSource, dest: &Path) -> Result<()>;
}

/// Runs the `git` executable.
#[derive(Debug, Clone)]
pub struct CommandGitClient {
    program: String,
}

impl Default for CommandGitClient {
    fn default() -> Self {
        CommandGitClient {
            program: "git".to_string(),
        }
    }
}

impl CommandGitClient {
    pub fn with_program(program: impl Into<String>) -> Self {
        CommandGitClient {
            program: program.into(),
        }
    }

    /// Whether the executable can be run at all.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run(&self, url: &str, args: &[&str], cwd: Option<&Path>) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        debug!(program = %self.program, ?args, "running git");
        let output = cmd.output().map_err(|e| RegistryError::Git {
            url: url.to_string(),
            detail: format!("cannot run {}: {e}", self.program),
        })?;
        if !output.status.success() {
            return Err(RegistryError::Git {
                url: url.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl GitClient for CommandGitClient {
    fn clone_repo(&self, git: &GitSource, dest: &Path) -> Result<()> {
        let reference = git.reference()?;
        let dest_str = dest.to_string_lossy();
        let (url, dest_str) = (git.url.as_str(), dest_str.as_ref());
        match &reference {
            GitRef::Branch(name) | GitRef::Tag(name) => {
                self.run(
                    url,
                    &["clone", "--depth", "1", "--branch", name.as_str(), url, dest_str],
                    None,
                )?;
            }
            GitRef::Commit(commit) => {
                self.run(url, &["clone", url, dest_str], None)?;
                self.run(
                    url,
                    &["-c", "advice.detachedHead=false", "checkout", commit.as_str()],
                    Some(dest),
                )?;
            }
        }
        info!(url = %git.url, reference = reference.as_str(), "cloned");
        Ok(())
    }
}
