//! Confirms keytool is reachable and, when it is not, attempts to install a JDK

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ApkKeysConfig;
use crate::keytool::ToolPaths;
use crate::network::download_to_file;
use crate::tool::{ToolAction, ToolInvocation, ToolRunner};
use crate::{log_error, log_info, log_warn, Error, Result};

/// Name of the archive saved by the download fallback
const JDK_ARCHIVE: &str = "jdk.tar.gz";
/// Folder, relative to the tools directory, into which the archive is unpacked
const JDK_DIR: &str = "jdk";
/// How deep below the unpack folder to look for `bin/keytool`
const MAX_SEARCH_DEPTH: usize = 4;

/// Installation procedure tried when the probe fails
#[derive(Clone, Debug)]
pub struct Installer {
    commands: Vec<Vec<String>>,
    jdk_download_url: Option<String>,
    download_timeout: Duration,
    tools_dir: PathBuf,
}

impl Installer {
    pub fn new(
        commands: Vec<Vec<String>>,
        jdk_download_url: Option<String>,
        download_timeout: Duration,
        tools_dir: impl Into<PathBuf>,
    ) -> Self {
        Installer {
            commands,
            jdk_download_url,
            download_timeout,
            tools_dir: tools_dir.into(),
        }
    }

    pub fn from_config(config: &ApkKeysConfig) -> Self {
        Installer::new(
            config.install_commands.clone(),
            config.jdk_download_url.clone(),
            config.download_timeout(),
            config.absolute_work_dir().join(".tools"),
        )
    }

    /// Returns tool paths that answered the probe, installing a JDK first if necessary
    pub async fn ensure<R: ToolRunner>(
        &self,
        runner: &R,
        tools: &ToolPaths,
        cancel: &CancellationToken,
    ) -> Result<ToolPaths> {
        tokio::fs::create_dir_all(&self.tools_dir).await?;

        if probe(runner, tools, &self.tools_dir, cancel).await? {
            return Ok(tools.clone());
        }

        log_warn("keytool not found! Installing Java...");
        if self.run_package_manager(runner, cancel).await?
            && probe(runner, tools, &self.tools_dir, cancel).await?
        {
            log_info("Java installed with the package manager");
            return Ok(tools.clone());
        }

        if let Some(url) = &self.jdk_download_url {
            match self.download_jdk(runner, url, cancel).await {
                Ok(downloaded) => {
                    if probe(runner, &downloaded, &self.tools_dir, cancel).await? {
                        log_info(&format!(
                            "Using keytool from {}",
                            downloaded.keytool.display()
                        ));
                        return Ok(downloaded);
                    }
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => log_error(&format!("JDK download failed: {e}")),
            }
        }

        Err(Error::ToolUnavailable(format!(
            "{} could not be run and installation failed",
            tools.keytool.display()
        )))
    }

    /// Runs each package manager command in turn, stopping at the first failure
    async fn run_package_manager<R: ToolRunner>(
        &self,
        runner: &R,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if self.commands.is_empty() {
            return Ok(false);
        }
        for command in &self.commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            let mut invocation = ToolInvocation::new(ToolAction::Install, program, &self.tools_dir);
            for a in args {
                invocation = invocation.arg(a.as_str());
            }
            match runner.run(&invocation, cancel).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    log_error(&format!(
                        "Failed to install Java: {} exited with {:?}: {}",
                        invocation.redacted(),
                        output.status,
                        output.diagnostic()
                    ));
                    return Ok(false);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    log_error(&format!("Failed to install Java: {e}"));
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn download_jdk<R: ToolRunner>(
        &self,
        runner: &R,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ToolPaths> {
        let archive = self.tools_dir.join(JDK_ARCHIVE);
        let unpack_dir = self.tools_dir.join(JDK_DIR);

        log_info(&format!("Downloading JDK from {url}"));
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = download_to_file(url, &archive, self.download_timeout) => r?,
        }

        tokio::fs::create_dir_all(&unpack_dir).await?;
        let extract = ToolInvocation::new(ToolAction::Install, "tar", &self.tools_dir)
            .arg("-xzf")
            .arg(JDK_ARCHIVE)
            .arg("-C")
            .arg(JDK_DIR);
        let output = runner.run(&extract, cancel).await?;
        if !output.success() {
            return Err(Error::ToolUnavailable(format!(
                "failed to unpack {}: {}",
                archive.display(),
                output.diagnostic()
            )));
        }
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            log_warn(&format!("Failed to remove {}: {e}", archive.display()));
        }

        match find_jdk_bin(&unpack_dir, MAX_SEARCH_DEPTH) {
            Some(bin) => Ok(ToolPaths {
                keytool: bin.join(executable("keytool")),
                jarsigner: bin.join(executable("jarsigner")),
            }),
            None => Err(Error::ToolUnavailable(format!(
                "no keytool found under {}",
                unpack_dir.display()
            ))),
        }
    }
}

/// Runs `keytool -help` and reports whether it exited successfully. A program that cannot be
/// started counts as unavailable.
pub async fn probe<R: ToolRunner>(
    runner: &R,
    tools: &ToolPaths,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<bool> {
    match runner.run(&tools.probe(dir), cancel).await {
        Ok(output) => Ok(output.success()),
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            log_warn(&format!("Probe of {} failed: {e}", tools.keytool.display()));
            Ok(false)
        }
    }
}

fn executable(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}

/// Finds the first `bin` directory holding keytool within `depth` levels of `root`
pub(crate) fn find_jdk_bin(root: &Path, depth: usize) -> Option<PathBuf> {
    let bin = root.join("bin");
    if bin.join(executable("keytool")).is_file() {
        return Some(bin);
    }
    if depth == 0 {
        return None;
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();
    entries
        .iter()
        .find_map(|dir| find_jdk_bin(dir, depth - 1))
}
