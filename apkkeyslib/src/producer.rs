//! Turns completed requests into external tool invocations and the resulting artifacts

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ApkKeysConfig;
use crate::data::{CertificateRequest, OperatorId, SigningRequest};
use crate::install::Installer;
use crate::keytool::{ToolPaths, CERTIFICATE_FILE, KEYSTORE_FILE, PKCS12_FILE};
use crate::templates::{
    render_readme, render_sign_script, TemplateValues, README_FILE, SIGN_SCRIPT_FILE,
};
use crate::tool::{ToolAction, ToolInvocation, ToolOutput, ToolRunner};
use crate::{log_error, log_info, log_warn, Error, Result};

/// Artifact names in the order they are reported to the operator
pub const ARTIFACT_FILES: [&str; 5] = [
    KEYSTORE_FILE,
    PKCS12_FILE,
    CERTIFICATE_FILE,
    SIGN_SCRIPT_FILE,
    README_FILE,
];

fn describe_artifact(name: &str) -> &'static str {
    match name {
        KEYSTORE_FILE => "Main keystore file",
        PKCS12_FILE => "PKCS12 format",
        CERTIFICATE_FILE => "Public certificate",
        SIGN_SCRIPT_FILE => "Signing script",
        README_FILE => "Instructions",
        _ => "",
    }
}

/// Layout of the work directory.
///
/// ```text
/// <root>/<operator>/            published artifacts of the operator's latest keystore
/// <root>/.uploads/<operator>/   payloads received through the chat transport
/// <root>/.staging/<uuid>/       scratch directory of one generate request
/// <root>/.archive/<op>-<uuid>/  artifacts replaced by a later generate request
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Workspace { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn operator_dir(&self, operator: OperatorId) -> PathBuf {
        self.root.join(operator.to_string())
    }

    pub fn keystore_path(&self, operator: OperatorId) -> PathBuf {
        self.operator_dir(operator).join(KEYSTORE_FILE)
    }

    pub fn uploads_dir(&self, operator: OperatorId) -> PathBuf {
        self.root.join(".uploads").join(operator.to_string())
    }

    fn staging_dir(&self, id: &Uuid) -> PathBuf {
        self.root.join(".staging").join(id.to_string())
    }

    fn archive_dir(&self, operator: OperatorId, id: &Uuid) -> PathBuf {
        self.root.join(".archive").join(format!("{operator}-{id}"))
    }

    /// Relative payload references name a file in the operator's uploads directory
    pub fn resolve_payload(&self, operator: OperatorId, payload: &Path) -> PathBuf {
        if payload.is_absolute() {
            payload.to_path_buf()
        } else {
            self.uploads_dir(operator).join(payload)
        }
    }
}

/// Successful outcome of a job
#[derive(Clone, Debug, Default)]
pub struct Produced {
    /// Messages for the operator, in delivery order
    pub messages: Vec<String>,
    pub artifacts: Vec<PathBuf>,
    /// Best-effort steps that did not succeed
    pub warnings: Vec<String>,
}

/// The two operations behind the dialogue flows
pub trait Producer: Send + Sync + 'static {
    fn generate(
        &self,
        operator: OperatorId,
        request: CertificateRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Produced>> + Send;

    fn sign(
        &self,
        operator: OperatorId,
        request: SigningRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Produced>> + Send;
}

/// [Producer] that drives keytool and jarsigner through a [ToolRunner]
pub struct CredentialProducer<R: ToolRunner> {
    runner: R,
    workspace: Workspace,
    installer: Installer,
    configured_tools: ToolPaths,
    /// Tools that passed the availability probe; None until the first request
    verified_tools: Mutex<Option<ToolPaths>>,
    embed_secrets: bool,
}

impl<R: ToolRunner> CredentialProducer<R> {
    pub fn new(runner: R, config: &ApkKeysConfig) -> Self {
        CredentialProducer {
            runner,
            workspace: Workspace::new(config.absolute_work_dir()),
            installer: Installer::from_config(config),
            configured_tools: config.tool_paths(),
            verified_tools: Mutex::new(None),
            embed_secrets: config.embed_secrets,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Returns working tool paths, probing and installing on first use
    async fn available_tools(&self, cancel: &CancellationToken) -> Result<ToolPaths> {
        let mut verified = self.verified_tools.lock().await;
        if let Some(tools) = verified.as_ref() {
            return Ok(tools.clone());
        }
        let tools = self
            .installer
            .ensure(&self.runner, &self.configured_tools, cancel)
            .await?;
        *verified = Some(tools.clone());
        Ok(tools)
    }

    async fn run_logged(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        log_info(&format!("Running {}", invocation.redacted()));
        let output = self.runner.run(invocation, cancel).await?;
        if !output.success() {
            log_warn(&format!(
                "{} exited with {:?}: {}",
                invocation.action,
                output.status,
                output.diagnostic()
            ));
        }
        Ok(output)
    }

    /// Runs a step whose failure is reported but does not abort the request
    async fn run_best_effort(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        match self.run_logged(invocation, cancel).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => {
                warnings.push(format!("{} failed: {}", invocation.action, output.diagnostic()));
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                warnings.push(format!("{} failed: {e}", invocation.action));
                Ok(())
            }
        }
    }

    /// Runs the keytool sequence and writes the text artifacts into `dir`
    async fn generate_in(
        &self,
        tools: &ToolPaths,
        dir: &Path,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let genkey = tools.generate_keypair(dir, request);
        let output = self.run_logged(&genkey, cancel).await?;
        if !output.success() {
            return Err(Error::ExternalTool {
                action: ToolAction::GenerateKeyPair,
                diagnostic: output.diagnostic(),
            });
        }

        let mut warnings = vec![];
        self.run_best_effort(&tools.export_certificate(dir, request), cancel, &mut warnings)
            .await?;
        self.run_best_effort(&tools.convert_to_pkcs12(dir, request), cancel, &mut warnings)
            .await?;

        let values = TemplateValues {
            alias: &request.alias,
            store_password: &request.store_password,
            key_password: &request.key_password,
            validity_years: request.validity_years,
            generated_on: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            embed_secrets: self.embed_secrets,
        };
        let script = dir.join(SIGN_SCRIPT_FILE);
        tokio::fs::write(&script, render_sign_script(&values)).await?;
        make_executable(&script).await?;
        tokio::fs::write(dir.join(README_FILE), render_readme(&values)).await?;

        Ok(warnings)
    }

    /// Moves the staging directory into place as the operator's artifact directory
    async fn publish(&self, operator: OperatorId, staging: &Path, id: &Uuid) -> Result<PathBuf> {
        let target = self.workspace.operator_dir(operator);
        if exists(&target).await {
            let archive = self.workspace.archive_dir(operator, id);
            if let Some(parent) = archive.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&target, &archive).await?;
            log_info(&format!(
                "Archived previous artifacts of operator {operator} to {}",
                archive.display()
            ));
        }
        tokio::fs::rename(staging, &target).await?;
        Ok(target)
    }

    async fn generate_request(
        &self,
        operator: OperatorId,
        request: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> Result<Produced> {
        let tools = self.available_tools(cancel).await?;

        let id = Uuid::new_v4();
        let staging = self.workspace.staging_dir(&id);
        tokio::fs::create_dir_all(&staging).await?;

        let outcome = match self.generate_in(&tools, &staging, request, cancel).await {
            Ok(warnings) => self
                .publish(operator, &staging, &id)
                .await
                .map(|dir| (dir, warnings)),
            Err(e) => Err(e),
        };

        let (dir, warnings) = match outcome {
            Ok(v) => v,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_dir_all(&staging).await {
                    log_warn(&format!("Failed to remove {}: {rm}", staging.display()));
                }
                return Err(e);
            }
        };

        let mut artifacts = vec![];
        for name in ARTIFACT_FILES {
            let path = dir.join(name);
            if exists(&path).await {
                artifacts.push(path);
            }
        }

        let mut messages = vec![
            format!(
                "✅ *Certificate Generated Successfully!*\n\n\
                 📁 Files created in: `{}`\n\
                 🔑 Alias: `{}`\n\
                 🏢 Organization: `{}`\n\
                 ⏰ Validity: `{} years`\n\n\
                 *Important:* Keep your keystore file safe!",
                dir.display(),
                request.alias,
                request.organization,
                request.validity_years
            ),
            std::iter::once("📦 *Generated Files:*".to_string())
                .chain(artifacts.iter().filter_map(|path| {
                    let name = path.file_name()?.to_str()?;
                    Some(format!("• `{name}` - {}", describe_artifact(name)))
                }))
                .collect::<Vec<_>>()
                .join("\n"),
        ];
        if !warnings.is_empty() {
            messages.push(format!("⚠️ *Warnings:*\n{}", warnings.join("\n")));
        }

        Ok(Produced {
            messages,
            artifacts,
            warnings,
        })
    }

    async fn sign_request(
        &self,
        operator: OperatorId,
        request: &SigningRequest,
        cancel: &CancellationToken,
    ) -> Result<Produced> {
        let payload = self.workspace.resolve_payload(operator, &request.payload);
        if !is_file(&payload).await {
            log_error(&format!("Payload {} not found", payload.display()));
            return Err(Error::NotFound(payload));
        }
        let keystore = self.workspace.keystore_path(operator);
        if !is_file(&keystore).await {
            log_error(&format!("Keystore {} not found", keystore.display()));
            return Err(Error::NotFound(keystore));
        }

        let tools = self.available_tools(cancel).await?;
        let dir = self.workspace.operator_dir(operator);

        let output = self
            .run_logged(&tools.sign_payload(&dir, &keystore, &payload, request), cancel)
            .await?;
        if !output.success() {
            return Err(Error::ExternalTool {
                action: ToolAction::SignPayload,
                diagnostic: output.diagnostic(),
            });
        }

        let mut messages = vec![format!(
            "✅ *APK signed successfully!*\n📁 Signed APK: `{}`",
            payload.display()
        )];
        let mut warnings = vec![];
        match self
            .run_logged(&tools.verify_signature(&dir, &payload), cancel)
            .await
        {
            Ok(verify) => {
                messages.push(format!("🔍 *Verifying signature...*\n```\n{}\n```", verify.stdout.trim()));
                if !verify.success() {
                    warnings.push(format!(
                        "{} failed: {}",
                        ToolAction::VerifySignature,
                        verify.diagnostic()
                    ));
                }
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warnings.push(format!("{} failed: {e}", ToolAction::VerifySignature)),
        }
        if !warnings.is_empty() {
            messages.push(format!("⚠️ *Warnings:*\n{}", warnings.join("\n")));
        }

        Ok(Produced {
            messages,
            artifacts: vec![payload],
            warnings,
        })
    }
}

impl<R: ToolRunner> Producer for CredentialProducer<R> {
    async fn generate(
        &self,
        operator: OperatorId,
        request: CertificateRequest,
        cancel: CancellationToken,
    ) -> Result<Produced> {
        log_info(&format!(
            "Generating keystore for operator {operator}: {request:?}"
        ));
        self.generate_request(operator, &request, &cancel).await
    }

    async fn sign(
        &self,
        operator: OperatorId,
        request: SigningRequest,
        cancel: CancellationToken,
    ) -> Result<Produced> {
        log_info(&format!("Signing for operator {operator}: {request:?}"));
        self.sign_request(operator, &request, &cancel).await
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
