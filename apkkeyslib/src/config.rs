//! Configuration for the dialogue controller and credential producer

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use home::home_dir;
use serde::{Deserialize, Serialize};

use crate::data::OperatorId;
use crate::keytool::ToolPaths;
use crate::{log_error, log_info, Error, Result, APP_HOME_NAME, DEFAULT_WORK_DIR};

/// Name of the configuration file read from the app home folder when none is named explicitly
pub const CONFIG_FILE_NAME: &str = "apkkeys.cfg";

/// Operators permitted to use the bot. There is no built-in default: an empty list is a
/// configuration error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AllowList {
    ids: BTreeSet<OperatorId>,
}

impl AllowList {
    pub fn new(ids: impl IntoIterator<Item = OperatorId>) -> Result<Self> {
        let ids: BTreeSet<OperatorId> = ids.into_iter().collect();
        if ids.is_empty() {
            return Err(Error::Config(
                "at least one operator id must be allowed".to_string(),
            ));
        }
        Ok(AllowList { ids })
    }

    /// Parses a comma-separated list of numeric operator ids, e.g. `"5827445104, 42"`
    pub fn parse(list: &str) -> Result<Self> {
        let mut ids = vec![];
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.parse::<OperatorId>() {
                Ok(id) => ids.push(id),
                Err(e) => {
                    log_error(&format!("Failed to parse operator id {item:?}: {e}"));
                    return Err(Error::Config(format!("invalid operator id {item:?}")));
                }
            }
        }
        Self::new(ids)
    }

    pub fn contains(&self, operator: OperatorId) -> bool {
        self.ids.contains(&operator)
    }
}

/// Settings read from the JSON configuration file. Every key is optional.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ApkKeysConfig {
    /// Directory under which artifacts, uploads and scratch directories are created
    pub work_dir: PathBuf,
    pub keytool: PathBuf,
    pub jarsigner: PathBuf,
    /// Upper bound on a single tool invocation
    pub tool_timeout_secs: u64,
    /// Upper bound on a complete generate or sign job, including any JDK installation
    pub job_timeout_secs: u64,
    /// Upper bound on fetching `jdk_download_url`
    pub download_timeout_secs: u64,
    /// Package manager commands tried, in order, when keytool is missing
    pub install_commands: Vec<Vec<String>>,
    /// JDK archive (tar.gz) downloaded when the package manager commands fail. `None` disables
    /// the download fallback.
    pub jdk_download_url: Option<String>,
    /// Write passwords in cleartext into the helper script and README
    pub embed_secrets: bool,
    /// File extensions accepted for uploaded payloads, without the leading dot
    pub payload_extensions: Vec<String>,
}

impl Default for ApkKeysConfig {
    fn default() -> Self {
        let tools = ToolPaths::default();
        ApkKeysConfig {
            work_dir: DEFAULT_WORK_DIR.clone(),
            keytool: tools.keytool,
            jarsigner: tools.jarsigner,
            tool_timeout_secs: 300,
            job_timeout_secs: 1200,
            download_timeout_secs: 600,
            install_commands: vec![
                vec!["pkg".to_string(), "update".to_string(), "-y".to_string()],
                vec![
                    "pkg".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                    "openjdk-17".to_string(),
                ],
            ],
            jdk_download_url: Some(default_jdk_url()),
            embed_secrets: false,
            payload_extensions: vec!["apk".to_string(), "aab".to_string(), "jar".to_string()],
        }
    }
}

impl ApkKeysConfig {
    pub fn tool_paths(&self) -> ToolPaths {
        ToolPaths {
            keytool: self.keytool.clone(),
            jarsigner: self.jarsigner.clone(),
        }
    }

    /// Work directory as an absolute path; tools run with other working directories
    pub fn absolute_work_dir(&self) -> PathBuf {
        absolute_path(&self.work_dir)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Returns true if `file_name` carries one of the configured payload extensions
    pub fn accepts_payload(&self, file_name: &str) -> bool {
        match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .payload_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    fn check(self) -> Result<Self> {
        if self.tool_timeout_secs == 0
            || self.job_timeout_secs == 0
            || self.download_timeout_secs == 0
        {
            return Err(Error::Config("timeouts must be greater than zero".to_string()));
        }
        // the fallback downloads and then unpacks inside a single job
        let install_secs = self.download_timeout_secs.saturating_add(self.tool_timeout_secs);
        if self.jdk_download_url.is_some() && self.job_timeout_secs <= install_secs {
            return Err(Error::Config(format!(
                "job_timeout_secs ({}) must exceed download_timeout_secs plus tool_timeout_secs ({install_secs})",
                self.job_timeout_secs
            )));
        }
        if self.payload_extensions.is_empty() {
            return Err(Error::Config(
                "at least one payload extension must be allowed".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Anchors a relative path at the current directory
pub fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(e) => {
            log_error(&format!("Failed to read current directory: {e}"));
            path.to_path_buf()
        }
    }
}

/// Returns the Adoptium download URL for the latest JDK 17 matching the host platform
fn default_jdk_url() -> String {
    let os = match std::env::consts::OS {
        "macos" => "mac",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "x32",
        "arm" => "arm",
        other => other,
    };
    format!("https://api.adoptium.net/v3/binary/latest/17/ga/{os}/{arch}/jdk/hotspot/normal/eclipse")
}

/// Returns `<home dir>/.apkkeys/apkkeys.cfg`
pub fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|hd| hd.join(APP_HOME_NAME.as_str()).join(CONFIG_FILE_NAME))
}

/// Reads configuration from `path`. A file named explicitly must exist; when `path` is None the
/// default location is tried and defaults are used if nothing is found there.
pub fn read_config_or_default(path: Option<&Path>) -> Result<ApkKeysConfig> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match default_config_path() {
            Some(p) => (p, false),
            None => return ApkKeysConfig::default().check(),
        },
    };

    match File::open(&path) {
        Ok(f) => {
            let config: ApkKeysConfig = serde_json::from_reader(&f).map_err(|e| {
                log_error(&format!(
                    "Failed to parse configuration {}: {e}",
                    path.display()
                ));
                Error::Config(format!("{}: {e}", path.display()))
            })?;
            log_info(&format!("Using configuration from {}", path.display()));
            config.check()
        }
        Err(e) if required => {
            log_error(&format!("Failed to open {}: {e}", path.display()));
            Err(Error::Config(format!("{}: {e}", path.display())))
        }
        Err(_) => ApkKeysConfig::default().check(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn allow_list_parsing() {
        let list = AllowList::parse("5827445104, 42,,").unwrap();
        assert!(list.contains(5827445104));
        assert!(list.contains(42));
        assert!(!list.contains(7));
        assert!(AllowList::parse("").is_err());
        assert!(AllowList::parse("12,abc").is_err());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"work_dir": "/srv/keys", "embed_secrets": true}}"#).unwrap();
        let config = read_config_or_default(Some(file.path())).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/srv/keys"));
        assert!(config.embed_secrets);
        assert_eq!(config.keytool, PathBuf::from("keytool"));
        assert_eq!(config.tool_timeout_secs, 300);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.cfg");
        assert!(matches!(
            read_config_or_default(Some(&missing)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tool_timeout_secs": 0}}"#).unwrap();
        assert!(read_config_or_default(Some(file.path())).is_err());
    }

    #[test]
    fn job_timeout_covers_jdk_download() {
        let config = ApkKeysConfig::default();
        assert!(config.job_timeout() > config.download_timeout() + config.tool_timeout());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"job_timeout_secs": 600, "download_timeout_secs": 900}}"#).unwrap();
        assert!(matches!(
            read_config_or_default(Some(file.path())),
            Err(Error::Config(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"job_timeout_secs": 600, "download_timeout_secs": 900, "jdk_download_url": null}}"#
        )
        .unwrap();
        let config = read_config_or_default(Some(file.path())).unwrap();
        assert_eq!(config.job_timeout_secs, 600);
    }

    #[test]
    fn payload_extensions() {
        let config = ApkKeysConfig::default();
        assert!(config.accepts_payload("app-release.apk"));
        assert!(config.accepts_payload("APP.APK"));
        assert!(config.accepts_payload("bundle.aab"));
        assert!(!config.accepts_payload("notes.txt"));
        assert!(!config.accepts_payload("apk"));
    }
}
