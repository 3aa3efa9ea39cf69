#![doc = include_str!("../README.md")]

pub mod config;
pub mod data;
pub mod dialogue;
pub mod install;
pub mod keytool;
pub mod producer;
pub mod session;
pub mod templates;
pub mod tool;

mod network;

use std::fmt;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};

use crate::tool::ToolAction;

/// Result type for apkkeyslib
pub type Result<T> = core::result::Result<T, Error>;

/// Error values for apkkeyslib
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Sender is not on the allow-list
    Unauthorized,
    /// keytool/jarsigner could not be found and could not be installed
    ToolUnavailable(String),
    /// A load-bearing tool invocation exited with a non-zero status. `diagnostic` carries the
    /// captured error stream.
    ExternalTool {
        action: ToolAction,
        diagnostic: String,
    },
    /// A file required before signing is absent
    NotFound(PathBuf),
    Timeout,
    Cancelled,
    BadInput(String),
    Config(String),
    Io(String),
    Network(String),
    SerdeJson,
    SessionStore,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Unauthorized => write!(f, "sender is not authorized"),
            Error::ToolUnavailable(detail) => write!(f, "signing tool unavailable: {detail}"),
            Error::ExternalTool { action, diagnostic } => {
                write!(f, "{action} failed: {diagnostic}")
            }
            Error::NotFound(path) => write!(f, "file not found: {}", path.display()),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::BadInput(detail) => write!(f, "bad input: {detail}"),
            Error::Config(detail) => write!(f, "configuration error: {detail}"),
            Error::Io(detail) => write!(f, "I/O error: {detail}"),
            Error::Network(detail) => write!(f, "network error: {detail}"),
            Error::SerdeJson => write!(f, "failed to process JSON"),
            Error::SessionStore => write!(f, "session store unavailable"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Returns the text shown to an operator when a job ends with this error.
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthorized => crate::dialogue::UNAUTHORIZED_TEXT.to_string(),
            Error::ToolUnavailable(_) => {
                "❌ Failed to install Java. Please install manually.".to_string()
            }
            Error::ExternalTool { action, diagnostic } => match action {
                ToolAction::GenerateKeyPair => {
                    format!("❌ *Error generating certificate:*\n`Failed to create JKS: {diagnostic}`")
                }
                ToolAction::SignPayload => {
                    format!("❌ *APK signing failed:*\n`{diagnostic}`")
                }
                _ => format!("❌ *{action} failed:*\n`{diagnostic}`"),
            },
            Error::NotFound(path) => format!("❌ File not found: `{}`", path.display()),
            Error::Timeout => "❌ The operation took too long and was stopped.".to_string(),
            Error::Cancelled => "❌ Operation cancelled.".to_string(),
            other => format!("❌ *Error:*\n`{other}`"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Error {
        error!("reqwest::Error: {err}");
        Error::Network(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        error!("serde_json::Error: {err}");
        Error::SerdeJson
    }
}

/// Enum that describes level associated with a log message
#[derive(Debug, Eq, PartialEq)]
enum ApkKeysLogLevels {
    Error,
    Info,
    Warn,
    Debug,
}

/// Generates logging output per the configuration established by the calling application
fn log_message(level: &ApkKeysLogLevels, message: &str) {
    match level {
        ApkKeysLogLevels::Error => error!("{}", message),
        ApkKeysLogLevels::Warn => warn!("{}", message),
        ApkKeysLogLevels::Info => info!("{}", message),
        ApkKeysLogLevels::Debug => debug!("{}", message),
    }
}

/// Generates error level logging output per calling application configured logging
pub fn log_error(message: &str) {
    log_message(&ApkKeysLogLevels::Error, message)
}

/// Generates warn level logging output per calling application configured logging
pub fn log_warn(message: &str) {
    log_message(&ApkKeysLogLevels::Warn, message)
}

/// Generates info level logging output per calling application configured logging
pub fn log_info(message: &str) {
    log_message(&ApkKeysLogLevels::Info, message)
}

/// Generates debug level logging output per calling application configured logging
pub fn log_debug(message: &str) {
    log_message(&ApkKeysLogLevels::Debug, message)
}

lazy_static! {
    /// Name of the directory that receives generated artifacts when no other is configured
    pub static ref DEFAULT_WORK_DIR: PathBuf = PathBuf::from("APK_Signing_Keys");

    /// Name of the folder in the user's home directory that holds the configuration file
    pub static ref APP_HOME_NAME: String = ".apkkeys".to_string();
}
