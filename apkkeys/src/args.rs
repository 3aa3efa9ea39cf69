//! Command line arguments for the apkkeys bot

use std::path::PathBuf;

use clap::Parser;

/// Chat bot that generates Android signing keystores and signs APKs with keytool and jarsigner
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct ApkKeysArgs {
    /// Comma-separated list of the numeric chat user ids allowed to use the bot
    #[arg(long, env = "APKKEYS_ADMIN_IDS", help_heading = "Access")]
    pub admin_ids: String,

    /// Telegram bot token. Required unless --console is given.
    #[arg(long, env = "APKKEYS_BOT_TOKEN", hide_env_values = true, help_heading = "Access")]
    pub token: Option<String>,

    /// JSON configuration file. Defaults to ~/.apkkeys/apkkeys.cfg when that file exists.
    #[arg(short, long, help_heading = "Configuration")]
    pub config: Option<PathBuf>,

    /// Talk to the bot over stdin/stdout instead of Telegram
    #[arg(long, action, help_heading = "Transport")]
    pub console: bool,

    /// Operator id used for messages typed at the console
    #[arg(long, requires = "console", help_heading = "Transport")]
    pub operator: Option<i64>,

    /// Full path and filename of YAML-formatted configuration file for log4rs logging mechanism.
    /// See https://docs.rs/log4rs/latest/log4rs/ for details.
    #[arg(short, long, conflicts_with = "log_to_console", help_heading = "Logging")]
    pub logging_config: Option<String>,

    /// Log to stderr at Info level, with reqwest and hyper limited to Warn
    #[arg(long, action, help_heading = "Logging")]
    pub log_to_console: bool,
}
