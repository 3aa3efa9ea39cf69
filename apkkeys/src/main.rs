#![doc = include_str!("../README.md")]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use log::{error, info};
use tokio::sync::mpsc::unbounded_channel;
use zeroize::Zeroizing;

use apkkeyslib::{
    config::{read_config_or_default, AllowList},
    dialogue::Controller,
    producer::CredentialProducer,
    session::MemorySessionStore,
    tool::ProcessRunner,
};

mod args;
mod console;
mod telegram;
mod utils;

use args::ApkKeysArgs;
use console::run_console;
use telegram::{run_telegram, TelegramBot};
use utils::configure_logging;

/// Sent when processing a message fails for a reason the dialogue did not anticipate
pub(crate) const APOLOGY_TEXT: &str = "❌ An error occurred. Please try again.";

/// Confirms the provided arguments are sufficient for the selected transport
fn sanity_check(args: &ApkKeysArgs) -> bool {
    let problem = if args.console && args.operator.is_none() {
        Some("--operator must be provided with --console")
    } else if !args.console && args.token.as_deref().unwrap_or_default().is_empty() {
        Some("--token (or APKKEYS_BOT_TOKEN) must be provided unless --console is used")
    } else {
        None
    };

    match problem {
        Some(problem) => {
            println!("{}: {problem}\n", "ERROR".bold());
            let _ = ApkKeysArgs::command().print_help();
            false
        }
        None => true,
    }
}

/// Point of entry for `apkkeys` application.
///
/// See [ApkKeysArgs] for usage details.
#[tokio::main]
async fn main() {
    let mut args = ApkKeysArgs::parse();
    configure_logging(&args);

    let app = format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    if !sanity_check(&args) {
        return;
    }
    let token = Zeroizing::new(args.token.take().unwrap_or_default());

    let allow = match AllowList::parse(&args.admin_ids) {
        Ok(allow) => allow,
        Err(e) => {
            println!("{}: --admin-ids could not be used: {e}", "ERROR".bold());
            return;
        }
    };

    let config = match read_config_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            println!("{}: {e}", "ERROR".bold());
            return;
        }
    };

    let producer = Arc::new(CredentialProducer::new(
        ProcessRunner::new(config.tool_timeout()),
        &config,
    ));
    let workspace = producer.workspace().clone();
    let (outbox_tx, outbox_rx) = unbounded_channel();
    let controller = Arc::new(Controller::new(
        allow,
        MemorySessionStore::new(),
        producer,
        &config,
        outbox_tx,
    ));
    info!(
        "{app} starting with artifacts under {}",
        workspace.root().display()
    );

    let transport = async {
        match args.operator {
            Some(operator) if args.console => {
                run_console(Arc::clone(&controller), operator, outbox_rx).await
            }
            _ => match TelegramBot::new(token) {
                Ok(bot) => {
                    println!("{app} is running. Press Ctrl+C to stop.");
                    run_telegram(Arc::new(bot), Arc::clone(&controller), workspace, outbox_rx)
                        .await
                }
                Err(e) => {
                    error!("Failed to prepare Telegram client: {e}");
                    println!("{}: failed to prepare Telegram client: {e}", "ERROR".bold());
                }
            },
        }
    };

    tokio::select! {
        _ = transport => {}
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("Failed to listen for Ctrl+C: {e}");
            }
            info!("Stopping {app}");
        }
    }
    controller.cancel_all();
}
