//! Chat transport that reads operator messages from stdin and prints replies to stdout

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use apkkeyslib::config::absolute_path;
use apkkeyslib::data::OperatorId;
use apkkeyslib::dialogue::{Controller, Incoming, Outbound, Upload};
use apkkeyslib::producer::Producer;
use apkkeyslib::session::SessionStore;

use crate::APOLOGY_TEXT;

/// Stands in for a document upload: `/upload <path>`
const UPLOAD_COMMAND: &str = "/upload";

/// Interprets one console line, mapping `/upload <path>` to a document upload
fn parse_line(line: &str) -> Incoming {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix(UPLOAD_COMMAND) {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let path = absolute_path(&PathBuf::from(rest.trim()));
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Incoming::Document(Upload { file_name, path });
        }
    }
    Incoming::from_text(line)
}

fn print_outbound(outbound: &Outbound) {
    println!("{}\n", outbound.text);
}

/// Runs the console dialogue for `operator` until stdin is closed, then waits for running jobs to
/// report before returning.
pub(crate) async fn run_console<S: SessionStore, P: Producer>(
    controller: Arc<Controller<S, P>>,
    operator: OperatorId,
    mut outbox: UnboundedReceiver<Outbound>,
) {
    info!("Console transport started for operator {operator}");
    println!(
        "{} Type /start for help. Use {UPLOAD_COMMAND} <path> to send a file. Press Ctrl+D to quit.\n",
        "apkkeys".bold()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match controller.handle(operator, parse_line(&line)) {
                    Ok(reply) => println!("{}\n", reply.text()),
                    Err(e) => {
                        error!("Failed to process console input: {e}");
                        println!("{APOLOGY_TEXT}\n");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read from stdin: {e}");
                    break;
                }
            },
            Some(outbound) = outbox.recv() => print_outbound(&outbound),
        }
    }

    while controller.active_jobs() > 0 {
        tokio::select! {
            Some(outbound) = outbox.recv() => print_outbound(&outbound),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
    while let Ok(outbound) = outbox.try_recv() {
        print_outbound(&outbound);
    }
}
