//! Utility functions used by the apkkeys bot

use colored::Colorize;
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{runtime::ConfigErrors, Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

use crate::args::ApkKeysArgs;

/// Crates whose per-request chatter would drown out the bot's own Info messages
const QUIET_CRATES: [&str; 2] = ["reqwest", "hyper"];

/// Logging used by `--log-to-console`. Logs go to stderr, leaving stdout to the console transport.
fn console_config() -> Result<Config, ConfigErrors> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {l} {t} - {m}{n}",
        )))
        .build();
    QUIET_CRATES
        .iter()
        .fold(
            Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr))),
            |builder, name| builder.logger(Logger::builder().build(*name, LevelFilter::Warn)),
        )
        .build(Root::builder().appender("stderr").build(LevelFilter::Info))
}

/// Configures logging from `--logging-config` (a log4rs YAML file such as `assets/log.yaml`) or
/// `--log-to-console`. Without either option the bot runs without logging. A logging failure is
/// reported and the bot carries on.
pub(crate) fn configure_logging(args: &ApkKeysArgs) {
    if let Some(logging_config) = &args.logging_config {
        match log4rs::init_file(logging_config, Default::default()) {
            Ok(()) => return,
            Err(e) => println!(
                "{}: failed to configure logging using {logging_config} with {e:?}. Continuing without logging.",
                "ERROR".bold()
            ),
        }
    }

    if args.log_to_console {
        match console_config() {
            Ok(config) => {
                if let Err(e) = log4rs::init_config(config) {
                    println!(
                        "{}: failed to configure logging for stderr with {e:?}. Continuing without logging.",
                        "ERROR".bold()
                    );
                }
            }
            Err(e) => println!(
                "{}: failed to prepare console logging configuration with {e:?}. Continuing without logging",
                "ERROR".bold()
            ),
        }
    }
}

/// Splits `text` into pieces of at most `max_chars` characters, preferring to break after a
/// newline.
pub(crate) fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = vec![];
    let mut rest = text;
    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = match rest[..limit].rfind('\n') {
            Some(nl) if nl > 0 => nl + 1,
            _ => limit,
        };
        pieces.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}
