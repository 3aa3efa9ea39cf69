//! Chat transport backed by the Telegram Bot API
//!
//! Updates are fetched with `getUpdates` long polling and processed one at a time. Replies and job
//! outcomes are sent with `sendMessage`. Documents are fetched with `getFile` only when the
//! controller is waiting for a payload from the sender.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use zeroize::Zeroizing;

use apkkeyslib::data::OperatorId;
use apkkeyslib::dialogue::{Controller, Incoming, Outbound, Reply, Upload};
use apkkeyslib::producer::{Producer, Workspace};
use apkkeyslib::session::SessionStore;
use apkkeyslib::{Error, Result};

use crate::utils::split_message;
use crate::APOLOGY_TEXT;

const API_BASE: &str = "https://api.telegram.org";
/// Seconds a `getUpdates` call may wait for new updates
const POLL_TIMEOUT_SECS: u64 = 30;
/// Telegram rejects messages over 4096 characters
const MAX_MESSAGE_CHARS: usize = 4000;
/// Pause after a failed poll
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
    document: Option<Document>,
}

#[derive(Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Deserialize)]
struct User {
    id: i64,
}

#[derive(Deserialize)]
struct Document {
    file_id: String,
    file_name: Option<String>,
}

#[derive(Deserialize)]
struct File {
    file_path: Option<String>,
}

/// Maps reqwest errors without the request URL, which carries the bot token
fn network_error(e: reqwest::Error) -> Error {
    let e = e.without_url();
    error!("Telegram request failed: {e}");
    Error::Network(e.to_string())
}

/// Keeps only the final component of an uploaded file's name
fn sanitize_file_name(name: &str) -> Option<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.starts_with('.'))
}

pub(crate) struct TelegramBot {
    client: Client,
    token: Zeroizing<String>,
    /// Chat in which each operator last wrote, used to deliver job outcomes
    chats: Mutex<HashMap<OperatorId, i64>>,
}

impl TelegramBot {
    pub(crate) fn new(token: Zeroizing<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .use_rustls_tls()
            .build()
            .map_err(network_error)?;
        Ok(TelegramBot {
            client,
            token,
            chats: Mutex::new(HashMap::new()),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token.as_str())
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        let parsed: ApiResponse<T> = response.json().await.map_err(network_error)?;
        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            _ => {
                let description = parsed
                    .description
                    .unwrap_or_else(|| "no description".to_string());
                warn!("Telegram {method} failed: {description}");
                Err(Error::Network(format!("{method}: {description}")))
            }
        }
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// Sends `text` as Markdown, falling back to plain text when Telegram cannot parse it
    pub(crate) async fn send(&self, chat: i64, text: &str) -> Result<()> {
        for piece in split_message(text, MAX_MESSAGE_CHARS) {
            let markdown = self
                .call::<serde_json::Value>(
                    "sendMessage",
                    json!({"chat_id": chat, "text": piece, "parse_mode": "Markdown"}),
                )
                .await;
            if let Err(e) = markdown {
                debug!("Retrying message to chat {chat} without formatting after: {e}");
                self.call::<serde_json::Value>(
                    "sendMessage",
                    json!({"chat_id": chat, "text": piece}),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Downloads a document into `dir` and returns its local path
    async fn download(&self, file_id: &str, file_name: &str, dir: &Path) -> Result<PathBuf> {
        let file: File = self.call("getFile", json!({ "file_id": file_id })).await?;
        let Some(remote) = file.file_path else {
            return Err(Error::Network(format!("no download path for {file_name}")));
        };

        let url = format!("{API_BASE}/file/bot{}/{remote}", self.token.as_str());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(network_error)?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "download of {file_name} returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(network_error)?;

        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;
        info!("Received {} ({} bytes)", path.display(), bytes.len());
        Ok(path)
    }

    /// Records where `operator` writes from, unless the controller rejected the sender
    fn remember_chat(&self, operator: OperatorId, chat: i64, reply: &Reply) {
        if matches!(reply, Reply::Rejected(_)) {
            return;
        }
        if let Ok(mut chats) = self.chats.lock() {
            chats.insert(operator, chat);
        }
    }

    /// Chat for `operator`; in a private chat the chat id equals the user id
    fn chat_for(&self, operator: OperatorId) -> i64 {
        self.chats
            .lock()
            .ok()
            .and_then(|chats| chats.get(&operator).copied())
            .unwrap_or(operator)
    }
}

/// Turns one message into controller input and sends the reply
async fn handle_message<S: SessionStore, P: Producer>(
    bot: &TelegramBot,
    controller: &Controller<S, P>,
    workspace: &Workspace,
    message: Message,
) -> Result<()> {
    let chat = message.chat.id;
    let operator = message.from.map(|u| u.id).unwrap_or(chat);

    let incoming = if let Some(document) = message.document {
        let file_name = document
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_default();
        let dir = workspace.uploads_dir(operator);
        let path = if controller.wants_upload(operator, &file_name)? {
            bot.download(&document.file_id, &file_name, &dir).await?
        } else {
            // not fetched; the controller replies with the reason
            dir.join(&file_name)
        };
        Incoming::Document(Upload { file_name, path })
    } else if let Some(text) = message.text {
        Incoming::from_text(&text)
    } else {
        debug!("Ignoring message without text or document from {operator}");
        return Ok(());
    };

    let reply = controller.handle(operator, incoming)?;
    bot.remember_chat(operator, chat, &reply);
    bot.send(chat, reply.text()).await
}

/// Polls Telegram until the task is dropped. Job outcomes from `outbox` are forwarded by a
/// separate task.
pub(crate) async fn run_telegram<S: SessionStore, P: Producer>(
    bot: Arc<TelegramBot>,
    controller: Arc<Controller<S, P>>,
    workspace: Workspace,
    mut outbox: UnboundedReceiver<Outbound>,
) {
    let sender = Arc::clone(&bot);
    let forwarder = tokio::spawn(async move {
        while let Some(outbound) = outbox.recv().await {
            let chat = sender.chat_for(outbound.operator);
            if let Err(e) = sender.send(chat, &outbound.text).await {
                error!(
                    "Failed to deliver job result to operator {}: {e}",
                    outbound.operator
                );
            }
        }
    });

    info!("Telegram transport started");
    let mut offset = 0;
    loop {
        let updates = match bot.get_updates(offset).await {
            Ok(updates) => updates,
            Err(e) => {
                error!("Failed to fetch updates: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let chat = message.chat.id;
            if let Err(e) = handle_message(&bot, &controller, &workspace, message).await {
                error!("Failed to process update {}: {e}", update.update_id);
                if let Err(e) = bot.send(chat, APOLOGY_TEXT).await {
                    error!("Failed to send error notice to chat {chat}: {e}");
                }
            }
        }

        if forwarder.is_finished() {
            warn!("Outbox forwarder stopped");
            break;
        }
    }
}
