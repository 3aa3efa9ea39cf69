//! Walks an operator through the questions of a flow and hands completed requests to a
//! [Producer].
//!
//! Each flow is a static table of [Step]s. The controller looks up the step named by the
//! session's cursor, stores the answer (or the step's fallback when the answer is blank) and moves
//! the cursor to the step's successor. A step without a successor completes the flow: the session
//! is cleared and the request runs as a background job whose outcome is delivered through the
//! outbox channel.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::{AllowList, ApkKeysConfig};
use crate::data::{
    CertificateRequest, Field, FieldSet, OperatorId, SigningRequest, DEFAULT_ALIAS,
    DEFAULT_CITY, DEFAULT_COUNTRY, DEFAULT_ORGANIZATION, DEFAULT_ORGANIZATIONAL_UNIT,
    DEFAULT_PAYLOAD, DEFAULT_STATE, DEFAULT_STORE_PASSWORD,
};
use crate::producer::{Produced, Producer};
use crate::session::{FlowKind, Session, SessionStore};
use crate::{log_debug, log_error, log_info, log_warn, Error, Result};

pub const UNAUTHORIZED_TEXT: &str = "❌ You are not authorized to use this bot.";
pub const NO_FLOW_TEXT: &str = "Please use /generate to start creating a certificate.";
pub const CANCELLED_TEXT: &str = "❌ Operation cancelled.";
pub const WELCOME_TEXT: &str = "🤖 *APK Signing Certificate Generator Bot* 🤖

I can generate APK signing certificates compatible with MT Manager!

*Available Commands:*
/start - Show this welcome message
/generate - Generate new APK signing certificate
/sign - Sign an APK with your generated keystore
/cancel - Cancel current operation

*How to use:*
1. Send /generate to start
2. Follow the prompts to enter certificate details
3. I'll create your keystore files!

*Supported Formats:*
• JKS (Java Keystore)
• PKCS12
• CER Certificate";

/// Chat commands understood by the controller
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Start,
    Generate,
    Sign,
    Cancel,
    /// Blank answer to the current question, for clients that cannot send empty messages
    Skip,
    /// Any other `/` text, kept verbatim. Answers the current question while a flow is active.
    Unknown(String),
}

/// A file received from the operator and already saved locally by the transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Upload {
    /// Name of the file as sent by the operator
    pub file_name: String,
    pub path: PathBuf,
}

/// One message from an operator
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Incoming {
    Command(Command),
    Text(String),
    Document(Upload),
}

impl Incoming {
    /// Interprets chat text, treating `/name` (optionally `/name@bot`) as a command
    pub fn from_text(text: &str) -> Incoming {
        let trimmed = text.trim_start();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Incoming::Text(text.to_string());
        };
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default();
        let command = match name {
            "start" | "help" => Command::Start,
            "generate" => Command::Generate,
            "sign" => Command::Sign,
            "cancel" => Command::Cancel,
            "skip" => Command::Skip,
            _ => Command::Unknown(text.to_string()),
        };
        Incoming::Command(command)
    }
}

/// Immediate answer to an [Incoming] message
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// Sender is not on the allow-list
    Rejected(String),
    Welcome(String),
    /// Question for the field now under the cursor
    Prompt(String),
    /// Input not acceptable in the current state; nothing changed
    Refused(String),
    /// No flow is active
    Guidance(String),
    /// Flow complete; the outcome follows through the outbox
    Accepted(String),
    Cancelled(String),
}

impl Reply {
    pub fn text(&self) -> &str {
        match self {
            Reply::Rejected(t)
            | Reply::Welcome(t)
            | Reply::Prompt(t)
            | Reply::Refused(t)
            | Reply::Guidance(t)
            | Reply::Accepted(t)
            | Reply::Cancelled(t) => t,
        }
    }
}

/// Message produced after the reply to the triggering input has been sent
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outbound {
    pub operator: OperatorId,
    pub text: String,
}

/// Value stored when an answer is blank
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fallback {
    Value(&'static str),
    /// Copy of an earlier field's stored value, or the given value if that field is absent
    SameAs(Field, &'static str),
}

impl Fallback {
    fn resolve(&self, fields: &FieldSet) -> String {
        match self {
            Fallback::Value(v) => v.to_string(),
            Fallback::SameAs(field, v) => fields.get(*field).unwrap_or(*v).to_string(),
        }
    }
}

/// One row of a flow table
#[derive(Clone, Copy, Debug)]
pub struct Step {
    pub field: Field,
    pub prompt: &'static str,
    pub fallback: Fallback,
    /// Field asked for after this one; None completes the flow
    pub next: Option<Field>,
}

#[derive(Debug)]
pub struct Flow {
    pub kind: FlowKind,
    /// Shown above the first prompt
    pub intro: &'static str,
    /// Sent when the flow completes and the job is started
    pub working: &'static str,
    pub steps: &'static [Step],
}

impl Flow {
    pub fn first(&self) -> Option<&Step> {
        self.steps.first()
    }

    pub fn step(&self, field: Field) -> Option<&Step> {
        self.steps.iter().find(|s| s.field == field)
    }
}

static GENERATE_STEPS: [Step; 9] = [
    Step {
        field: Field::Alias,
        prompt: "Please enter your *Name/Alias* for the certificate:",
        fallback: Fallback::Value(DEFAULT_ALIAS),
        next: Some(Field::Organization),
    },
    Step {
        field: Field::Organization,
        prompt: "🏢 Enter *Organization Name*:",
        fallback: Fallback::Value(DEFAULT_ORGANIZATION),
        next: Some(Field::OrganizationalUnit),
    },
    Step {
        field: Field::OrganizationalUnit,
        prompt: "🏢 Enter *Organizational Unit*:",
        fallback: Fallback::Value(DEFAULT_ORGANIZATIONAL_UNIT),
        next: Some(Field::City),
    },
    Step {
        field: Field::City,
        prompt: "🏙️ Enter *City*:",
        fallback: Fallback::Value(DEFAULT_CITY),
        next: Some(Field::State),
    },
    Step {
        field: Field::State,
        prompt: "🏛️ Enter *State*:",
        fallback: Fallback::Value(DEFAULT_STATE),
        next: Some(Field::Country),
    },
    Step {
        field: Field::Country,
        prompt: "🇮🇳 Enter *Country Code* (e.g., IN):",
        fallback: Fallback::Value(DEFAULT_COUNTRY),
        next: Some(Field::StorePassword),
    },
    Step {
        field: Field::StorePassword,
        prompt: "🔑 Enter *Keystore Password*:",
        fallback: Fallback::Value(DEFAULT_STORE_PASSWORD),
        next: Some(Field::KeyPassword),
    },
    Step {
        field: Field::KeyPassword,
        prompt: "🔐 Enter *Key Password* (or press Enter to use same as keystore):",
        fallback: Fallback::SameAs(Field::StorePassword, DEFAULT_STORE_PASSWORD),
        next: Some(Field::ValidityYears),
    },
    Step {
        field: Field::ValidityYears,
        prompt: "⏰ Enter *Validity in years* (default: 25):",
        fallback: Fallback::Value("25"),
        next: None,
    },
];

static SIGN_STEPS: [Step; 3] = [
    Step {
        field: Field::Payload,
        prompt: "📦 Send the *APK file* or enter its *path*:",
        fallback: Fallback::Value(DEFAULT_PAYLOAD),
        next: Some(Field::Alias),
    },
    Step {
        field: Field::Alias,
        prompt: "🔑 Enter the *Alias* of your signing key:",
        fallback: Fallback::Value(DEFAULT_ALIAS),
        next: Some(Field::StorePassword),
    },
    Step {
        field: Field::StorePassword,
        prompt: "🔑 Enter *Keystore Password*:",
        fallback: Fallback::Value(DEFAULT_STORE_PASSWORD),
        next: None,
    },
];

pub static GENERATE_FLOW: Flow = Flow {
    kind: FlowKind::Generate,
    intro: "🔐 *Let's create your APK signing certificate!*\nSend /skip to use the default for any question.",
    working: "⏳ Generating your APK signing certificate...",
    steps: &GENERATE_STEPS,
};

pub static SIGN_FLOW: Flow = Flow {
    kind: FlowKind::Sign,
    intro: "✍️ *Let's sign your APK!*\nSend /skip to use the default for any question.",
    working: "⏳ Signing your APK...",
    steps: &SIGN_STEPS,
};

pub fn flow_for(kind: FlowKind) -> &'static Flow {
    match kind {
        FlowKind::Generate => &GENERATE_FLOW,
        FlowKind::Sign => &SIGN_FLOW,
    }
}

struct Job {
    id: u64,
    cancel: CancellationToken,
}

type JobTable = Arc<Mutex<HashMap<OperatorId, Job>>>;

/// Per-operator dialogue driver. Replies are returned from [Controller::handle]; job outcomes are
/// sent to the outbox given at construction.
pub struct Controller<S: SessionStore, P: Producer> {
    allow: AllowList,
    sessions: S,
    producer: Arc<P>,
    jobs: JobTable,
    next_job: AtomicU64,
    outbox: UnboundedSender<Outbound>,
    config: ApkKeysConfig,
}

impl<S: SessionStore, P: Producer> Controller<S, P> {
    pub fn new(
        allow: AllowList,
        sessions: S,
        producer: Arc<P>,
        config: &ApkKeysConfig,
        outbox: UnboundedSender<Outbound>,
    ) -> Self {
        Controller {
            allow,
            sessions,
            producer,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_job: AtomicU64::new(0),
            outbox,
            config: config.clone(),
        }
    }

    pub fn sessions(&self) -> &S {
        &self.sessions
    }

    /// Number of jobs that have been started and have not yet finished
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or_default()
    }

    /// Processes one message. Must be called from within a tokio runtime.
    pub fn handle(&self, operator: OperatorId, incoming: Incoming) -> Result<Reply> {
        if !self.allow.contains(operator) {
            log_warn(&format!("Rejected message from unauthorized sender {operator}"));
            return Ok(Reply::Rejected(Error::Unauthorized.user_message()));
        }

        match incoming {
            Incoming::Command(Command::Start) => Ok(Reply::Welcome(WELCOME_TEXT.to_string())),
            Incoming::Command(Command::Generate) => self.begin(operator, &GENERATE_FLOW),
            Incoming::Command(Command::Sign) => self.begin(operator, &SIGN_FLOW),
            Incoming::Command(Command::Cancel) => self.cancel(operator),
            Incoming::Command(Command::Skip) => self.answer(operator, ""),
            Incoming::Command(Command::Unknown(raw)) => {
                if self.sessions.get(operator)?.is_some() {
                    return self.answer(operator, &raw);
                }
                log_debug(&format!("Ignoring unknown command {} from {operator}", raw.trim()));
                Ok(Reply::Guidance(WELCOME_TEXT.to_string()))
            }
            Incoming::Text(text) => self.answer(operator, &text),
            Incoming::Document(upload) => self.answer_upload(operator, upload),
        }
    }

    /// Returns true if an upload named `file_name` would be taken as the operator's payload. Lets
    /// a transport skip fetching files that would only be refused.
    pub fn wants_upload(&self, operator: OperatorId, file_name: &str) -> Result<bool> {
        if !self.allow.contains(operator) || !self.config.accepts_payload(file_name) {
            return Ok(false);
        }
        Ok(self
            .sessions
            .get(operator)?
            .is_some_and(|s| s.cursor == Field::Payload))
    }

    /// Cancels every running job, e.g. at shutdown
    pub fn cancel_all(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            for (_, job) in jobs.drain() {
                job.cancel.cancel();
            }
        }
    }

    fn begin(&self, operator: OperatorId, flow: &'static Flow) -> Result<Reply> {
        let Some(first) = flow.first() else {
            log_error(&format!("{:?} flow has no steps", flow.kind));
            return Err(Error::Config("empty flow".to_string()));
        };
        self.sessions
            .put(operator, Session::new(flow.kind, first.field))?;
        log_info(&format!("Operator {operator} started {:?} flow", flow.kind));
        Ok(Reply::Prompt(format!("{}\n\n{}", flow.intro, first.prompt)))
    }

    fn cancel(&self, operator: OperatorId) -> Result<Reply> {
        self.sessions.clear(operator)?;
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(job) = jobs.remove(&operator) {
                log_info(&format!("Cancelling job {} of operator {operator}", job.id));
                job.cancel.cancel();
            }
        }
        Ok(Reply::Cancelled(CANCELLED_TEXT.to_string()))
    }

    fn answer(&self, operator: OperatorId, text: &str) -> Result<Reply> {
        let Some(mut session) = self.sessions.get(operator)? else {
            return Ok(Reply::Guidance(NO_FLOW_TEXT.to_string()));
        };
        let flow = flow_for(session.flow);
        let Some(step) = flow.step(session.cursor) else {
            log_error(&format!(
                "Cursor {} of operator {operator} is not part of the {:?} flow",
                session.cursor, session.flow
            ));
            self.sessions.clear(operator)?;
            return Err(Error::BadInput(format!("unexpected field {}", session.cursor)));
        };

        if text.trim().is_empty() {
            let value = step.fallback.resolve(&session.fields);
            session.fields.insert(step.field, &value);
        } else {
            session.fields.insert(step.field, text);
        }
        log_debug(&format!("Operator {operator} answered {}", step.field));

        match step.next.and_then(|next| flow.step(next)) {
            Some(next) => {
                session.cursor = next.field;
                self.sessions.put(operator, session)?;
                Ok(Reply::Prompt(next.prompt.to_string()))
            }
            None => {
                self.sessions.clear(operator)?;
                Ok(self.hand_off(operator, flow, &session.fields))
            }
        }
    }

    fn answer_upload(&self, operator: OperatorId, upload: Upload) -> Result<Reply> {
        let Some(session) = self.sessions.get(operator)? else {
            return Ok(Reply::Guidance(NO_FLOW_TEXT.to_string()));
        };
        if session.cursor != Field::Payload {
            return Ok(Reply::Refused(
                "📎 I'm not expecting a file right now. Please answer the question above."
                    .to_string(),
            ));
        }
        if !self.config.accepts_payload(&upload.file_name) {
            log_warn(&format!(
                "Operator {operator} uploaded unsupported file {}",
                upload.file_name
            ));
            return Ok(Reply::Refused(format!(
                "❌ Unsupported file type. Please send a file ending in: {}",
                self.config
                    .payload_extensions
                    .iter()
                    .map(|e| format!(".{e}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        self.answer(operator, &upload.path.to_string_lossy())
    }

    /// Starts the job for a completed flow and returns the acknowledgement
    fn hand_off(&self, operator: OperatorId, flow: &Flow, fields: &FieldSet) -> Reply {
        let id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(previous) = jobs.insert(
                operator,
                Job {
                    id,
                    cancel: cancel.clone(),
                },
            ) {
                log_warn(&format!(
                    "Job {} of operator {operator} superseded by job {id}",
                    previous.id
                ));
                previous.cancel.cancel();
            }
        }

        let producer = Arc::clone(&self.producer);
        let token = cancel.clone();
        let timeout = self.config.job_timeout();
        let jobs = Arc::clone(&self.jobs);
        let outbox = self.outbox.clone();
        match flow.kind {
            FlowKind::Generate => {
                let request = CertificateRequest::from_fields(fields);
                let work = async move { producer.generate(operator, request, token).await };
                tokio::spawn(run_job(operator, id, cancel, timeout, jobs, outbox, work));
            }
            FlowKind::Sign => {
                let request = SigningRequest::from_fields(fields);
                let work = async move { producer.sign(operator, request, token).await };
                tokio::spawn(run_job(operator, id, cancel, timeout, jobs, outbox, work));
            }
        }
        log_info(&format!("Started job {id} for operator {operator}"));
        Reply::Accepted(flow.working.to_string())
    }
}

/// Awaits a job, bounding it by `timeout`, then reports its outcome to the operator. A job stopped
/// through its token reports nothing, as the operator has already been told.
async fn run_job<F>(
    operator: OperatorId,
    id: u64,
    cancel: CancellationToken,
    timeout: Duration,
    jobs: JobTable,
    outbox: UnboundedSender<Outbound>,
    work: F,
) where
    F: Future<Output = Result<Produced>> + Send,
{
    tokio::pin!(work);
    let bounded = tokio::time::timeout(timeout, &mut work).await;
    let outcome = match bounded {
        Ok(r) => r,
        Err(_) => {
            // let the producer observe the token and clean up before reporting
            log_error(&format!("Job {id} of operator {operator} exceeded {timeout:?}"));
            cancel.cancel();
            match work.await {
                Err(Error::Cancelled) => Err(Error::Timeout),
                other => other,
            }
        }
    };

    if let Ok(mut jobs) = jobs.lock() {
        if jobs.get(&operator).map(|j| j.id) == Some(id) {
            jobs.remove(&operator);
        }
    }

    let messages = match outcome {
        Ok(produced) => {
            log_info(&format!("Job {id} of operator {operator} succeeded"));
            produced.messages
        }
        Err(Error::Cancelled) => {
            log_info(&format!("Job {id} of operator {operator} was cancelled"));
            vec![]
        }
        Err(e) => {
            log_error(&format!("Job {id} of operator {operator} failed: {e}"));
            vec![e.user_message()]
        }
    };

    for text in messages {
        if outbox.send(Outbound { operator, text }).is_err() {
            log_warn(&format!(
                "Outbox closed; dropped result of job {id} for operator {operator}"
            ));
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_table(flow: &Flow) {
        let first = flow.first().unwrap();
        let mut seen = vec![first.field];
        let mut step = first;
        while let Some(next) = step.next {
            assert!(!seen.contains(&next), "cycle at {next}");
            step = flow.step(next).unwrap();
            seen.push(next);
        }
        assert_eq!(seen.len(), flow.steps.len());
    }

    #[test]
    fn tables_are_linear_and_complete() {
        check_table(&GENERATE_FLOW);
        check_table(&SIGN_FLOW);
    }

    #[test]
    fn generation_order() {
        let order: Vec<Field> = GENERATE_FLOW.steps.iter().map(|s| s.field).collect();
        assert_eq!(
            order,
            vec![
                Field::Alias,
                Field::Organization,
                Field::OrganizationalUnit,
                Field::City,
                Field::State,
                Field::Country,
                Field::StorePassword,
                Field::KeyPassword,
                Field::ValidityYears,
            ]
        );
        let order: Vec<Field> = SIGN_FLOW.steps.iter().map(|s| s.field).collect();
        assert_eq!(order, vec![Field::Payload, Field::Alias, Field::StorePassword]);
    }

    #[test]
    fn command_parsing() {
        assert_eq!(
            Incoming::from_text("/generate"),
            Incoming::Command(Command::Generate)
        );
        assert_eq!(
            Incoming::from_text("/cancel@ApkKeysBot"),
            Incoming::Command(Command::Cancel)
        );
        assert_eq!(
            Incoming::from_text("/frobnicate now"),
            Incoming::Command(Command::Unknown("/frobnicate now".to_string()))
        );
        assert_eq!(
            Incoming::from_text("/tmp/app.apk"),
            Incoming::Command(Command::Unknown("/tmp/app.apk".to_string()))
        );
        assert_eq!(
            Incoming::from_text("My Company"),
            Incoming::Text("My Company".to_string())
        );
        assert_eq!(Incoming::from_text(""), Incoming::Text(String::new()));
    }

    #[test]
    fn key_password_fallback_copies_store_password() {
        let mut fields = FieldSet::new();
        let fallback = Fallback::SameAs(Field::StorePassword, DEFAULT_STORE_PASSWORD);
        assert_eq!(fallback.resolve(&fields), DEFAULT_STORE_PASSWORD);
        fields.insert(Field::StorePassword, "pw");
        assert_eq!(fallback.resolve(&fields), "pw");
    }
}
