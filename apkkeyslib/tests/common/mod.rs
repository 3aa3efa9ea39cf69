//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use apkkeyslib::config::ApkKeysConfig;
use apkkeyslib::keytool::{CERTIFICATE_FILE, KEYSTORE_FILE, PKCS12_FILE};
use apkkeyslib::tool::{ToolAction, ToolInvocation, ToolOutput, ToolRunner};
use apkkeyslib::{Error, Result};

/// Stand-in for keytool/jarsigner. Records every invocation and answers with configured exit
/// codes, creating the files the real tools would create on success.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    pub calls: Arc<Mutex<Vec<ToolInvocation>>>,
    exit_codes: Arc<Mutex<HashMap<ToolAction, i32>>>,
    probe_codes: Arc<Mutex<VecDeque<i32>>>,
    delays: Arc<Mutex<HashMap<ToolAction, Duration>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(self, action: ToolAction, code: i32) -> Self {
        self.exit_codes.lock().unwrap().insert(action, code);
        self
    }

    /// Exit codes returned by successive probes; once exhausted probes succeed
    pub fn probes(self, codes: &[i32]) -> Self {
        self.probe_codes.lock().unwrap().extend(codes.iter().copied());
        self
    }

    pub fn delay(self, action: ToolAction, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(action, delay);
        self
    }

    pub fn actions(&self) -> Vec<ToolAction> {
        self.calls.lock().unwrap().iter().map(|c| c.action).collect()
    }

    pub fn invocations(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap().clone()
    }

    fn exit_code(&self, action: ToolAction) -> i32 {
        if action == ToolAction::Probe {
            if let Some(code) = self.probe_codes.lock().unwrap().pop_front() {
                return code;
            }
        }
        self.exit_codes
            .lock()
            .unwrap()
            .get(&action)
            .copied()
            .unwrap_or(0)
    }
}

fn touch(dir: &Path, name: &str) {
    std::fs::write(dir.join(name), format!("{name} contents")).unwrap();
}

impl ToolRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        let delay = self.delays.lock().unwrap().get(&invocation.action).copied();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let code = self.exit_code(invocation.action);
        if code != 0 {
            return Ok(ToolOutput {
                status: Some(code),
                stdout: String::new(),
                stderr: format!("simulated {} failure", invocation.action),
            });
        }

        let dir = &invocation.current_dir;
        match invocation.action {
            ToolAction::GenerateKeyPair => touch(dir, KEYSTORE_FILE),
            ToolAction::ExportCertificate => touch(dir, CERTIFICATE_FILE),
            ToolAction::ConvertContainer => touch(dir, PKCS12_FILE),
            _ => {}
        }
        Ok(ToolOutput {
            status: Some(0),
            stdout: format!("{} ok", invocation.action),
            stderr: String::new(),
        })
    }
}

/// Configuration rooted in `work_dir` with installation disabled
pub fn test_config(work_dir: &Path) -> ApkKeysConfig {
    ApkKeysConfig {
        work_dir: work_dir.to_path_buf(),
        install_commands: vec![],
        jdk_download_url: None,
        ..Default::default()
    }
}

// Call this from tests when actively debugging (hence allow(dead_code)).
pub fn init_console_logging() {
    use log::LevelFilter;
    use log4rs::{
        append::console::ConsoleAppender,
        config::{Appender, Config, Root},
        encode::pattern::PatternEncoder,
    };
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{m}{n}")))
        .build();
    match Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Debug))
    {
        Ok(config) => {
            if let Err(e) = log4rs::init_config(config) {
                println!("ERROR: failed to configure logging for stdout with {e:?}.");
            }
        }
        Err(e) => {
            println!("ERROR: failed to prepare default logging configuration with {e:?}");
        }
    }
}
