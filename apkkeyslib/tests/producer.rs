mod common;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use apkkeyslib::data::{CertificateRequest, Field, FieldSet, SigningRequest};
use apkkeyslib::keytool::{CERTIFICATE_FILE, KEYSTORE_FILE, PKCS12_FILE};
use apkkeyslib::producer::{CredentialProducer, Producer, ARTIFACT_FILES};
use apkkeyslib::templates::{README_FILE, SIGN_SCRIPT_FILE};
use apkkeyslib::tool::ToolAction;
use apkkeyslib::Error;
use common::{test_config, ScriptedRunner};

const OPERATOR: i64 = 5827445104;

fn certificate_request() -> CertificateRequest {
    let mut fields = FieldSet::new();
    fields.insert(Field::Alias, "release");
    fields.insert(Field::Organization, "Acme");
    fields.insert(Field::StorePassword, "s3cret!");
    fields.insert(Field::ValidityYears, "10");
    CertificateRequest::from_fields(&fields)
}

fn signing_request(payload: &Path) -> SigningRequest {
    let mut fields = FieldSet::new();
    fields.insert(Field::Payload, &payload.to_string_lossy());
    fields.insert(Field::Alias, "release");
    fields.insert(Field::StorePassword, "s3cret!");
    SigningRequest::from_fields(&fields)
}

fn producer(runner: &ScriptedRunner, work: &Path) -> CredentialProducer<ScriptedRunner> {
    CredentialProducer::new(runner.clone(), &test_config(work))
}

fn entries(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(rd) => rd.map(|e| e.unwrap().path()).collect(),
        Err(_) => vec![],
    }
}

#[tokio::test]
async fn generate_publishes_all_artifacts() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());

    let produced = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        runner.actions(),
        vec![
            ToolAction::Probe,
            ToolAction::GenerateKeyPair,
            ToolAction::ExportCertificate,
            ToolAction::ConvertContainer,
        ]
    );
    let dir = producer.workspace().operator_dir(OPERATOR);
    for name in ARTIFACT_FILES {
        assert!(dir.join(name).is_file(), "{name} missing");
    }
    assert_eq!(produced.artifacts.len(), ARTIFACT_FILES.len());
    assert!(produced.warnings.is_empty());
    assert_eq!(produced.messages.len(), 2);
    assert!(produced.messages[0].contains("Alias: `release`"));
    assert!(produced.messages[0].contains("Organization: `Acme`"));
    assert!(produced.messages[0].contains("`10 years`"));
    assert!(entries(&work.path().join(".staging")).is_empty());

    let genkey = runner.invocations()[1].clone();
    assert_eq!(genkey.value_of("-validity"), Some("3650"));
    assert_eq!(genkey.value_of("-keypass"), Some("s3cret!"));
    assert_eq!(
        genkey.value_of("-dname"),
        Some("CN=release, OU=IT, O=Acme, L=Mumbai, ST=Maharashtra, C=IN")
    );

    let readme = std::fs::read_to_string(dir.join(README_FILE)).unwrap();
    assert!(readme.contains("release"));
    assert!(!readme.contains("s3cret!"));
    let script = std::fs::read_to_string(dir.join(SIGN_SCRIPT_FILE)).unwrap();
    assert!(!script.contains("s3cret!"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.join(SIGN_SCRIPT_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}

#[tokio::test]
async fn embedded_secrets_reach_the_script() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let mut config = test_config(work.path());
    config.embed_secrets = true;
    let producer = CredentialProducer::new(runner.clone(), &config);

    producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    let dir = producer.workspace().operator_dir(OPERATOR);
    let script = std::fs::read_to_string(dir.join(SIGN_SCRIPT_FILE)).unwrap();
    assert!(script.contains("s3cret!"));
}

#[tokio::test]
async fn failed_keypair_generation_stops_the_sequence() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().fail(ToolAction::GenerateKeyPair, 1);
    let producer = producer(&runner, work.path());

    let err = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        Error::ExternalTool { action, diagnostic } => {
            assert_eq!(*action, ToolAction::GenerateKeyPair);
            assert!(diagnostic.contains("simulated"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.user_message().contains("Failed to create JKS"));
    assert_eq!(
        runner.actions(),
        vec![ToolAction::Probe, ToolAction::GenerateKeyPair]
    );
    assert!(!producer.workspace().operator_dir(OPERATOR).exists());
    assert!(entries(&work.path().join(".staging")).is_empty());
}

#[tokio::test]
async fn failed_keypair_generation_keeps_previous_artifacts() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());
    producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    let failing = ScriptedRunner::new().fail(ToolAction::GenerateKeyPair, 1);
    let second = CredentialProducer::new(failing, &test_config(work.path()));
    assert!(second
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .is_err());

    assert!(producer.workspace().keystore_path(OPERATOR).is_file());
    assert!(entries(&work.path().join(".archive")).is_empty());
}

#[tokio::test]
async fn export_failure_is_a_warning() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().fail(ToolAction::ExportCertificate, 1);
    let producer = producer(&runner, work.path());

    let produced = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(runner.actions().last(), Some(&ToolAction::ConvertContainer));
    assert_eq!(produced.warnings.len(), 1);
    assert!(produced.warnings[0].contains("certificate export"));
    assert!(produced.messages.last().unwrap().contains("Warnings"));
    let dir = producer.workspace().operator_dir(OPERATOR);
    assert!(dir.join(KEYSTORE_FILE).is_file());
    assert!(dir.join(PKCS12_FILE).is_file());
    assert!(!dir.join(CERTIFICATE_FILE).exists());
    assert_eq!(produced.artifacts.len(), ARTIFACT_FILES.len() - 1);
}

#[tokio::test]
async fn conversion_failure_is_a_warning() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().fail(ToolAction::ConvertContainer, 1);
    let producer = producer(&runner, work.path());

    let produced = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        runner.actions(),
        vec![
            ToolAction::Probe,
            ToolAction::GenerateKeyPair,
            ToolAction::ExportCertificate,
            ToolAction::ConvertContainer
        ]
    );
    assert_eq!(produced.warnings.len(), 1);
    assert!(produced.warnings[0].contains("PKCS12 conversion"));
    let dir = producer.workspace().operator_dir(OPERATOR);
    assert!(dir.join(KEYSTORE_FILE).is_file());
    assert!(dir.join(CERTIFICATE_FILE).is_file());
    assert!(dir.join(SIGN_SCRIPT_FILE).is_file());
    assert!(!dir.join(PKCS12_FILE).exists());

    let listing = &produced.messages[1];
    assert!(listing.contains(KEYSTORE_FILE));
    assert!(listing.contains(CERTIFICATE_FILE));
    assert!(!listing.contains(PKCS12_FILE));
}

#[tokio::test]
async fn file_listing_matches_artifacts() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new()
        .fail(ToolAction::ExportCertificate, 1)
        .fail(ToolAction::ConvertContainer, 1);
    let producer = producer(&runner, work.path());

    let produced = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(produced.warnings.len(), 2);
    assert_eq!(produced.artifacts.len(), ARTIFACT_FILES.len() - 2);
    let listing = &produced.messages[1];
    assert_eq!(listing.lines().count(), produced.artifacts.len() + 1);
    for name in [KEYSTORE_FILE, SIGN_SCRIPT_FILE, README_FILE] {
        assert!(listing.contains(name), "{name} missing from {listing}");
    }
    assert!(!listing.contains(PKCS12_FILE));
    assert!(!listing.contains(CERTIFICATE_FILE));
}

#[tokio::test]
async fn regenerate_archives_previous_keystore() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());

    for _ in 0..2 {
        producer
            .generate(OPERATOR, certificate_request(), CancellationToken::new())
            .await
            .unwrap();
    }

    let archived = entries(&work.path().join(".archive"));
    assert_eq!(archived.len(), 1);
    assert!(archived[0].join(KEYSTORE_FILE).is_file());
    assert!(producer.workspace().keystore_path(OPERATOR).is_file());
    // the probe result is cached after the first request
    assert_eq!(
        runner
            .actions()
            .iter()
            .filter(|a| **a == ToolAction::Probe)
            .count(),
        1
    );
}

#[tokio::test]
async fn sign_missing_payload_runs_nothing() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());

    let missing = work.path().join("missing.apk");
    let err = producer
        .sign(OPERATOR, signing_request(&missing), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err, Error::NotFound(missing));
    assert!(runner.actions().is_empty());
}

#[tokio::test]
async fn sign_without_keystore_runs_nothing() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());

    let payload = work.path().join("app.apk");
    std::fs::write(&payload, b"PK").unwrap();
    let err = producer
        .sign(OPERATOR, signing_request(&payload), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        Error::NotFound(producer.workspace().keystore_path(OPERATOR))
    );
    assert!(runner.actions().is_empty());
}

#[tokio::test]
async fn sign_then_verify() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new();
    let producer = producer(&runner, work.path());
    producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    let uploads = producer.workspace().uploads_dir(OPERATOR);
    std::fs::create_dir_all(&uploads).unwrap();
    std::fs::write(uploads.join("app.apk"), b"PK").unwrap();

    // relative payloads are looked up among the operator's uploads
    let produced = producer
        .sign(
            OPERATOR,
            signing_request(Path::new("app.apk")),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let actions = runner.actions();
    assert_eq!(
        &actions[actions.len() - 2..],
        &[ToolAction::SignPayload, ToolAction::VerifySignature]
    );
    let sign = runner.invocations()[actions.len() - 2].clone();
    let keystore = producer.workspace().keystore_path(OPERATOR);
    assert_eq!(sign.value_of("-keystore"), keystore.to_str());
    assert_eq!(sign.args.last().map(String::as_str), Some("release"));
    assert!(produced.messages[0].contains("signed successfully"));
    assert!(produced.messages[1].contains("signature verification ok"));
    assert_eq!(produced.artifacts, vec![uploads.join("app.apk")]);
}

#[tokio::test]
async fn failed_signing_skips_verification() {
    let work = tempfile::tempdir().unwrap();
    let generator = ScriptedRunner::new();
    producer(&generator, work.path())
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    let runner = ScriptedRunner::new().fail(ToolAction::SignPayload, 1);
    let producer = producer(&runner, work.path());
    let payload = work.path().join("app.apk");
    std::fs::write(&payload, b"PK").unwrap();

    let err = producer
        .sign(OPERATOR, signing_request(&payload), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::ExternalTool {
            action: ToolAction::SignPayload,
            ..
        }
    ));
    assert!(err.user_message().contains("APK signing failed"));
    assert_eq!(
        runner.actions(),
        vec![ToolAction::Probe, ToolAction::SignPayload]
    );
}

#[tokio::test]
async fn unavailable_tools_abort_before_generation() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().fail(ToolAction::Probe, 127);
    let producer = producer(&runner, work.path());

    let err = producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ToolUnavailable(_)));
    assert_eq!(
        err.user_message(),
        "❌ Failed to install Java. Please install manually."
    );
    assert!(!runner.actions().contains(&ToolAction::GenerateKeyPair));
}

#[tokio::test]
async fn package_manager_install_recovers() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().probes(&[1]);
    let mut config = test_config(work.path());
    config.install_commands = vec![
        vec!["pkg".to_string(), "update".to_string(), "-y".to_string()],
        vec!["pkg".to_string(), "install".to_string(), "-y".to_string(), "openjdk-17".to_string()],
    ];
    let producer = CredentialProducer::new(runner.clone(), &config);

    producer
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        &runner.actions()[..5],
        &[
            ToolAction::Probe,
            ToolAction::Install,
            ToolAction::Install,
            ToolAction::Probe,
            ToolAction::GenerateKeyPair,
        ]
    );
    let install = runner.invocations()[2].clone();
    assert_eq!(install.program, PathBuf::from("pkg"));
    assert_eq!(install.args, vec!["install", "-y", "openjdk-17"]);
}

#[tokio::test]
async fn cancelled_generation_leaves_nothing_behind() {
    let work = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new().delay(
        ToolAction::GenerateKeyPair,
        std::time::Duration::from_secs(30),
    );
    let producer = producer(&runner, work.path());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = producer
        .generate(OPERATOR, certificate_request(), cancel)
        .await
        .unwrap_err();

    assert_eq!(err, Error::Cancelled);
    assert!(!producer.workspace().operator_dir(OPERATOR).exists());
    assert!(entries(&work.path().join(".staging")).is_empty());
}

#[tokio::test]
async fn verification_failure_is_a_warning() {
    let work = tempfile::tempdir().unwrap();
    let generator = ScriptedRunner::new();
    producer(&generator, work.path())
        .generate(OPERATOR, certificate_request(), CancellationToken::new())
        .await
        .unwrap();

    let runner = ScriptedRunner::new().fail(ToolAction::VerifySignature, 1);
    let producer = producer(&runner, work.path());
    let payload = work.path().join("app.apk");
    std::fs::write(&payload, b"PK").unwrap();

    let produced = producer
        .sign(OPERATOR, signing_request(&payload), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        runner.actions(),
        vec![
            ToolAction::Probe,
            ToolAction::SignPayload,
            ToolAction::VerifySignature
        ]
    );
    assert!(produced.messages[0].contains("signed successfully"));
    assert_eq!(produced.warnings.len(), 1);
    assert!(produced.warnings[0].contains("signature verification failed"));
    assert!(produced.warnings[0].contains("simulated signature verification failure"));
    assert!(produced.messages.last().unwrap().contains("Warnings"));
    assert_eq!(produced.artifacts, vec![payload]);
}
