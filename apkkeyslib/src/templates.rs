//! Text artifacts written next to a freshly generated keystore: the `sign_apk.sh` helper and the
//! `README_APK_SIGNING.txt` instructions.

use crate::keytool::{CERTIFICATE_FILE, KEYSTORE_FILE, PKCS12_FILE};

pub const SIGN_SCRIPT_FILE: &str = "sign_apk.sh";
pub const README_FILE: &str = "README_APK_SIGNING.txt";

/// Environment variables read by the helper script when passwords are not embedded
pub const STORE_PASSWORD_ENV: &str = "KEYSTORE_PASSWORD";
pub const KEY_PASSWORD_ENV: &str = "KEY_PASSWORD";

const SIGN_SCRIPT_TEMPLATE: &str = r#"#!/bin/bash
echo "🤖 APK Signing Tool - MT Manager Style"
echo "======================================"

if [ $# -eq 0 ]; then
    echo "Usage: $0 <app.apk>"
    echo "Example: $0 myapp.apk"
    exit 1
fi

APK_FILE="$1"
SIGNED_APK="signed_$APK_FILE"

if [ ! -f "$APK_FILE" ]; then
    echo "❌ APK file not found: $APK_FILE"
    exit 1
fi

if [ ! -f "<KEYSTORE>" ]; then
    echo "❌ Keystore not found: <KEYSTORE>"
    exit 1
fi
<SECRET CHECK>
echo "📦 Signing APK: $APK_FILE"

# Remove existing signature (if any)
zip -d "$APK_FILE" "META-INF/*" 2>/dev/null

# Sign the APK
jarsigner -verbose \
    -keystore "<KEYSTORE>" \
    -storepass "<STORE PASS>" \
    -keypass "<KEY PASS>" \
    -sigalg SHA256withRSA \
    -digestalg SHA-256 \
    "$APK_FILE" \
    "<ALIAS>"

if [ $? -eq 0 ]; then
    echo "✅ APK signed successfully!"
    echo "📁 Signed APK: $APK_FILE"

    # Verify signature
    echo "🔍 Verifying signature..."
    jarsigner -verify -verbose "$APK_FILE"
else
    echo "❌ APK signing failed!"
fi
"#;

const SECRET_CHECK_TEMPLATE: &str = r#"
if [ -z "$KEYSTORE_PASSWORD" ]; then
    echo "❌ Set KEYSTORE_PASSWORD (and KEY_PASSWORD if it differs) before signing"
    exit 1
fi
"#;

const README_TEMPLATE: &str = r#"APK SIGNING CERTIFICATE - MT MANAGER STYLE
==========================================

Generated on: <GENERATED ON>

📁 FILES CREATED:
----------------
1. <KEYSTORE>       - Java Keystore (Main file for APK signing)
2. <PKCS12>       - PKCS12 Keystore (Alternative format)
3. <CERTIFICATE>   - Public Certificate
4. <SCRIPT>       - APK signing script

🔑 PASSWORDS:
------------
Keystore Password: <STORE PASS>
Key Password: <KEY PASS>
Alias: <ALIAS>

🚀 HOW TO SIGN APK:
------------------
1. Copy your APK to this folder
2. Run: <RUN COMMAND>

📱 USING IN MT MANAGER:
----------------------
1. Copy '<KEYSTORE>' to your phone
2. In MT Manager, open APK file
3. Go to: Function -> APK Signature
4. Choose: Signature Scheme v1/v2/v3
5. Select your .jks file and enter password

⚠️  IMPORTANT:
-------------
- Keep '<KEYSTORE>' file safe and secure
- Don't lose the password - it cannot be recovered
- Backup your keystore files

Validity: <VALIDITY> years
Generated for: <ALIAS>
"#;

/// Values substituted into both templates
pub struct TemplateValues<'a> {
    pub alias: &'a str,
    pub store_password: &'a str,
    pub key_password: &'a str,
    pub validity_years: u32,
    pub generated_on: String,
    /// Write passwords in cleartext. Requires an explicit opt-in by whoever deploys the bot.
    pub embed_secrets: bool,
}

/// Replaces each `<TOKEN>` in `template` in a single pass, so substituted values are never
/// themselves scanned for tokens.
fn fill(template: &str, tokens: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'outer: while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        for (token, value) in tokens {
            if candidate.starts_with(token) {
                out.push_str(value);
                rest = &candidate[token.len()..];
                continue 'outer;
            }
        }
        out.push('<');
        rest = &candidate[1..];
    }
    out.push_str(rest);
    out
}

/// Escapes a value for use inside a double-quoted shell string
pub fn shell_double_quote_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn render_sign_script(values: &TemplateValues<'_>) -> String {
    let alias = shell_double_quote_escape(values.alias);
    let (store, key, check) = if values.embed_secrets {
        (
            shell_double_quote_escape(values.store_password),
            shell_double_quote_escape(values.key_password),
            String::new(),
        )
    } else {
        (
            format!("${STORE_PASSWORD_ENV}"),
            format!("${{{KEY_PASSWORD_ENV}:-${STORE_PASSWORD_ENV}}}"),
            SECRET_CHECK_TEMPLATE.to_string(),
        )
    };
    fill(
        SIGN_SCRIPT_TEMPLATE,
        &[
            ("<KEYSTORE>", KEYSTORE_FILE),
            ("<SECRET CHECK>", &check),
            ("<STORE PASS>", &store),
            ("<KEY PASS>", &key),
            ("<ALIAS>", &alias),
        ],
    )
}

pub fn render_readme(values: &TemplateValues<'_>) -> String {
    let validity = values.validity_years.to_string();
    let run_command = format!("./{SIGN_SCRIPT_FILE} your_app.apk");
    let redacted_run = format!("{STORE_PASSWORD_ENV}=<password> ./{SIGN_SCRIPT_FILE} your_app.apk");
    let (store, key, run) = if values.embed_secrets {
        (values.store_password, values.key_password, run_command.as_str())
    } else {
        ("(not recorded)", "(not recorded)", redacted_run.as_str())
    };
    fill(
        README_TEMPLATE,
        &[
            ("<GENERATED ON>", &values.generated_on),
            ("<KEYSTORE>", KEYSTORE_FILE),
            ("<PKCS12>", PKCS12_FILE),
            ("<CERTIFICATE>", CERTIFICATE_FILE),
            ("<SCRIPT>", SIGN_SCRIPT_FILE),
            ("<STORE PASS>", store),
            ("<KEY PASS>", key),
            ("<ALIAS>", values.alias),
            ("<RUN COMMAND>", run),
            ("<VALIDITY>", &validity),
        ],
    )
}
