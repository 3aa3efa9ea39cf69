//! Provides data structures that carry operator answers to the credential producer

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::log_warn;

/// Identity of an operator as reported by the chat transport
pub type OperatorId = i64;

/// Number of days per year of validity handed to keytool
pub const DAYS_PER_YEAR: u32 = 365;

/// Validity used when the operator leaves the field blank or enters something unusable
pub const DEFAULT_VALIDITY_YEARS: u32 = 25;

pub const DEFAULT_ALIAS: &str = "mykey";
pub const DEFAULT_ORGANIZATION: &str = "MyCompany";
pub const DEFAULT_ORGANIZATIONAL_UNIT: &str = "IT";
pub const DEFAULT_CITY: &str = "Mumbai";
pub const DEFAULT_STATE: &str = "Maharashtra";
pub const DEFAULT_COUNTRY: &str = "IN";
pub const DEFAULT_STORE_PASSWORD: &str = "android";
pub const DEFAULT_PAYLOAD: &str = "app.apk";

/// Names each value collected by a dialogue
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Field {
    Alias,
    Organization,
    OrganizationalUnit,
    City,
    State,
    Country,
    StorePassword,
    KeyPassword,
    ValidityYears,
    Payload,
}

impl Field {
    /// Returns true for fields whose values must never be logged
    pub fn is_secret(&self) -> bool {
        matches!(self, Field::StorePassword | Field::KeyPassword)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Alias => "alias",
            Field::Organization => "organization",
            Field::OrganizationalUnit => "organizational-unit",
            Field::City => "city",
            Field::State => "state",
            Field::Country => "country-code",
            Field::StorePassword => "store-password",
            Field::KeyPassword => "key-password",
            Field::ValidityYears => "validity-in-years",
            Field::Payload => "payload-reference",
        };
        write!(f, "{name}")
    }
}

/// Answers collected so far, keyed by field. Values are wiped from memory when dropped.
#[derive(Clone, Default)]
pub struct FieldSet {
    values: BTreeMap<Field, Zeroizing<String>>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: Field, value: &str) {
        self.values.insert(field, Zeroizing::new(value.to_string()));
    }

    pub fn get(&self, field: Field) -> Option<&str> {
        self.values.get(&field).map(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the stored value or the given fallback when the field was never answered
    fn get_or<'a>(&'a self, field: Field, fallback: &'a str) -> &'a str {
        match self.get(field) {
            Some(v) if !v.trim().is_empty() => v,
            _ => fallback,
        }
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (field, value) in &self.values {
            if field.is_secret() {
                map.entry(field, &"********");
            } else {
                map.entry(field, &value.as_str());
            }
        }
        map.finish()
    }
}

/// Interprets operator supplied validity text as a positive number of years. Zero, negative,
/// blank and non-numeric input all yield [DEFAULT_VALIDITY_YEARS].
pub fn coerce_validity_years(text: &str) -> u32 {
    match text.trim().parse::<i64>() {
        Ok(years) if years > 0 => match u32::try_from(years) {
            Ok(y) if y.checked_mul(DAYS_PER_YEAR).is_some() => y,
            _ => {
                log_warn(&format!(
                    "Validity of {years} years is out of range; using {DEFAULT_VALIDITY_YEARS}"
                ));
                DEFAULT_VALIDITY_YEARS
            }
        },
        Ok(_) => DEFAULT_VALIDITY_YEARS,
        Err(_) => {
            if !text.trim().is_empty() {
                log_warn(&format!(
                    "Validity value {text:?} is not a number; using {DEFAULT_VALIDITY_YEARS}"
                ));
            }
            DEFAULT_VALIDITY_YEARS
        }
    }
}

/// Completed set of values needed to generate a keystore
#[derive(Clone)]
pub struct CertificateRequest {
    pub alias: String,
    pub organization: String,
    pub organizational_unit: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub store_password: Zeroizing<String>,
    pub key_password: Zeroizing<String>,
    pub validity_years: u32,
}

impl CertificateRequest {
    /// Builds a request from collected answers, applying the documented default for any field
    /// that is absent or blank.
    pub fn from_fields(fields: &FieldSet) -> Self {
        let store_password = fields.get_or(Field::StorePassword, DEFAULT_STORE_PASSWORD);
        CertificateRequest {
            alias: fields.get_or(Field::Alias, DEFAULT_ALIAS).to_string(),
            organization: fields
                .get_or(Field::Organization, DEFAULT_ORGANIZATION)
                .to_string(),
            organizational_unit: fields
                .get_or(Field::OrganizationalUnit, DEFAULT_ORGANIZATIONAL_UNIT)
                .to_string(),
            city: fields.get_or(Field::City, DEFAULT_CITY).to_string(),
            state: fields.get_or(Field::State, DEFAULT_STATE).to_string(),
            country: fields.get_or(Field::Country, DEFAULT_COUNTRY).to_string(),
            store_password: Zeroizing::new(store_password.to_string()),
            key_password: Zeroizing::new(
                fields
                    .get_or(Field::KeyPassword, store_password)
                    .to_string(),
            ),
            validity_years: coerce_validity_years(fields.get(Field::ValidityYears).unwrap_or("")),
        }
    }

    /// Returns the subject distinguished name for the self-signed certificate
    pub fn distinguished_name(&self) -> String {
        format!(
            "CN={}, OU={}, O={}, L={}, ST={}, C={}",
            self.alias,
            self.organizational_unit,
            self.organization,
            self.city,
            self.state,
            self.country
        )
    }

    pub fn validity_days(&self) -> u32 {
        self.validity_years * DAYS_PER_YEAR
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("dname", &self.distinguished_name())
            .field("validity_years", &self.validity_years)
            .finish_non_exhaustive()
    }
}

/// Completed set of values needed to sign a payload with an existing keystore
#[derive(Clone)]
pub struct SigningRequest {
    /// Payload as referenced by the operator; relative references are resolved by the producer
    pub payload: PathBuf,
    pub alias: String,
    pub store_password: Zeroizing<String>,
    pub key_password: Zeroizing<String>,
}

impl SigningRequest {
    pub fn from_fields(fields: &FieldSet) -> Self {
        let store_password = fields.get_or(Field::StorePassword, DEFAULT_STORE_PASSWORD);
        SigningRequest {
            payload: PathBuf::from(fields.get_or(Field::Payload, DEFAULT_PAYLOAD)),
            alias: fields.get_or(Field::Alias, DEFAULT_ALIAS).to_string(),
            store_password: Zeroizing::new(store_password.to_string()),
            key_password: Zeroizing::new(
                fields
                    .get_or(Field::KeyPassword, store_password)
                    .to_string(),
            ),
        }
    }
}

impl fmt::Debug for SigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningRequest")
            .field("payload", &self.payload)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}
