//! Deterministic test identity and failure fingerprints.
//!
//! Everything in this module is a pure function: the same inputs produce the
//! same identifiers on every platform and toolchain. Identifiers are SHA-256
//! digests encoded as lowercase hex, so they bound payload size and never
//! carry source text to the collection service.
//!
//! # Canonical Forms
//!
//! Inputs are canonicalized before hashing:
//!
//! | Input | Canonical form |
//! |-------|----------------|
//! | Test names, assemblies | Trimmed, inner whitespace runs collapsed to one space |
//! | Parameters | `<tag>:<len>:<text>` per value, see [`ParamValue`] |
//! | Error messages | `\r\n` → `\n`, trailing whitespace trimmed |
//! | Stack traces | Per-line trim, blank lines dropped, `\` → `/` |
//!
//! Hash inputs are length-prefixed and domain-separated, so no two distinct
//! field combinations can produce the same preimage.
//!
//! # Example
//!
//! ```
//! use testpulse::identity::{self, IdentityRequest, ParamValue};
//!
//! let request = IdentityRequest::new("billing::tests::rounds_half_up", "billing")
//!     .with_parameters(vec![ParamValue::from(2.5), ParamValue::from("EUR")]);
//!
//! let a = identity::generate(&request)?;
//! let b = identity::generate(&request)?;
//! assert_eq!(a.fingerprint, b.fingerprint);
//! assert_eq!(a.fingerprint.len(), 64);
//! # Ok::<(), testpulse::TelemetryError>(())
//! ```

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{TelemetryError, TelemetryResult};

const TEST_ID_DOMAIN: &str = "testpulse.test-id.v1";
const FINGERPRINT_DOMAIN: &str = "testpulse.fingerprint.v1";
const PARAMETERS_DOMAIN: &str = "testpulse.parameters.v1";
const ERROR_DOMAIN: &str = "testpulse.error-message.v1";
const STACK_DOMAIN: &str = "testpulse.stack-trace.v1";

/// Stable identity of a logical test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestIdentity {
    /// Hash of the canonical name and, for parameterized tests, the
    /// parameter hash.
    pub test_id: String,

    /// Hash of assembly, canonical name and parameter hash.
    pub fingerprint: String,

    pub fully_qualified_name: String,

    pub assembly: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_line: Option<u32>,
}

/// Input for [`generate`].
#[derive(Debug, Clone, Default)]
pub struct IdentityRequest {
    pub fully_qualified_name: String,
    pub assembly: String,
    pub parameters: Vec<ParamValue>,
    pub display_name: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<u32>,
}

impl IdentityRequest {
    /// Creates a request for a non-parameterized test.
    pub fn new(fully_qualified_name: impl Into<String>, assembly: impl Into<String>) -> Self {
        Self {
            fully_qualified_name: fully_qualified_name.into(),
            assembly: assembly.into(),
            ..Self::default()
        }
    }

    /// Sets the parameter values of this invocation.
    pub fn with_parameters(mut self, parameters: Vec<ParamValue>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the human-readable display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the source location of the test.
    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source_file = Some(file.into());
        self.source_line = Some(line);
        self
    }
}

/// A single test parameter value.
///
/// Each variant has its own tag in the canonical encoding, so `1` and `"1"`
/// never hash alike. All integer widths share the `int` tag: `1u8` and
/// `1i64` are the same value and produce the same hash.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    Char(char),
    Timestamp(DateTime<Utc>),
    Bytes(Vec<u8>),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Returns the `<tag>:<len>:<text>` encoding of this value.
    pub fn canonical(&self) -> String {
        let (tag, text) = match self {
            ParamValue::Null => ("null", String::new()),
            ParamValue::Bool(b) => ("bool", b.to_string()),
            ParamValue::Int(i) => ("int", i.to_string()),
            ParamValue::Float(f) => ("float", canonical_float(*f)),
            ParamValue::Str(s) => ("str", s.clone()),
            ParamValue::Char(c) => ("char", c.to_string()),
            ParamValue::Timestamp(t) => ("time", t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            ParamValue::Bytes(b) => ("bytes", hex::encode(b)),
            ParamValue::List(items) => (
                "list",
                items.iter().map(ParamValue::canonical).collect::<String>(),
            ),
        };
        format!("{}:{}:{}", tag, text.len(), text)
    }
}

/// Formats a float independently of platform and locale.
///
/// Uses the shortest representation that round-trips, in exponent form.
fn canonical_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if value == 0.0 {
        // folds -0.0 into 0.0
        "0e0".to_string()
    } else {
        format!("{:e}", value)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                ParamValue::Int(v as i128)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<char> for ParamValue {
    fn from(v: char) -> Self {
        ParamValue::Char(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<DateTime<Utc>> for ParamValue {
    fn from(v: DateTime<Utc>) -> Self {
        ParamValue::Timestamp(v)
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(v: Vec<u8>) -> Self {
        ParamValue::Bytes(v)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

/// Generates the full identity of a test invocation.
///
/// # Errors
///
/// Returns [`TelemetryError::InvalidArgument`] if the fully qualified name
/// or the assembly is empty after trimming.
pub fn generate(request: &IdentityRequest) -> TelemetryResult<TestIdentity> {
    let name = canonical_name(&request.fully_qualified_name);
    if name.is_empty() {
        return Err(TelemetryError::invalid(
            "fully qualified name must not be empty",
        ));
    }
    let assembly = canonical_name(&request.assembly);
    if assembly.is_empty() {
        return Err(TelemetryError::invalid("assembly must not be empty"));
    }

    let parameter_hash = if request.parameters.is_empty() {
        None
    } else {
        Some(generate_parameter_hash(&request.parameters))
    };

    let test_id = generate_test_id(&name, parameter_hash.as_deref());
    let fingerprint = digest(
        FINGERPRINT_DOMAIN,
        &[
            assembly.as_str(),
            name.as_str(),
            parameter_hash.as_deref().unwrap_or(""),
        ],
    );

    Ok(TestIdentity {
        test_id,
        fingerprint,
        fully_qualified_name: name,
        assembly,
        parameter_hash,
        display_name: request.display_name.clone(),
        source_file: request.source_file.as_ref().map(|f| f.replace('\\', "/")),
        source_line: request.source_line,
    })
}

/// Hashes a test name, optionally bound to a parameter hash.
///
/// Two invocations of the same parameterized test get different ids when
/// their parameter hashes differ.
pub fn generate_test_id(fully_qualified_name: &str, parameter_hash: Option<&str>) -> String {
    let name = canonical_name(fully_qualified_name);
    match parameter_hash {
        Some(params) => digest(TEST_ID_DOMAIN, &[name.as_str(), params]),
        None => digest(TEST_ID_DOMAIN, &[name.as_str()]),
    }
}

/// Hashes an ordered list of parameter values.
///
/// Order-sensitive: permuting the arguments changes the hash.
pub fn generate_parameter_hash(parameters: &[ParamValue]) -> String {
    let encoded: Vec<String> = parameters.iter().map(ParamValue::canonical).collect();
    let parts: Vec<&str> = encoded.iter().map(String::as_str).collect();
    digest(PARAMETERS_DOMAIN, &parts)
}

/// Hashes a failure message, or returns `None` for absent/blank input.
pub fn generate_error_message_hash(message: Option<&str>) -> Option<String> {
    let message = message?;
    let normalized = message.replace("\r\n", "\n");
    let normalized = normalized.trim_end();
    if normalized.trim().is_empty() {
        return None;
    }
    Some(digest(ERROR_DOMAIN, &[normalized]))
}

/// Hashes a stack trace, or returns `None` for absent/blank input.
pub fn generate_stack_trace_hash(trace: Option<&str>) -> Option<String> {
    let trace = trace?;
    let normalized: Vec<String> = trace
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.replace('\\', "/"))
        .collect();
    if normalized.is_empty() {
        return None;
    }
    Some(digest(STACK_DOMAIN, &[normalized.join("\n").as_str()]))
}

/// Trims and collapses whitespace runs.
fn canonical_name(name: &str) -> String {
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    let re = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static regex is valid"));
    re.replace_all(name.trim(), " ").into_owned()
}

/// SHA-256 over a domain tag and length-prefixed parts, as lowercase hex.
fn digest(domain: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
