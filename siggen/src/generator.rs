//! The rule pipeline engine.
//!
//! [`SignatureGenerator`] runs an ordered list of [`Rule`]s against one
//! crash report, collecting the signature and diagnostic notes in a
//! [`SignatureResult`]. Rules run strictly in order and each failure is
//! contained to the rule that raised it: a buggy rule must never prevent a
//! signature from being generated for the crash as a whole.

use std::sync::Arc;

use tracing::warn;

use crate::crash_data::CrashData;
use crate::rules::default_pipeline;
use crate::siglists::{SiglistError, SignatureLists};

/// Error raised by a rule's predicate or action.
///
/// The message ends up verbatim in the result notes, so keep it short and
/// self-contained.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RuleError(pub String);

impl RuleError {
    pub fn new(message: impl Into<String>) -> RuleError {
        RuleError(message.into())
    }
}

impl From<serde_json::Error> for RuleError {
    fn from(error: serde_json::Error) -> RuleError {
        RuleError(error.to_string())
    }
}

/// Severity of a diagnostic note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteKind {
    /// Worth storing with the processed crash.
    Info,
    /// Step-by-step trace, for debugging signature generation itself.
    Debug,
}

/// One diagnostic note, recorded in rule-execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub rule: String,
    pub message: String,
    pub kind: NoteKind,
}

impl Note {
    /// The rendered form consumers see: `"<rule>: <message>"`.
    pub fn render(&self) -> String {
        format!("{}: {}", self.rule, self.message)
    }
}

/// The accumulated result of one `generate()` run.
///
/// Owned exclusively by the pipeline while it runs, then returned by value.
#[derive(Debug, Default)]
pub struct SignatureResult {
    /// The signature. Always a single line; empty until some rule sets it.
    pub signature: String,
    /// The full list of normalized frames of the crashing thread, joined
    /// with `" | "`. Only set when there were frames to normalize.
    pub proto_signature: Option<String>,
    notes: Vec<Note>,
}

impl SignatureResult {
    pub fn new() -> SignatureResult {
        Default::default()
    }

    /// Replaces the signature, recording the change in the debug log.
    pub fn set_signature(&mut self, rule: &str, signature: impl Into<String>) {
        let signature = signature.into();
        self.debug(
            rule,
            format!("change: \"{}\" -> \"{}\"", self.signature, signature),
        );
        self.signature = signature;
    }

    /// Appends an info note.
    pub fn info(&mut self, rule: &str, message: impl Into<String>) {
        self.notes.push(Note {
            rule: rule.to_string(),
            message: message.into(),
            kind: NoteKind::Info,
        });
    }

    /// Appends a debug note.
    pub fn debug(&mut self, rule: &str, message: impl Into<String>) {
        self.notes.push(Note {
            rule: rule.to_string(),
            message: message.into(),
            kind: NoteKind::Debug,
        });
    }

    /// The rendered info notes, in the order they were recorded.
    pub fn notes(&self) -> Vec<String> {
        self.notes
            .iter()
            .filter(|note| note.kind == NoteKind::Info)
            .map(Note::render)
            .collect()
    }

    /// The rendered debug notes, in the order they were recorded.
    pub fn debug_log(&self) -> Vec<String> {
        self.notes
            .iter()
            .filter(|note| note.kind == NoteKind::Debug)
            .map(Note::render)
            .collect()
    }

    /// Every note record, info and debug interleaved in execution order.
    pub fn all_notes(&self) -> &[Note] {
        &self.notes
    }
}

/// One step of the signature pipeline.
///
/// Rules read `crash_data` and mutate only `result`. Anything that can go
/// wrong comes back as a [`RuleError`]; the engine records it and moves on.
pub trait Rule {
    /// The rule name used in notes.
    fn name(&self) -> &'static str;

    /// Whether or not to run this rule.
    fn predicate(
        &self,
        _crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(true)
    }

    /// Runs the rule against the data, modifying `result` in place.
    fn action(&self, crash_data: &CrashData, result: &mut SignatureResult)
        -> Result<(), RuleError>;
}

/// Callback invoked on every per-rule failure, for host telemetry. Receives
/// the crash data, the error, and the failing rule's name.
pub type ErrorHandler = Box<dyn Fn(&CrashData, &RuleError, &str) + Send + Sync>;

/// Runs an ordered rule pipeline over crash data to produce a signature.
pub struct SignatureGenerator {
    pipeline: Vec<Box<dyn Rule>>,
    error_handler: Option<ErrorHandler>,
}

impl SignatureGenerator {
    /// A generator running the default pipeline over the built-in
    /// classification lists.
    pub fn new() -> Result<SignatureGenerator, SiglistError> {
        let siglists = Arc::new(SignatureLists::builtin()?);
        Ok(SignatureGenerator::with_lists(siglists))
    }

    /// A generator running the default pipeline over the given lists.
    pub fn with_lists(siglists: Arc<SignatureLists>) -> SignatureGenerator {
        SignatureGenerator::with_pipeline(default_pipeline(siglists))
    }

    /// A generator running a custom pipeline.
    pub fn with_pipeline(pipeline: Vec<Box<dyn Rule>>) -> SignatureGenerator {
        SignatureGenerator {
            pipeline,
            error_handler: None,
        }
    }

    /// Installs a callback to be invoked on every per-rule failure.
    pub fn set_error_handler(&mut self, error_handler: ErrorHandler) {
        self.error_handler = Some(error_handler);
    }

    /// Runs every rule, in order, against `crash_data`.
    ///
    /// Never fails: a rule error becomes a note and the pipeline moves on,
    /// and if no rule produces a signature the result carries the `EMPTY`
    /// sentinel.
    pub fn generate(&self, crash_data: &CrashData) -> SignatureResult {
        let mut result = SignatureResult::new();

        for rule in &self.pipeline {
            let rule_name = rule.name();
            match rule.predicate(crash_data, &result) {
                Ok(false) => {}
                Ok(true) => {
                    if let Err(error) = rule.action(crash_data, &mut result) {
                        warn!("rule {} failed: {}", rule_name, error);
                        if let Some(error_handler) = &self.error_handler {
                            error_handler(crash_data, &error, rule_name);
                        }
                        result.info(rule_name, format!("Rule failed: {}", error));
                    }
                }
                Err(error) => {
                    warn!("rule {} predicate failed: {}", rule_name, error);
                    if let Some(error_handler) = &self.error_handler {
                        error_handler(crash_data, &error, rule_name);
                    }
                    result.info(rule_name, format!("Rule predicate failed: {}", error));
                }
            }
        }

        if result.signature.is_empty() {
            result.set_signature("SignatureGenerator", "EMPTY: no crashing thread identified");
        }

        result
    }
}
