//! The individual signature rules and the default pipeline.
//!
//! Each rule is a narrow, independent transformation over the shared
//! [`SignatureResult`]. Order matters: later rules routinely build on
//! signature state set by earlier ones, so the pipeline is applied strictly
//! in sequence.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::c_signature::{CSignatureTool, MAXIMUM_FRAMES_TO_CONSIDER, SIGNATURE_MAX_LENGTH};
use crate::crash_data::{CrashData, Frame};
use crate::generator::{Rule, RuleError, SignatureResult};
use crate::java_signature::JavaSignatureTool;
use crate::siglists::SignatureLists;
use crate::utils::{drop_bad_characters, parse_source_file};

/// The default rule pipeline, in its required order.
pub fn default_pipeline(siglists: Arc<SignatureLists>) -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(SignatureGenerationRule::new(Arc::clone(&siglists))),
        Box::new(StackwalkerErrorSignatureRule),
        Box::new(OOMSignature),
        Box::new(AbortSignature),
        Box::new(SignatureShutdownTimeout),
        Box::new(SignatureRunWatchDog::new(siglists)),
        Box::new(SignatureIPCChannelError),
        Box::new(SignatureIPCMessageName),
        Box::new(SignatureParentIDNotEqualsChildID),
        Box::new(SignatureJitCategory),
        Box::new(SigFixWhitespace),
        Box::new(SigTruncate),
    ]
}

fn is_set(field: &Option<String>) -> bool {
    field.as_deref().map_or(false, |value| !value.is_empty())
}

// In Rust 1.34, panic symbols are missing the module in symbols files, which
// keeps signature sentinels from matching. This maps (file, function) to the
// fully qualified name.
const FILE_FUNCTION_TO_FUNCTION: &[((&str, &str), &str)] = &[
    (
        ("src/liballoc/raw_vec.rs", "capacity_overflow"),
        "alloc::raw_vec::capacity_overflow",
    ),
    (("src/libcore/option.rs", "expect_failed"), "core::option::expect_failed"),
    (
        ("src/libcore/panicking.rs", "panic_bounds_check"),
        "core::panicking::panic_bounds_check",
    ),
    (("src/libcore/panicking.rs", "panic_fmt"), "core::panicking::panic_fmt"),
    (("src/libcore/panicking.rs", "panic"), "core::panicking::panic"),
    (
        ("src/libcore/slice/mod.rs", "slice_index_order_fail"),
        "core::slice::slice_index_order_fail",
    ),
    (
        ("src/libstd/panicking.rs", "begin_panic_fmt"),
        "std::panicking::begin_panic_fmt",
    ),
    (
        ("src/libstd/panicking.rs", "continue_panic_fmt"),
        "std::panicking::continue_panic_fmt",
    ),
    (
        ("src/libstd/panicking.rs", "rust_panic_with_hook"),
        "std::panicking::rust_panic_with_hook",
    ),
];

/// Fixes the function name for panic symbols generated by Rust 1.34, so
/// things like "panic" become "core::panicking::panic".
fn fix_missing_module(frame: &mut Frame) {
    let file = match frame.file.as_deref().and_then(parse_source_file) {
        Some(file) => file,
        None => return,
    };
    let function = match frame.function.as_deref() {
        Some(function) => function,
        None => return,
    };
    for ((fixed_file, fixed_function), replacement) in FILE_FUNCTION_TO_FUNCTION {
        if *fixed_file == file && *fixed_function == function {
            frame.function = Some(replacement.to_string());
            return;
        }
    }
}

/// Generates a signature based on stack frames.
///
/// For Java crashes this generates a basic signature from the exception
/// text. For C/C++/Rust crashes it normalizes the crashing thread's frames
/// and walks them against the signature lists, also recording the
/// proto signature (the complete normalized frame list).
pub struct SignatureGenerationRule {
    java_signature_tool: JavaSignatureTool,
    c_signature_tool: CSignatureTool,
    // SignatureRunWatchDog regenerates from a fixed thread instead of the
    // crashing one.
    crashing_thread_override: Option<usize>,
}

impl SignatureGenerationRule {
    pub fn new(siglists: Arc<SignatureLists>) -> SignatureGenerationRule {
        SignatureGenerationRule {
            java_signature_tool: JavaSignatureTool::new(),
            c_signature_tool: CSignatureTool::new(siglists),
            crashing_thread_override: None,
        }
    }

    fn with_crashing_thread_override(
        siglists: Arc<SignatureLists>,
        crashing_thread: usize,
    ) -> SignatureGenerationRule {
        SignatureGenerationRule {
            crashing_thread_override: Some(crashing_thread),
            ..SignatureGenerationRule::new(siglists)
        }
    }

    fn create_frame_list(
        &self,
        frames: &[Frame],
        make_modules_lower_case: bool,
    ) -> Vec<String> {
        frames
            .iter()
            .take(MAXIMUM_FRAMES_TO_CONSIDER)
            .map(|frame| {
                let mut frame = frame.clone();
                fix_missing_module(&mut frame);
                if make_modules_lower_case {
                    if let Some(module) = frame.module.take() {
                        frame.module = Some(module.to_lowercase());
                    }
                }
                self.c_signature_tool.normalize_frame(&frame)
            })
            .collect()
    }

    fn crashing_thread(&self, crash_data: &CrashData) -> usize {
        if let Some(crashing_thread) = self.crashing_thread_override {
            return crashing_thread;
        }
        crash_data.crashing_thread.unwrap_or(0)
    }

    // Shared by this rule and SignatureRunWatchDog, which reuses the whole
    // generation path under its own rule name.
    fn generate_signature(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
        rule_name: &'static str,
    ) {
        // If this is a Java crash, then generate a Java signature
        if let Some(java_stack_trace) =
            crash_data.java_stack_trace.as_deref().filter(|t| !t.is_empty())
        {
            result.debug(rule_name, "using JavaSignatureTool");
            let output = self.java_signature_tool.generate(java_stack_trace, ": ");
            for note in output.notes {
                result.info(rule_name, note);
            }
            for note in output.debug_notes {
                result.debug(rule_name, note);
            }
            if !output.signature.is_empty() {
                result.set_signature(rule_name, output.signature);
            }
            return;
        }

        result.debug(rule_name, "using CSignatureTool");

        // If it's a chrome hang, look at thread 0; otherwise use the
        // crashing thread specified in the crash data.
        let crashing_thread = if crash_data.hang_type == Some(1) {
            0
        } else {
            self.crashing_thread(crash_data)
        };

        let signature_list = match crash_data.threads.get(crashing_thread) {
            Some(thread) => self.create_frame_list(
                &thread.frames,
                crash_data.os.as_deref() == Some("Windows NT"),
            ),
            None => Vec::new(),
        };

        let output = self.c_signature_tool.generate(
            &signature_list,
            crash_data.hang_type.unwrap_or(0),
            crash_data.crashing_thread,
            " | ",
        );

        if !signature_list.is_empty() {
            result.proto_signature = Some(signature_list.join(" | "));
        }
        for note in output.notes {
            result.info(rule_name, note);
        }
        for note in output.debug_notes {
            result.debug(rule_name, note);
        }
        if !output.signature.is_empty() {
            result.set_signature(rule_name, output.signature);
        }
    }
}

impl Rule for SignatureGenerationRule {
    fn name(&self) -> &'static str {
        "SignatureGenerationRule"
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        self.generate_signature(crash_data, result, self.name());
        Ok(())
    }
}

/// Appends the minidump stackwalker's error to `EMPTY` signatures.
pub struct StackwalkerErrorSignatureRule;

impl Rule for StackwalkerErrorSignatureRule {
    fn name(&self) -> &'static str {
        "StackwalkerErrorSignatureRule"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(result.signature.starts_with("EMPTY") && is_set(&crash_data.mdsw_status_string))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let status = crash_data.mdsw_status_string.as_deref().unwrap_or("");
        let signature = format!("{}; {}", result.signature, status);
        result.set_signature(self.name(), signature);
        Ok(())
    }
}

const OOM_SMALL_MAX_SIZE: u64 = 262144; // 256K

// Allocator entry points whose presence in a signature marks an OOM crash
// even without an allocation size annotation.
const OOM_SIGNATURE_FRAGMENTS: &[&str] = &[
    "NS_ABORT_OOM",
    "mozalloc_handle_oom",
    "CrashAtUnhandlableOOM",
    "AutoEnterOOMUnsafeRegion",
    "alloc::oom::oom",
];

/// Prepends `OOM | <size class>` to signatures for OOM crashes.
pub struct OOMSignature;

impl Rule for OOMSignature {
    fn name(&self) -> &'static str {
        "OOMSignature"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        if is_set(&crash_data.oom_allocation_size) {
            return Ok(true);
        }
        if result.signature.is_empty() {
            return Ok(false);
        }
        Ok(OOM_SIGNATURE_FRAGMENTS
            .iter()
            .any(|fragment| result.signature.contains(fragment)))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let size = match crash_data.oom_allocation_size.as_deref() {
            None => {
                let signature = format!("OOM | unknown | {}", result.signature);
                result.set_signature(self.name(), signature);
                return Ok(());
            }
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                RuleError::new(format!("invalid oom_allocation_size: {:?}", raw))
            })?,
        };

        if size <= OOM_SMALL_MAX_SIZE {
            result.set_signature(self.name(), "OOM | small");
        } else {
            let signature = format!("OOM | large | {}", result.signature);
            result.set_signature(self.name(), signature);
        }
        Ok(())
    }
}

/// Prepends the abort message to the signature.
pub struct AbortSignature;

impl Rule for AbortSignature {
    fn name(&self) -> &'static str {
        "AbortSignature"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(is_set(&crash_data.abort_message))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let raw = match crash_data.abort_message.as_deref() {
            Some(message) => message,
            None => return Ok(()),
        };

        if raw.contains("###!!! ABORT: file ") {
            // An abort message with no interesting information; just put the
            // "Abort" marker in the signature.
            let signature = format!("Abort | {}", result.signature);
            result.set_signature(self.name(), signature);
            return Ok(());
        }

        // Recent crash reports put some irrelevant information at the
        // beginning of the abort message; drop it and keep the actual
        // message.
        let mut abort_message = match raw.find("###!!! ABORT:") {
            Some(index) => &raw[index + "###!!! ABORT:".len()..],
            None => raw,
        };

        // Abort messages contain a file name and a line number, which are
        // very likely to change between builds.
        if let Some(index) = abort_message.find(": file ") {
            abort_message = &abort_message[..index];
        }

        let mut abort_message = abort_message.to_string();
        if abort_message.contains("unable to find a usable font") {
            // These messages include a parenthesized localized message;
            // remove it.
            if let (Some(open_paren), Some(end_paren)) =
                (abort_message.find('('), abort_message.rfind(')'))
            {
                if end_paren > open_paren {
                    abort_message = format!(
                        "{}{}",
                        &abort_message[..open_paren],
                        &abort_message[end_paren + 1..]
                    );
                }
            }
        }

        let mut abort_message = drop_bad_characters(&abort_message).trim().to_string();

        if abort_message.len() > 80 {
            abort_message = format!("{}...", &abort_message[..77]);
        }

        let signature = format!("Abort | {} | {}", abort_message, result.signature);
        result.set_signature(self.name(), signature);
        Ok(())
    }
}

/// Replaces the signature with the AsyncShutdownTimeout annotation.
pub struct SignatureShutdownTimeout;

fn parse_shutdown_data(raw: &str) -> Result<(String, Vec<String>), String> {
    let shutdown_data: Value =
        serde_json::from_str(raw).map_err(|error| error.to_string())?;
    let phase = shutdown_data
        .get("phase")
        .and_then(Value::as_str)
        .ok_or_else(|| "'phase'".to_string())?
        .to_string();
    let raw_conditions = shutdown_data
        .get("conditions")
        .and_then(Value::as_array)
        .ok_or_else(|| "'conditions'".to_string())?;

    // A condition is either a bare name or an object with a "name" in it.
    let mut conditions = Vec::new();
    for condition in raw_conditions {
        match condition {
            Value::String(name) => conditions.push(name.clone()),
            Value::Object(map) => match map.get("name").and_then(Value::as_str) {
                Some(name) => conditions.push(name.to_string()),
                None => return Err("'name'".to_string()),
            },
            _ => return Err("malformed condition".to_string()),
        }
    }
    Ok((phase, conditions))
}

impl Rule for SignatureShutdownTimeout {
    fn name(&self) -> &'static str {
        "SignatureShutdownTimeout"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(is_set(&crash_data.async_shutdown_timeout))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let raw = crash_data.async_shutdown_timeout.as_deref().unwrap_or("");
        let mut parts = vec!["AsyncShutdownTimeout".to_string()];

        match parse_shutdown_data(raw) {
            Ok((phase, mut conditions)) => {
                parts.push(phase);
                if conditions.is_empty() {
                    parts.push("(none)".to_string());
                } else {
                    conditions.sort();
                    parts.push(conditions.join(","));
                }
            }
            Err(error) => {
                parts.push("UNKNOWN".to_string());
                result.info(
                    self.name(),
                    format!("Error parsing AsyncShutdownTimeout: {}", error),
                );
            }
        }

        let new_signature = parts.join(" | ");
        result.info(
            self.name(),
            format!(
                "Signature replaced with a Shutdown Timeout signature, was: \"{}\"",
                result.signature
            ),
        );
        result.set_signature(self.name(), new_signature);
        Ok(())
    }
}

/// Prepends `shutdownhang` to the signature for shutdown hang crashes.
///
/// Those crashes happen artificially when thread 0 gets stuck, so whatever
/// the crashing thread was, the interesting stack is thread 0's.
pub struct SignatureRunWatchDog {
    inner: SignatureGenerationRule,
}

impl SignatureRunWatchDog {
    pub fn new(siglists: Arc<SignatureLists>) -> SignatureRunWatchDog {
        SignatureRunWatchDog {
            inner: SignatureGenerationRule::with_crashing_thread_override(siglists, 0),
        }
    }
}

impl Rule for SignatureRunWatchDog {
    fn name(&self) -> &'static str {
        "SignatureRunWatchDog"
    }

    fn predicate(
        &self,
        _crash_data: &CrashData,
        result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(result.signature.contains("RunWatchdog"))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        self.inner.generate_signature(crash_data, result, self.name());
        let signature = format!("shutdownhang | {}", result.signature);
        result.set_signature(self.name(), signature);
        Ok(())
    }
}

/// Either stomps on or prepends the signature for IPC channel errors.
///
/// A ShutDownKill prepends `IPCError-browser | ShutDownKill`; any other
/// error replaces the signature outright.
pub struct SignatureIPCChannelError;

impl Rule for SignatureIPCChannelError {
    fn name(&self) -> &'static str {
        "SignatureIPCChannelError"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(is_set(&crash_data.ipc_channel_error))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let ipc_channel_error = crash_data.ipc_channel_error.as_deref().unwrap_or("");
        let process_kind = if crash_data.additional_minidumps.as_deref() == Some("browser") {
            "IPCError-browser"
        } else {
            "IPCError-content"
        };
        let truncated: String = ipc_channel_error.chars().take(100).collect();
        let mut new_signature = format!("{} | {}", process_kind, truncated);

        if ipc_channel_error == "ShutDownKill" {
            // If it's a ShutDownKill, append the rest of the signature
            result.info(self.name(), "IPC Channel Error prepended");
            new_signature = format!("{} | {}", new_signature, result.signature);
        } else {
            result.info(self.name(), "IPC Channel Error stomped on signature");
        }

        result.set_signature(self.name(), new_signature);
        Ok(())
    }
}

/// Appends the IPC message name to the signature.
pub struct SignatureIPCMessageName;

impl Rule for SignatureIPCMessageName {
    fn name(&self) -> &'static str {
        "SignatureIPCMessageName"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(is_set(&crash_data.ipc_message_name))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let ipc_message_name = crash_data.ipc_message_name.as_deref().unwrap_or("");
        let signature = format!(
            "{} | IPC_Message_Name={}",
            result.signature, ipc_message_name
        );
        result.set_signature(self.name(), signature);
        Ok(())
    }
}

/// Stomps on the signature when the parent and child build ids differ.
///
/// When that assertion fails, symbolification goes sideways and the
/// signatures end up as junk, so they all get bucketed together instead.
pub struct SignatureParentIDNotEqualsChildID;

impl Rule for SignatureParentIDNotEqualsChildID {
    fn name(&self) -> &'static str {
        "SignatureParentIDNotEqualsChildID"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(crash_data.moz_crash_reason.as_deref()
            == Some("MOZ_RELEASE_ASSERT(parentBuildID == childBuildID)"))
    }

    fn action(
        &self,
        _crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        result.info(
            self.name(),
            format!(
                "Signature replaced with MOZ_RELEASE_ASSERT, was: \"{}\"",
                result.signature
            ),
        );
        // The MozCrashReason lists the assertion that failed, so we put "!="
        // in the signature
        result.set_signature(self.name(), "parentBuildID != childBuildID");
        Ok(())
    }
}

/// Replaces the signature with the JIT crash classification.
pub struct SignatureJitCategory;

impl Rule for SignatureJitCategory {
    fn name(&self) -> &'static str {
        "SignatureJitCategory"
    }

    fn predicate(
        &self,
        crash_data: &CrashData,
        _result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(is_set(&crash_data.jit_category))
    }

    fn action(
        &self,
        crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        result.info(
            self.name(),
            format!(
                "Signature replaced with a JIT Crash Category, was: \"{}\"",
                result.signature
            ),
        );
        let jit_category = crash_data.jit_category.as_deref().unwrap_or("");
        result.set_signature(self.name(), format!("jit | {}", jit_category));
        Ok(())
    }
}

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s").unwrap());
static CONSECUTIVE_WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s\s+").unwrap());

/// Fixes whitespace in the signature: trims it, converts non-space
/// whitespace to spaces, and squashes runs of spaces. This is what
/// guarantees signatures stay a single line.
pub struct SigFixWhitespace;

impl Rule for SigFixWhitespace {
    fn name(&self) -> &'static str {
        "SigFixWhitespace"
    }

    fn action(
        &self,
        _crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let original = result.signature.clone();

        let trimmed = original.trim();
        let spaced = WHITESPACE_RE.replace_all(trimmed, " ");
        let squashed = CONSECUTIVE_WHITESPACE_RE.replace_all(&spaced, " ");

        if squashed != original.as_str() {
            let signature = squashed.into_owned();
            result.set_signature(self.name(), signature);
        }
        Ok(())
    }
}

/// Truncates signatures down to [`SIGNATURE_MAX_LENGTH`] characters.
pub struct SigTruncate;

impl Rule for SigTruncate {
    fn name(&self) -> &'static str {
        "SigTruncate"
    }

    fn predicate(
        &self,
        _crash_data: &CrashData,
        result: &SignatureResult,
    ) -> Result<bool, RuleError> {
        Ok(result.signature.chars().count() > SIGNATURE_MAX_LENGTH)
    }

    fn action(
        &self,
        _crash_data: &CrashData,
        result: &mut SignatureResult,
    ) -> Result<(), RuleError> {
        let truncated: String = result
            .signature
            .chars()
            .take(SIGNATURE_MAX_LENGTH - 3)
            .collect();
        result.set_signature(self.name(), format!("{}...", truncated));
        result.info(self.name(), "SigTrunc: signature truncated due to length");
        Ok(())
    }
}
