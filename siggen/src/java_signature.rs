//! Signature generation for Java exception stack traces.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::c_signature::ToolOutput;
use crate::utils::join_ignore_empty;

/// The max length of a generated Java signature--if it's longer than this,
/// the exception description gets dropped.
pub const DESCRIPTION_MAX_LENGTH: usize = 255;

// Source line numbers in stack frame lines, e.g. "(GeckoApp.java:1492)".
static JAVA_LINE_NUMBER_KILLER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.java:\d+\)$").unwrap());
// Instance addresses in exception descriptions, e.g. "@4054b560".
static JAVA_HEX_ADDR_KILLER: Lazy<Regex> = Lazy::new(|| Regex::new(r"@[0-9a-f]{8}").unwrap());

/// Generates signatures from Java exception stack traces.
#[derive(Debug, Default)]
pub struct JavaSignatureTool;

impl JavaSignatureTool {
    pub fn new() -> JavaSignatureTool {
        JavaSignatureTool
    }

    /// Parses the first two lines of a Java stack trace into a signature.
    ///
    /// The first line is `ExceptionClass: description`, the second the top
    /// stack frame. Unusable input yields an `EMPTY:` sentinel plus a note,
    /// never an error.
    pub fn generate(&self, source: &str, delimiter: &str) -> ToolOutput {
        let source_list: Vec<&str> = source.lines().map(str::trim).collect();
        if source_list.is_empty() {
            return ToolOutput {
                signature: "EMPTY: Java stack trace not in expected format".to_string(),
                notes: vec!["JavaSignatureTool: stack trace not in expected format".to_string()],
                debug_notes: Vec::new(),
            };
        }

        let mut notes = Vec::new();

        let (java_exception_class, description) = match source_list[0].split_once(':') {
            Some((class, description)) => {
                let description = JAVA_HEX_ADDR_KILLER.replace_all(description, "@<addr>");
                (class.trim().to_string(), description.trim().to_string())
            }
            None => {
                notes.push(
                    "JavaSignatureTool: stack trace line 1 is not in the expected format"
                        .to_string(),
                );
                (source_list[0].to_string(), String::new())
            }
        };

        let java_method = match source_list.get(1) {
            Some(line) => {
                let method = JAVA_LINE_NUMBER_KILLER.replace(line, ".java)").into_owned();
                if method.is_empty() {
                    notes.push("JavaSignatureTool: stack trace line 2 is empty".to_string());
                }
                method
            }
            None => {
                notes.push("JavaSignatureTool: stack trace line 2 is missing".to_string());
                String::new()
            }
        };

        // An error in an earlier version of this code resulted in the colon
        // being left out of the division between the description and the
        // java_method if the description didn't end with "<addr>". This
        // perpetuates that error while correcting the "<addr>" placement
        // when it is not at the end of the description.
        let mut signature = if description.ends_with("<addr>") {
            join_ignore_empty(delimiter, &[&java_exception_class, &description, &java_method])
        } else {
            let description_java_method_phrase =
                join_ignore_empty(" ", &[&description, &java_method]);
            join_ignore_empty(delimiter, &[&java_exception_class, &description_java_method_phrase])
        };

        if signature.chars().count() > DESCRIPTION_MAX_LENGTH {
            signature = [java_exception_class, java_method].join(delimiter);
            notes.push(
                "JavaSignatureTool: dropped Java exception description due to length".to_string(),
            );
        }

        ToolOutput {
            signature,
            notes,
            debug_notes: Vec::new(),
        }
    }
}
