//! Signature generation for C/C++/Rust stacks.
//!
//! [`CSignatureTool`] normalizes the frames of the crashing thread and walks
//! them against the classification lists to pick the frames that make up
//! the signature.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::crash_data::Frame;
use crate::siglists::SignatureLists;
use crate::utils::{
    collapse, drop_prefix_and_return_type, generify_hex_addresses, parse_source_file,
};

/// Signatures longer than this get truncated by the truncation rule.
pub const SIGNATURE_MAX_LENGTH: usize = 255;

/// Only this many frames of the crashing thread are ever considered.
pub const MAXIMUM_FRAMES_TO_CONSIDER: usize = 40;

// Remove spaces before all stars, ampersands, and commas.
static FIXUP_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r" ([\*&,])").unwrap());
// Ensure a space after commas.
static FIXUP_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",([^ ])").unwrap());
// Rust-generated uniqueness hashes, e.g. "::h7f635057bfba806a".
static FIXUP_HASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"::h[0-9a-fA-F]+$").unwrap());
// Compiler-assigned lambda numbers.
static FIXUP_LAMBDA_NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"::\$_\d+::").unwrap());

/// Output of one signature tool run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub signature: String,
    /// Diagnostics worth surfacing to whoever reads the crash report.
    pub notes: Vec<String>,
    /// Step-by-step trace of how the signature was derived.
    pub debug_notes: Vec<String>,
}

/// Generates signatures from C/C++/Rust stacks.
///
/// Holds a shared reference to the classification lists; construct once and
/// reuse across crash reports.
#[derive(Debug)]
pub struct CSignatureTool {
    siglists: Arc<SignatureLists>,
    collapse_arguments: bool,
}

impl CSignatureTool {
    pub fn new(siglists: Arc<SignatureLists>) -> CSignatureTool {
        CSignatureTool {
            siglists,
            collapse_arguments: true,
        }
    }

    /// Normalizes a single Rust frame with a function.
    pub fn normalize_rust_function(&self, function: &str, line: Option<u32>) -> String {
        // Drop the prefix and return type if there is any
        let mut function = drop_prefix_and_return_type(function);

        // Collapse types
        function = collapse(&function, '<', '>', "<T>", &[" as "]);

        // Collapse arguments
        if self.collapse_arguments {
            function = collapse(&function, '(', ')', "", &[]);
        }

        if self.siglists.signatures_with_line_numbers_re.is_match(&function) {
            if let Some(line) = line {
                function = format!("{}:{}", function, line);
            }
        }

        function = FIXUP_SPACE.replace_all(&function, "$1").into_owned();
        function = FIXUP_COMMA.replace_all(&function, ", $1").into_owned();

        // Remove rust-generated uniqueness hashes
        function = FIXUP_HASH.replace(&function, "").into_owned();

        generify_hex_addresses(&function)
    }

    /// Normalizes a single C/C++ frame with a function.
    pub fn normalize_cpp_function(&self, function: &str, line: Option<u32>) -> String {
        let mut function = function.to_string();

        // Drop member function cv/ref qualifiers like const, const&, &, and &&
        for qualifier in &["const", "const&", "&&", "&"] {
            if function.ends_with(qualifier) {
                function.truncate(function.len() - qualifier.len());
                function = function.trim().to_string();
            }
        }

        // Drop the prefix and return type if there is any, unless this is
        // operator overloading--that syntax doesn't have the things we're
        // dropping here and can look curious
        if !function.contains("::operator") {
            function = drop_prefix_and_return_type(&function);
        }

        // Normalize `anonymous namespace' to (anonymous namespace)
        function = function.replace("`anonymous namespace'", "(anonymous namespace)");

        // Remove lambda numbers
        function = FIXUP_LAMBDA_NUMBERS.replace_all(&function, "::$$::").into_owned();

        // Collapse types. The " in " exception handles "<unknown in foobar.dll>".
        function = collapse(
            &function,
            '<',
            '>',
            "<T>",
            &["name omitted", "IPC::ParamTraits", " in "],
        );

        // Collapse arguments
        if self.collapse_arguments {
            function = collapse(&function, '(', ')', "", &["anonymous namespace", "operator"]);
        }

        // Remove PGO cold block labels like "[clone .cold.222]"
        if function.contains("clone .cold") {
            function = collapse(&function, '[', ']', "", &[]);
        }

        if self.siglists.signatures_with_line_numbers_re.is_match(&function) {
            if let Some(line) = line {
                function = format!("{}:{}", function, line);
            }
        }

        function = FIXUP_SPACE.replace_all(&function, "$1").into_owned();
        function = FIXUP_COMMA.replace_all(&function, ", $1").into_owned();

        generify_hex_addresses(&function)
    }

    /// Normalizes a single frame into its signature fragment.
    ///
    /// Prefers the function name; falls back to `file#line`, then the
    /// unloaded-module info, then the raw instruction offset, then
    /// `module@module_offset`.
    pub fn normalize_frame(&self, frame: &Frame) -> String {
        let fragment = self.normalize_frame_inner(frame);
        // The fragment must not contain the join separator.
        if fragment.contains('|') {
            fragment.replace('|', "")
        } else {
            fragment
        }
    }

    fn normalize_frame_inner(&self, frame: &Frame) -> String {
        if let Some(function) = frame.function.as_deref().filter(|f| !f.is_empty()) {
            // If there's a filename and it ends in .rs, normalize using Rust
            // rules, otherwise use the C/C++ rules.
            let is_rust = frame
                .file
                .as_deref()
                .and_then(parse_source_file)
                .map_or(false, |file| file.ends_with(".rs"));
            if is_rust {
                return self.normalize_rust_function(function, frame.line);
            }
            return self.normalize_cpp_function(function, frame.line);
        }

        // If there's a file and line number, use that
        if let (Some(file), Some(line)) = (
            frame.file.as_deref().filter(|f| !f.is_empty()),
            frame.line,
        ) {
            let filename = file.trim_end_matches(|c| c == '/' || c == '\\');
            let basename = if filename.contains('\\') {
                filename.rsplit('\\').next().unwrap_or(filename)
            } else {
                filename.rsplit('/').next().unwrap_or(filename)
            };
            return format!("{}#{}", basename, line);
        }

        // If an unloaded module covers the address, use it
        if let Some(unloaded) = frame.unloaded_modules.first() {
            let module = unloaded.module.as_deref().unwrap_or("");
            let offset = unloaded.offsets.first().map(String::as_str).unwrap_or("");
            return format!("(unloaded {}@{})", module, offset);
        }

        // If there's an offset and no module/module_offset, use that
        let module = frame.module.as_deref().filter(|m| !m.is_empty());
        let module_offset = frame.module_offset.as_deref().filter(|o| !o.is_empty());
        if module.is_none() && module_offset.is_none() {
            if let Some(offset) = frame.offset.as_deref().filter(|o| !o.is_empty()) {
                return format!("@{}", offset);
            }
        }

        format!("{}@{}", module.unwrap_or(""), module_offset.unwrap_or(""))
    }

    /// Iterates over the normalized frames of the crash stack and generates
    /// a signature.
    ///
    /// A sentinel frame, if present and not itself irrelevant, becomes the
    /// whole signature (joined with its companion frame when it has one).
    /// Otherwise each frame is handled like this:
    ///
    /// * irrelevant: skip it
    /// * a prefix of a relevant frame: append it and keep looking
    /// * a relevant frame: append it and stop
    ///
    /// The signature is the delimiter-joined list of selected frames.
    pub fn generate(
        &self,
        source_list: &[String],
        hang_type: i64,
        crashed_thread: Option<usize>,
        delimiter: &str,
    ) -> ToolOutput {
        let mut notes = Vec::new();
        let mut debug_notes = Vec::new();
        let mut new_signature_list: Vec<String> = Vec::new();

        // Find the earliest applicable sentinel.
        let mut sentinel_hit: Option<(usize, &crate::siglists::Sentinel)> = None;
        for sentinel in &self.siglists.signature_sentinels {
            if let Some(companion) = &sentinel.companion {
                if !source_list.iter().any(|frame| frame == companion) {
                    continue;
                }
            }
            if let Some(index) = source_list.iter().position(|frame| frame == &sentinel.frame) {
                if sentinel_hit.map_or(true, |(best, _)| index < best) {
                    sentinel_hit = Some((index, sentinel));
                }
            }
        }

        let mut walk_list = source_list;
        let mut hard_stop = false;
        if let Some((index, sentinel)) = sentinel_hit {
            debug_notes.push(format!(
                "sentinel; starting at \"{}\" index {}",
                source_list[index], index
            ));
            walk_list = &source_list[index..];
            // An irrelevant sentinel doesn't become the signature; the walk
            // just restarts at it.
            if !self.siglists.irrelevant_signature_re.is_match(&sentinel.frame) {
                new_signature_list.push(sentinel.frame.clone());
                if let Some(companion) = &sentinel.companion {
                    new_signature_list.push(companion.clone());
                }
                hard_stop = true;
            }
        }

        if !hard_stop {
            for a_signature in walk_list {
                // If the signature matches the irrelevant signatures regex,
                // skip to the next frame.
                if self.siglists.irrelevant_signature_re.is_match(a_signature) {
                    debug_notes.push(format!("irrelevant; ignoring: \"{}\"", a_signature));
                    continue;
                }

                // If the frame signature is a dll, remove the @xxxxx part.
                let mut a_signature = a_signature.as_str();
                if a_signature.to_lowercase().contains(".dll") {
                    a_signature = a_signature.split('@').next().unwrap_or(a_signature);

                    // If this trimmed DLL signature is the same as the
                    // previous frame's, skip it.
                    if new_signature_list.last().map(String::as_str) == Some(a_signature) {
                        continue;
                    }
                }

                new_signature_list.push(a_signature.to_string());

                // If the signature does not match the prefix signatures
                // regex, then it is the last one we add to the list.
                if !self.siglists.prefix_signature_re.is_match(a_signature) {
                    debug_notes.push(format!("not a prefix; stop: \"{}\"", a_signature));
                    break;
                }

                debug_notes.push(format!("prefix; continue iterating: \"{}\"", a_signature));
            }
        }

        // Add a special marker for hang crash reports.
        let hang_prefix = match hang_type {
            -1 => Some("hang"),
            1 => Some("chromehang"),
            _ => None,
        };
        if let Some(hang_prefix) = hang_prefix {
            debug_notes.push(format!("hang_type {}: prepending {}", hang_type, hang_prefix));
            new_signature_list.insert(0, hang_prefix.to_string());
        }

        let mut signature = new_signature_list.join(delimiter);

        // Handle empty signatures to explain why we failed generating them.
        if signature.is_empty() {
            match crashed_thread {
                None => {
                    notes.push(
                        "CSignatureTool: No signature could be created because we do not know \
                         which thread crashed"
                            .to_string(),
                    );
                    signature = "EMPTY: no crashing thread identified".to_string();
                }
                Some(crashed_thread) => {
                    notes.push(format!(
                        "CSignatureTool: No proper signature could be created because no good \
                         data for the crashing thread ({}) was found",
                        crashed_thread
                    ));
                    signature = match source_list.first() {
                        Some(first) => first.clone(),
                        None => "EMPTY: no frame data available".to_string(),
                    };
                }
            }
        }

        ToolOutput {
            signature,
            notes,
            debug_notes,
        }
    }
}
