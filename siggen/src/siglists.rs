//! Loading and compiling of the signature classification lists.
//!
//! Four curated lists drive frame selection:
//!
//! * `irrelevant_signature_re` -- frames to skip when choosing the
//!   "interesting" frame
//! * `prefix_signature_re` -- frames to glue onto the front of the next
//!   interesting frame (inlined wrappers, allocators, and the like)
//! * `signature_sentinels` -- frames that, when present, become the whole
//!   signature
//! * `signatures_with_line_numbers_re` -- signatures that keep their source
//!   line for disambiguation
//!
//! The built-in lists ship inside the crate (`siglists/*.txt`); a deployment
//! can append to them with same-named files in an override directory. Lists
//! are one matcher per line, `#` lines are comments, blank lines are
//! skipped, and a `!`-prefixed line removes a previously accumulated entry.
//! Entries in the `*_re` lists are regular expressions and every line must
//! compile; `signature_sentinels` entries are exact frame strings, with
//! `frame => companion` marking a sentinel that only applies when the
//! companion frame is also on the stack.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;

const IRRELEVANT_SIGNATURE_RE: &str = "irrelevant_signature_re";
const PREFIX_SIGNATURE_RE: &str = "prefix_signature_re";
const SIGNATURES_WITH_LINE_NUMBERS_RE: &str = "signatures_with_line_numbers_re";
const SIGNATURE_SENTINELS: &str = "signature_sentinels";

const BUILTIN_IRRELEVANT: &str = include_str!("../siglists/irrelevant_signature_re.txt");
const BUILTIN_PREFIX: &str = include_str!("../siglists/prefix_signature_re.txt");
const BUILTIN_LINE_NUMBERS: &str =
    include_str!("../siglists/signatures_with_line_numbers_re.txt");
const BUILTIN_SENTINELS: &str = include_str!("../siglists/signature_sentinels.txt");

/// Errors for signature list loading.
///
/// Any of these aborts loading outright -- a partially loaded list is never
/// returned.
#[derive(Debug, thiserror::Error)]
pub enum SiglistError {
    /// A list file couldn't be read.
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A line in a list file is not a valid regular expression.
    #[error("bad regular expression in {file} at line {line}")]
    BadRegularExpressionLine {
        file: String,
        line: usize,
        #[source]
        source: Box<regex::Error>,
    },
    /// The combined alternation for a list failed to compile.
    #[error("failed to compile {name} list")]
    Compile {
        name: String,
        #[source]
        source: Box<regex::Error>,
    },
}

/// A frame that forces signature generation to stop and use it verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    /// The frame signature to look for.
    pub frame: String,
    /// A frame that must also be present for this sentinel to apply; when it
    /// is, it joins the sentinel in the generated signature.
    pub companion: Option<String>,
}

impl Sentinel {
    pub fn new(frame: impl Into<String>) -> Sentinel {
        Sentinel {
            frame: frame.into(),
            companion: None,
        }
    }

    pub fn with_companion(frame: impl Into<String>, companion: impl Into<String>) -> Sentinel {
        Sentinel {
            frame: frame.into(),
            companion: Some(companion.into()),
        }
    }

    fn parse(line: &str) -> Sentinel {
        match line.split_once(" => ") {
            Some((frame, companion)) => {
                Sentinel::with_companion(frame.trim(), companion.trim())
            }
            None => Sentinel::new(line),
        }
    }
}

/// The compiled classification lists, immutable once built.
///
/// Build one at startup (`builtin()` or `with_overrides()`), wrap it in an
/// `Arc`, and hand it to every pipeline that needs it -- concurrent readers
/// need no locking.
#[derive(Debug)]
pub struct SignatureLists {
    pub irrelevant_signature_re: Regex,
    pub prefix_signature_re: Regex,
    pub signatures_with_line_numbers_re: Regex,
    pub signature_sentinels: Vec<Sentinel>,
}

impl SignatureLists {
    /// Compiles the lists packaged with this crate.
    pub fn builtin() -> Result<SignatureLists, SiglistError> {
        ListBuilder::builtin()?.compile()
    }

    /// Compiles the packaged lists plus any same-named override files found
    /// in `dir`.
    ///
    /// Override entries are appended to the built-in ones; `!`-prefixed
    /// override lines remove a built-in entry instead.
    pub fn with_overrides(dir: &Path) -> Result<SignatureLists, SiglistError> {
        let mut builder = ListBuilder::builtin()?;
        builder.merge_dir(dir)?;
        builder.compile()
    }

    /// Compiles lists from in-memory patterns. Used by callers that curate
    /// their own lists (and heavily by tests).
    pub fn from_patterns(
        irrelevant: &[&str],
        prefix: &[&str],
        with_line_numbers: &[&str],
        sentinels: Vec<Sentinel>,
    ) -> Result<SignatureLists, SiglistError> {
        let builder = ListBuilder {
            irrelevant: irrelevant.iter().map(|s| s.to_string()).collect(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            with_line_numbers: with_line_numbers.iter().map(|s| s.to_string()).collect(),
            sentinels,
        };
        builder.compile()
    }
}

/// Reads and validates one named `*_re` list file from a directory.
///
/// Returns the accumulated patterns in file order. Fails with
/// [`SiglistError::BadRegularExpressionLine`] on the first line that doesn't
/// compile.
pub fn load_list(list_name: &str, source_dir: &Path) -> Result<Vec<String>, SiglistError> {
    let path = source_dir.join(format!("{}.txt", list_name));
    let contents = fs::read_to_string(&path).map_err(|source| SiglistError::Io {
        path: path.clone(),
        source,
    })?;
    let mut entries = Vec::new();
    parse_regex_list(&path.display().to_string(), &contents, &mut entries)?;
    Ok(entries)
}

/// Reads one named sentinel list file from a directory.
pub fn load_sentinel_list(
    list_name: &str,
    source_dir: &Path,
) -> Result<Vec<Sentinel>, SiglistError> {
    let path = source_dir.join(format!("{}.txt", list_name));
    let contents = fs::read_to_string(&path).map_err(|source| SiglistError::Io {
        path: path.clone(),
        source,
    })?;
    let mut entries = Vec::new();
    parse_sentinel_list(&contents, &mut entries);
    Ok(entries)
}

// Uncompiled list entries, accumulated from the built-in files and any
// override files before the final compile.
struct ListBuilder {
    irrelevant: Vec<String>,
    prefix: Vec<String>,
    with_line_numbers: Vec<String>,
    sentinels: Vec<Sentinel>,
}

impl ListBuilder {
    fn builtin() -> Result<ListBuilder, SiglistError> {
        let mut builder = ListBuilder {
            irrelevant: Vec::new(),
            prefix: Vec::new(),
            with_line_numbers: Vec::new(),
            sentinels: Vec::new(),
        };
        parse_regex_list(
            "siglists/irrelevant_signature_re.txt",
            BUILTIN_IRRELEVANT,
            &mut builder.irrelevant,
        )?;
        parse_regex_list(
            "siglists/prefix_signature_re.txt",
            BUILTIN_PREFIX,
            &mut builder.prefix,
        )?;
        parse_regex_list(
            "siglists/signatures_with_line_numbers_re.txt",
            BUILTIN_LINE_NUMBERS,
            &mut builder.with_line_numbers,
        )?;
        parse_sentinel_list(BUILTIN_SENTINELS, &mut builder.sentinels);
        Ok(builder)
    }

    fn merge_dir(&mut self, dir: &Path) -> Result<(), SiglistError> {
        merge_regex_file(dir, IRRELEVANT_SIGNATURE_RE, &mut self.irrelevant)?;
        merge_regex_file(dir, PREFIX_SIGNATURE_RE, &mut self.prefix)?;
        merge_regex_file(dir, SIGNATURES_WITH_LINE_NUMBERS_RE, &mut self.with_line_numbers)?;

        let path = dir.join(format!("{}.txt", SIGNATURE_SENTINELS));
        if path.is_file() {
            let contents = fs::read_to_string(&path).map_err(|source| SiglistError::Io {
                path: path.clone(),
                source,
            })?;
            parse_sentinel_list(&contents, &mut self.sentinels);
        } else {
            debug!("no {} override in {}", SIGNATURE_SENTINELS, dir.display());
        }
        Ok(())
    }

    fn compile(self) -> Result<SignatureLists, SiglistError> {
        Ok(SignatureLists {
            irrelevant_signature_re: compile_alternation(
                IRRELEVANT_SIGNATURE_RE,
                &self.irrelevant,
            )?,
            prefix_signature_re: compile_alternation(PREFIX_SIGNATURE_RE, &self.prefix)?,
            signatures_with_line_numbers_re: compile_alternation(
                SIGNATURES_WITH_LINE_NUMBERS_RE,
                &self.with_line_numbers,
            )?,
            signature_sentinels: self.sentinels,
        })
    }
}

fn merge_regex_file(
    dir: &Path,
    name: &str,
    entries: &mut Vec<String>,
) -> Result<(), SiglistError> {
    let path = dir.join(format!("{}.txt", name));
    if !path.is_file() {
        debug!("no {} override in {}", name, dir.display());
        return Ok(());
    }
    let contents = fs::read_to_string(&path).map_err(|source| SiglistError::Io {
        path: path.clone(),
        source,
    })?;
    parse_regex_list(&path.display().to_string(), &contents, entries)
}

fn parse_regex_list(
    file: &str,
    contents: &str,
    entries: &mut Vec<String>,
) -> Result<(), SiglistError> {
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(removed) = line.strip_prefix('!') {
            let removed = removed.trim();
            entries.retain(|entry| entry != removed);
            continue;
        }
        if let Err(source) = Regex::new(line) {
            return Err(SiglistError::BadRegularExpressionLine {
                file: file.to_string(),
                line: index + 1,
                source: Box::new(source),
            });
        }
        entries.push(line.to_string());
    }
    Ok(())
}

fn parse_sentinel_list(contents: &str, entries: &mut Vec<Sentinel>) {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(removed) = line.strip_prefix('!') {
            let removed = removed.trim();
            entries.retain(|entry| entry.frame != removed);
            continue;
        }
        entries.push(Sentinel::parse(line));
    }
}

// The lists are combined into a single alternation, anchored at the start of
// the frame signature (the walk asks "does this frame start with any of
// these", not "does any of these appear somewhere").
fn compile_alternation(name: &str, patterns: &[String]) -> Result<Regex, SiglistError> {
    let combined = if patterns.is_empty() {
        // An empty list matches nothing.
        r"^[^\s\S]".to_string()
    } else {
        let alternatives = patterns
            .iter()
            .map(|pattern| format!("(?:{})", pattern))
            .collect::<Vec<String>>()
            .join("|");
        format!("^(?:{})", alternatives)
    };
    Regex::new(&combined).map_err(|source| SiglistError::Compile {
        name: name.to_string(),
        source: Box::new(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Tests that need real files write them under target/, like the
    // stackwalker's CLI tests do.
    fn test_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../target/testdata")
            .join(name);
        let _ = fs::create_dir_all(&dir);
        dir
    }

    #[test]
    fn test_builtin_lists_compile() {
        let lists = SignatureLists::builtin().unwrap();
        assert!(lists.irrelevant_signature_re.is_match("NtWaitForMultipleObjects"));
        assert!(lists.irrelevant_signature_re.is_match("@0x5e39bf21"));
        assert!(lists.prefix_signature_re.is_match("malloc"));
        assert!(lists.prefix_signature_re.is_match("MsgWaitForMultipleObjects"));
        assert!(lists.signatures_with_line_numbers_re.is_match("js_Interpret"));
        assert!(lists
            .signature_sentinels
            .iter()
            .any(|sentinel| sentinel.frame == "_purecall"));
        // The RPCChannel sentinel carries its companion frame.
        let rpc = lists
            .signature_sentinels
            .iter()
            .find(|sentinel| sentinel.frame.starts_with("mozilla::ipc::RPCChannel::Call"))
            .unwrap();
        assert!(rpc.companion.as_ref().unwrap().starts_with("CrashReporter::"));
    }

    #[test]
    fn test_anchoring() {
        let lists =
            SignatureLists::from_patterns(&["ignored1"], &["pre1", "pre2"], &[], vec![]).unwrap();
        // Matches are anchored at the start of the frame...
        assert!(lists.irrelevant_signature_re.is_match("ignored1"));
        assert!(lists.irrelevant_signature_re.is_match("ignored1andmore"));
        // ...so mid-string occurrences don't count.
        assert!(!lists.irrelevant_signature_re.is_match("xignored1"));
        assert!(lists.prefix_signature_re.is_match("pre2"));
    }

    #[test]
    fn test_empty_list_matches_nothing() {
        let lists = SignatureLists::from_patterns(&[], &[], &[], vec![]).unwrap();
        assert!(!lists.irrelevant_signature_re.is_match(""));
        assert!(!lists.irrelevant_signature_re.is_match("anything"));
    }

    #[test]
    fn test_comments_blanks_and_removals() {
        let mut entries = Vec::new();
        parse_regex_list(
            "test.txt",
            "# header comment\n\nfoo\nbar\n\n!foo\nbaz\n",
            &mut entries,
        )
        .unwrap();
        assert_eq!(entries, vec!["bar".to_string(), "baz".to_string()]);
    }

    #[test]
    fn test_bad_regex_line() {
        let mut entries = Vec::new();
        let err = parse_regex_list(
            "irrelevant_signature_re.txt",
            "# comment\ngood_pattern\n(unbalanced\n",
            &mut entries,
        )
        .unwrap_err();
        match err {
            SiglistError::BadRegularExpressionLine { file, line, .. } => {
                assert_eq!(file, "irrelevant_signature_re.txt");
                assert_eq!(line, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_load_list_from_dir() {
        let dir = test_dir("siglists-load");
        let mut file = fs::File::create(dir.join("irrelevant_signature_re.txt")).unwrap();
        writeln!(file, "# deployment additions").unwrap();
        writeln!(file, "my_deployment_frame.*").unwrap();
        drop(file);

        let entries = load_list("irrelevant_signature_re", &dir).unwrap();
        assert_eq!(entries, vec!["my_deployment_frame.*".to_string()]);
    }

    #[test]
    fn test_load_list_missing_file() {
        let dir = test_dir("siglists-missing");
        let err = load_list("irrelevant_signature_re", &dir.join("nope")).unwrap_err();
        assert!(matches!(err, SiglistError::Io { .. }));
    }

    #[test]
    fn test_overrides_append_and_remove() {
        let dir = test_dir("siglists-overrides");
        let mut file = fs::File::create(dir.join("irrelevant_signature_re.txt")).unwrap();
        writeln!(file, "my_deployment_frame.*").unwrap();
        writeln!(file, "!zero").unwrap();
        drop(file);
        let mut file = fs::File::create(dir.join("signature_sentinels.txt")).unwrap();
        writeln!(file, "my_sentinel => my_companion").unwrap();
        drop(file);

        let lists = SignatureLists::with_overrides(&dir).unwrap();
        // Appended after the built-ins.
        assert!(lists.irrelevant_signature_re.is_match("my_deployment_frame_here"));
        // Built-ins are still there.
        assert!(lists.irrelevant_signature_re.is_match("KiFastSystemCallRet"));
        // The removal marker dropped the "zero" entry.
        assert!(!lists.irrelevant_signature_re.is_match("zero"));
        let added = lists
            .signature_sentinels
            .iter()
            .find(|sentinel| sentinel.frame == "my_sentinel")
            .unwrap();
        assert_eq!(added.companion.as_deref(), Some("my_companion"));
    }

    #[test]
    fn test_bad_override_aborts_load() {
        let dir = test_dir("siglists-bad-override");
        let mut file = fs::File::create(dir.join("prefix_signature_re.txt")).unwrap();
        writeln!(file, "fine_pattern").unwrap();
        writeln!(file, "(oops").unwrap();
        drop(file);

        let err = SignatureLists::with_overrides(&dir).unwrap_err();
        match err {
            SiglistError::BadRegularExpressionLine { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
