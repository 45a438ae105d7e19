//! String surgery shared by the signature normalizers.

use once_cell::sync::Lazy;
use regex::Regex;

static HEX_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"0[xX][0-9a-fA-F]+").unwrap());

/// Drops all non-ascii and non-printable characters from `text`.
///
/// Spaces survive; all other whitespace (tabs, newlines, carriage returns)
/// does not.
pub fn drop_bad_characters(text: &str) -> String {
    text.chars().filter(|c| (' '..='~').contains(c)).collect()
}

/// Rewrites hex addresses to a fixed `@0x0` placeholder.
///
/// Matches addresses of any digit length, case-insensitively, so signatures
/// don't vary with whatever address the crash happened to land on.
pub fn generify_hex_addresses(text: &str) -> String {
    HEX_ADDRESS_RE.replace_all(text, "@0x0").into_owned()
}

/// Extracts the file path from a stackwalker source file value.
///
/// Source files come in VCS form (`hg:hg.mozilla.org/repo:path:revision`,
/// `git:github.com/org/repo:path:revision`), Windows drive form
/// (`f:\path\to\file.c`), or as a plain path.
pub fn parse_source_file(source_file: &str) -> Option<&str> {
    if source_file.is_empty() {
        return None;
    }
    let parts: Vec<&str> = source_file.split(':').collect();
    match parts.len() {
        4 => Some(parts[2]),
        2 => Some(parts[1]),
        _ => Some(source_file),
    }
}

fn contains_exception(token: &str, exceptions: &[&str]) -> bool {
    exceptions.iter().any(|exception| token.contains(exception))
}

/// Collapses the text between `open_string` and `close_string` in `function`
/// down to `replacement`.
///
/// Bracket regions are tracked with nesting, so `Foo<Bar<Baz>>` collapses as
/// one region. A region is left alone if it contains one of the `exceptions`
/// substrings, and a bracket is not treated as a region opener at all when
/// the text already emitted ends with one of the `exceptions` (this keeps
/// things like `IPC::ParamTraits<...>` and `operator()` intact while their
/// innards still collapse). An unclosed region runs to the end of the string.
pub fn collapse(
    function: &str,
    open_string: char,
    close_string: char,
    replacement: &str,
    exceptions: &[&str],
) -> String {
    let mut collapsed = String::with_capacity(function.len());
    let mut token = String::new();
    let mut open_count = 0usize;

    for ch in function.chars() {
        if open_count == 0 {
            if ch == open_string
                && !exceptions.iter().any(|exception| collapsed.ends_with(exception))
            {
                open_count = 1;
                token.clear();
                token.push(ch);
            } else {
                collapsed.push(ch);
            }
        } else {
            token.push(ch);
            if ch == open_string {
                open_count += 1;
            } else if ch == close_string {
                open_count -= 1;
                if open_count == 0 {
                    if contains_exception(&token, exceptions) {
                        collapsed.push_str(&token);
                    } else {
                        collapsed.push_str(replacement);
                    }
                }
            }
        }
    }

    // Hit the end of the string with an open region.
    if open_count > 0 {
        if contains_exception(&token, exceptions) {
            collapsed.push_str(&token);
        } else {
            collapsed.push_str(replacement);
        }
    }

    collapsed
}

fn matching_close(open: char) -> char {
    match open {
        '(' => ')',
        '{' => '}',
        '[' => ']',
        '<' => '>',
        _ => open,
    }
}

// A token with an opened `...' quote that never closed, like "`anonymous"
// split off of "`anonymous namespace'".
fn has_open_backtick_quote(token: &str) -> bool {
    match token.rfind('`') {
        Some(index) => !token[index..].contains('\''),
        None => false,
    }
}

/// Drops the leading storage class / return type off a function string,
/// leaving just the qualified name and its arguments.
///
/// `static void * Allocator<MozJemallocBase>::malloc(unsigned __int64)`
/// becomes `Allocator<MozJemallocBase>::malloc(unsigned __int64)`.
///
/// The function string is split on spaces that sit outside any bracketed
/// region, then space-separated pieces that belong to the name are glued
/// back on: trailing argument lists, `[clone ...]` labels, and the halves of
/// `` `anonymous namespace' `` quotes.
pub fn drop_prefix_and_return_type(function: &str) -> String {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut levels: Vec<char> = Vec::new();

    for ch in function.chars() {
        match ch {
            '(' | '{' | '[' | '<' => {
                levels.push(matching_close(ch));
                current.push(ch);
            }
            ')' | '}' | ']' | '>' => {
                if levels.last() == Some(&ch) {
                    levels.pop();
                }
                current.push(ch);
            }
            ' ' if levels.is_empty() => {
                tokens.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    tokens.push(current);

    while tokens.len() > 1 {
        let last = &tokens[tokens.len() - 1];
        let prev = &tokens[tokens.len() - 2];
        if !(last.starts_with('(') || last.starts_with("[clone") || has_open_backtick_quote(prev))
        {
            break;
        }
        let last = tokens.pop().unwrap();
        let prev = tokens.pop().unwrap();
        tokens.push(format!("{} {}", prev, last));
    }

    tokens.pop().unwrap_or_default()
}

/// Joins the non-empty entries of `parts` with `delimiter`.
pub(crate) fn join_ignore_empty(delimiter: &str, parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .cloned()
        .collect::<Vec<&str>>()
        .join(delimiter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_bad_characters() {
        assert_eq!(drop_bad_characters(""), "");
        assert_eq!(drop_bad_characters("123"), "123");
        // Drop non-ascii characters
        assert_eq!(drop_bad_characters("1\u{018a}23"), "123");
        // Drop non-space whitespace characters
        assert_eq!(drop_bad_characters("\r\n\t1 23"), "1 23");
        // Drop non-printable characters
        assert_eq!(drop_bad_characters("\0\u{8}1 23"), "1 23");
    }

    #[test]
    fn test_generify_hex_addresses() {
        assert_eq!(generify_hex_addresses("foo(0x1A2B3C)"), "foo(@0x0)");
        assert_eq!(generify_hex_addresses("foo(0xf)"), "foo(@0x0)");
        assert_eq!(
            generify_hex_addresses("foo(0xDEADBEEFDEADBEEF)"),
            "foo(@0x0)"
        );
        assert_eq!(generify_hex_addresses("foo 0X1a2b bar"), "foo @0x0 bar");
        assert_eq!(generify_hex_addresses("no addresses here"), "no addresses here");
    }

    #[test]
    fn test_parse_source_file() {
        assert_eq!(
            parse_source_file(
                "hg:hg.mozilla.org/releases/mozilla-release:js/src/vm/JSFunction.cpp:7d280b7e277b82ef282325fefb601c10698e075b"
            ),
            Some("js/src/vm/JSFunction.cpp")
        );
        assert_eq!(
            parse_source_file(
                "git:github.com/rust-lang/rust:src/libcore/cmp.rs:4d90ac38c0b61bb69470b61ea2cccea0df48d9e5"
            ),
            Some("src/libcore/cmp.rs")
        );
        assert_eq!(
            parse_source_file("f:\\dd\\vctools\\crt\\crtw32\\mbstring\\mbsnbico.c"),
            Some("\\dd\\vctools\\crt\\crtw32\\mbstring\\mbsnbico.c")
        );
        assert_eq!(
            parse_source_file("d:\\w7rtm\\com\\rpc\\ndrole\\udt.cxx"),
            Some("\\w7rtm\\com\\rpc\\ndrole\\udt.cxx")
        );
        assert_eq!(
            parse_source_file(
                "/build/firefox-Kq_6Wg/firefox-54.0+build3/memory/mozjemalloc/jemalloc.c"
            ),
            Some("/build/firefox-Kq_6Wg/firefox-54.0+build3/memory/mozjemalloc/jemalloc.c")
        );
        assert_eq!(parse_source_file(""), None);
    }

    fn collapse_angle_brackets(function: &str) -> String {
        collapse(
            function,
            '<',
            '>',
            "<T>",
            &["name omitted", "IPC::ParamTraits", " as "],
        )
    }

    #[test]
    fn test_collapse() {
        let table = &[
            ("", ""),
            ("HeapFree", "HeapFree"),
            ("Foo<bar>", "Foo<T>"),
            ("<bar>Foo", "<T>Foo"),
            ("<bar>", "<T>"),
            ("Foo<bar", "Foo<T>"),
            ("Foo<bar <baz> >", "Foo<T>"),
            ("Foo<bar<baz>", "Foo<T>"),
            (
                "CLayeredObjectWithCLS<CCryptoSession>::Release()",
                "CLayeredObjectWithCLS<T>::Release()",
            ),
            (
                "core::ptr::drop_in_place<style::stylist::CascadeData>",
                "core::ptr::drop_in_place<T>",
            ),
            // Exceptions
            (
                "<rayon_core::job::HeapJob<BODY> as rayon_core::job::Job>::execute",
                "<rayon_core::job::HeapJob<BODY> as rayon_core::job::Job>::execute",
            ),
            ("<name omitted>", "<name omitted>"),
            (
                "IPC::ParamTraits<nsTSubstring<char> >::Write(IPC::Message *,nsTSubstring<char> const &)",
                "IPC::ParamTraits<nsTSubstring<T> >::Write(IPC::Message *,nsTSubstring<T> const &)",
            ),
        ];
        for (function, expected) in table {
            assert_eq!(&collapse_angle_brackets(function), expected, "function: {}", function);
        }
    }

    #[test]
    fn test_collapse_arguments() {
        let table = &[
            ("f( *s)", "f"),
            ("operator()(s,t,u)", "operator()"),
            (
                "::(anonymous namespace)::f3(s,t,u)",
                "::(anonymous namespace)::f3",
            ),
        ];
        for (function, expected) in table {
            assert_eq!(
                &collapse(function, '(', ')', "", &["anonymous namespace", "operator"]),
                expected,
                "function: {}",
                function
            );
        }
    }

    #[test]
    fn test_drop_prefix_and_return_type() {
        let table = &[
            ("", ""),
            // C/C++
            ("`anonymous namespace'::xClose", "`anonymous namespace'::xClose"),
            (
                "bool CCGraphBuilder::BuildGraph(class js::SliceBudget & const)",
                "CCGraphBuilder::BuildGraph(class js::SliceBudget & const)",
            ),
            (
                "int nsHtml5Tokenizer::stateLoop<nsHtml5SilentPolicy>(int, char16_t, int, char16_t*, bool, int, int)",
                "nsHtml5Tokenizer::stateLoop<nsHtml5SilentPolicy>(int, char16_t, int, char16_t*, bool, int, int)",
            ),
            (
                "js::ObjectGroup* DoCallback<js::ObjectGroup*>(JS::CallbackTracer*, js::ObjectGroup**, char const*)",
                "DoCallback<js::ObjectGroup*>(JS::CallbackTracer*, js::ObjectGroup**, char const*)",
            ),
            (
                "js::Shape* js::Allocate<js::Shape, (js::AllowGC)1>(JSContext*)",
                "js::Allocate<js::Shape, (js::AllowGC)1>(JSContext*)",
            ),
            (
                "long sandbox::TargetNtCreateFile( *, void * *, unsigned long, struct _OBJECT_ATTRIBUTES *, struct _IO_STATUS_BLOCK *, union _LARGE_INTEGER *, unsigned long, unsigned long, unsigned long, unsigned long, void *, unsigned long)",
                "sandbox::TargetNtCreateFile( *, void * *, unsigned long, struct _OBJECT_ATTRIBUTES *, struct _IO_STATUS_BLOCK *, union _LARGE_INTEGER *, unsigned long, unsigned long, unsigned long, unsigned long, void *, unsigned long)",
            ),
            (
                "static `anonymous-namespace'::reflectStatus `anonymous namespace'::internal_ReflectHistogramAndSamples(struct JSContext *, class JS::Handle<JSObject *>, class base::Histogram *, const class base::Histogram::SampleSet & const)",
                "`anonymous namespace'::internal_ReflectHistogramAndSamples(struct JSContext *, class JS::Handle<JSObject *>, class base::Histogram *, const class base::Histogram::SampleSet & const)",
            ),
            (
                "static bool `anonymous namespace'::TypeAnalyzer::specializePhis()",
                "`anonymous namespace'::TypeAnalyzer::specializePhis()",
            ),
            (
                "static char * dtoa(struct DtoaState *, union U, int, int, int *, int *, char * *)",
                "dtoa(struct DtoaState *, union U, int, int, int *, int *, char * *)",
            ),
            (
                "static class js::HashSet<js::Shape *,js::ShapeHasher,js::SystemAllocPolicy> * HashChildren(class js::Shape *, class js::Shape *)",
                "HashChildren(class js::Shape *, class js::Shape *)",
            ),
            (
                "static const class SkTMaskGamma<3,3,3> & const cached_mask_gamma(float, float, float)",
                "cached_mask_gamma(float, float, float)",
            ),
            (
                "static short ssl_Poll(struct PRFileDesc *, short, short *)",
                "ssl_Poll(struct PRFileDesc *, short, short *)",
            ),
            (
                "static struct already_AddRefed<nsIAsyncShutdownClient> `anonymous namespace'::GetShutdownPhase()",
                "`anonymous namespace'::GetShutdownPhase()",
            ),
            ("static unsigned int pr_root(void *)", "pr_root(void *)"),
            (
                "static void * Allocator<MozJemallocBase>::malloc(unsigned __int64)",
                "Allocator<MozJemallocBase>::malloc(unsigned __int64)",
            ),
            (
                "void mozilla::layers::MLGDeviceD3D11::~MLGDeviceD3D11()",
                "mozilla::layers::MLGDeviceD3D11::~MLGDeviceD3D11()",
            ),
            (
                "void * arena_t::MallocSmall(unsigned int, bool)",
                "arena_t::MallocSmall(unsigned int, bool)",
            ),
            // Rust
            (
                "static <NoType> std::panicking::begin_panic<str*>(struct str*, struct (str*, u32, u32) *)",
                "std::panicking::begin_panic<str*>(struct str*, struct (str*, u32, u32) *)",
            ),
            (
                "static core::result::Result style::properties::PropertyDeclaration::to_css(struct nsstring::nsAString *)",
                "style::properties::PropertyDeclaration::to_css(struct nsstring::nsAString *)",
            ),
            (
                "static struct atomic_refcell::AtomicRefMut<style::data::ElementData> style::gecko::wrapper::{{impl}}::ensure_data(struct style::gecko::wrapper::GeckoElement *)",
                "style::gecko::wrapper::{{impl}}::ensure_data(struct style::gecko::wrapper::GeckoElement *)",
            ),
            (
                "static void alloc::boxed::{{impl}}::call_box<(),closure>(struct closure *, <NoType>)",
                "alloc::boxed::{{impl}}::call_box<(),closure>(struct closure *, <NoType>)",
            ),
            ("static void core::option::expect_failed()", "core::option::expect_failed()"),
            // Trailing tokens that belong to the function name
            (
                "[thunk]:CShellItem::QueryInterface`adjustor{12}' (_GUID const&, void**)",
                "[thunk]:CShellItem::QueryInterface`adjustor{12}' (_GUID const&, void**)",
            ),
            (
                "nsXPConnect::InitStatics() [clone .cold.638]",
                "nsXPConnect::InitStatics() [clone .cold.638]",
            ),
            (
                "js::AssertObjectIsSavedFrameOrWrapper(JSContext*, JS::Handle<JSObject*>) [clone .isra.234] [clone .cold.687]",
                "js::AssertObjectIsSavedFrameOrWrapper(JSContext*, JS::Handle<JSObject*>) [clone .isra.234] [clone .cold.687]",
            ),
            // An aberrant case
            (
                "(anonymous namespace)::EnqueueTask(already_AddRefed<nsIRunnable>, int)",
                "(anonymous namespace)::EnqueueTask(already_AddRefed<nsIRunnable>, int)",
            ),
        ];
        for (function, expected) in table {
            assert_eq!(&drop_prefix_and_return_type(function), expected, "function: {}", function);
        }
    }

    #[test]
    fn test_join_ignore_empty() {
        assert_eq!(join_ignore_empty(" | ", &["a", "", "b"]), "a | b");
        assert_eq!(join_ignore_empty(": ", &["", ""]), "");
    }
}
