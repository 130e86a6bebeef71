//! Deferred icon path resolution.
//!
//! When the icons path is computed by a caller-supplied callback, the
//! generation request carries [`ICONS_PATH_TOKEN`] instead of a real path.
//! The service echoes it verbatim into the generated markup and manifests,
//! e.g. `href="{{RFG-ICONS-PATH-CALLBACK}}/favicon-32x32.png"`. After
//! generation every occurrence is handed to the resolver together with the
//! reference that follows it (up to the closing quote).
//!
//! Resolutions run in parallel on the rayon pool. Results are substituted
//! by match position, so output order never depends on which resolver call
//! finishes first.

use crate::types::FileKind;
use rayon::prelude::*;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Placeholder written into the request's `files_location.path`.
pub const ICONS_PATH_TOKEN: &str = "{{RFG-ICONS-PATH-CALLBACK}}";

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r#"{}([^"]+)"#, regex::escape(ICONS_PATH_TOKEN)))
        .expect("token pattern is valid")
});

/// Computes the final path for a deferred reference.
///
/// Arguments are the reference following the token (e.g.
/// `/favicon-32x32.png`), the file being rewritten, and its kind.
pub trait PathResolver: Sync {
    fn resolve(&self, reference: &str, file: &Path, kind: FileKind) -> String;
}

impl<F> PathResolver for F
where
    F: Fn(&str, &Path, FileKind) -> String + Sync,
{
    fn resolve(&self, reference: &str, file: &Path, kind: FileKind) -> String {
        self(reference, file, kind)
    }
}

/// Whether `text` contains at least one deferred path.
pub fn has_tokens(text: &str) -> bool {
    text.contains(ICONS_PATH_TOKEN)
}

/// Replace every token occurrence with the resolver's answer.
///
/// Each match (token plus captured reference) is replaced by the resolved
/// string in document order.
pub fn rewrite(text: &str, resolver: &dyn PathResolver, file: &Path, kind: FileKind) -> String {
    let matches: Vec<(usize, usize, &str)> = TOKEN_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let reference = caps.get(1)?;
            Some((whole.start(), whole.end(), reference.as_str()))
        })
        .collect();

    if matches.is_empty() {
        return text.to_string();
    }

    let resolved: Vec<String> = matches
        .par_iter()
        .map(|(_, _, reference)| resolver.resolve(reference, file, kind))
        .collect();

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for ((start, end, _), replacement) in matches.iter().zip(resolved) {
        out.push_str(&text[cursor..*start]);
        out.push_str(&replacement);
        cursor = *end;
    }
    out.push_str(&text[cursor..]);
    out
}
