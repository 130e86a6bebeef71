//! Markup injection into consumer HTML files.
//!
//! Two modes, chosen per document:
//!
//! - **Region**: the document contains a `start`/`end` marker comment pair
//!   ([`markers`]). Everything between the markers belongs to us and is
//!   replaced wholesale; nothing outside is touched.
//! - **Merge**: no markers. The snippet is merged into `<head>` after
//!   removing superseded elements ([`merge`]).
//!
//! Both are idempotent: injecting the same snippet into the previous output
//! yields identical bytes.

pub mod markers;
pub mod merge;

use thiserror::Error;

pub use markers::MarkerKind;
pub use merge::TagMatcher;

#[derive(Error, Debug)]
pub enum InjectionError {
    #[error(
        "marker comment at byte {offset} opens a region that is never closed; add a matching `<!-- RFG end -->` or remove it"
    )]
    Unbalanced { offset: usize },
    #[error("unexpected `{kind}` marker comment at byte {offset}; markers must appear as one start/end pair")]
    UnexpectedMarker { kind: MarkerKind, offset: usize },
    #[error("second marker region at byte {offset}; only one region per file is supported")]
    DuplicateRegion { offset: usize },
}

/// Selectors steering the head merge. Unused in region mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectOptions {
    /// Elements matching these are never removed.
    pub keep: Vec<String>,
    /// Elements superseded by the new markup.
    pub remove: Vec<String>,
}

/// Inject `snippet` into `content`.
pub fn inject(
    content: &str,
    snippet: &str,
    options: &InjectOptions,
) -> Result<String, InjectionError> {
    match markers::find_region(content)? {
        Some(region) => Ok(region.replace(snippet)),
        None => Ok(merge::merge_into_head(content, snippet, options)),
    }
}
