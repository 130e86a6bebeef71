//! Marker-delimited regions.
//!
//! A region is opened and closed by comments naming the generator:
//!
//! ```text
//! <!-- RFG start -->          HTML
//! {# RealFaviconGenerator end #}        Twig / Jinja
//! {{-- Real Favicon Generator start --}}  Blade
//! ```
//!
//! Matching is case-insensitive and tolerant of `~`, `_`, `-` and whitespace
//! padding. Each marker match swallows the whitespace around it, so the
//! region content is exactly what sits between the two comments minus
//! surrounding blank space.

use super::InjectionError;
use regex::Regex;
use std::sync::LazyLock;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\s*(?:<!--|\{#|\{\{--)[\s~_-]*(?:RFG|RealFaviconGenerator|Real Favicon Generator)[\s~_-]*(start|end)[\s~_-]*(?:-->|#\}|--\}\})\s*",
    )
    .expect("marker pattern is valid")
});

/// Which side of a region a marker closes or opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Start,
    End,
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerKind::Start => f.write_str("start"),
            MarkerKind::End => f.write_str("end"),
        }
    }
}

/// A document split around its single marker region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region<'a> {
    pub prefix: &'a str,
    pub start: &'a str,
    pub content: &'a str,
    pub end: &'a str,
    pub suffix: &'a str,
}

impl Region<'_> {
    /// Indentation for injected lines: whitespace after the last line break
    /// swallowed by the start marker.
    pub fn indent(&self) -> &str {
        let trailing = &self.start[self.start.trim_end().len()..];
        match trailing.rfind(['\n', '\r']) {
            Some(pos) => &trailing[pos + 1..],
            None => trailing,
        }
    }

    /// Rebuild the document with `snippet` as the region content.
    pub fn replace(&self, snippet: &str) -> String {
        let snippet = snippet.trim();
        let indent = self.indent();
        let body = if indent.is_empty() {
            snippet.to_string()
        } else {
            snippet.replace('\n', &format!("\n{indent}"))
        };

        // Adjacent markers share one run of whitespace, swallowed by the
        // start marker. Repeat it so the end marker keeps its own line.
        let separator = if self.content.is_empty()
            && !body.is_empty()
            && !self.end.starts_with(char::is_whitespace)
        {
            &self.start[self.start.trim_end().len()..]
        } else {
            ""
        };

        let mut out = String::with_capacity(
            self.prefix.len()
                + self.start.len()
                + body.len()
                + separator.len()
                + self.end.len()
                + self.suffix.len(),
        );
        out.push_str(self.prefix);
        out.push_str(self.start);
        out.push_str(&body);
        out.push_str(separator);
        out.push_str(self.end);
        out.push_str(self.suffix);
        out
    }
}

struct Marker {
    kind: MarkerKind,
    start: usize,
    end: usize,
}

enum Scan {
    BeforeRegion,
    InRegion { open: Marker },
    AfterRegion { open: Marker, close: Marker },
}

/// Find the marker region in `content`.
///
/// Returns `Ok(None)` when the document has no markers at all. Any marker
/// out of sequence (an `end` before a `start`, a second `start`, a second
/// region, or a `start` with no `end`) is an error.
pub fn find_region(content: &str) -> Result<Option<Region<'_>>, InjectionError> {
    let mut state = Scan::BeforeRegion;

    for caps in MARKER_RE.captures_iter(content) {
        let (Some(whole), Some(qualifier)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let marker = Marker {
            kind: if qualifier.as_str().eq_ignore_ascii_case("start") {
                MarkerKind::Start
            } else {
                MarkerKind::End
            },
            start: whole.start(),
            end: whole.end(),
        };

        state = match (state, marker.kind) {
            (Scan::BeforeRegion, MarkerKind::Start) => Scan::InRegion { open: marker },
            (Scan::InRegion { open }, MarkerKind::End) => Scan::AfterRegion {
                open,
                close: marker,
            },
            (Scan::AfterRegion { .. }, _) => {
                return Err(InjectionError::DuplicateRegion {
                    offset: marker.start,
                });
            }
            (_, kind) => {
                return Err(InjectionError::UnexpectedMarker {
                    kind,
                    offset: marker.start,
                });
            }
        };
    }

    match state {
        Scan::BeforeRegion => Ok(None),
        Scan::InRegion { open } => Err(InjectionError::Unbalanced { offset: open.start }),
        Scan::AfterRegion { open, close } => Ok(Some(Region {
            prefix: &content[..open.start],
            start: &content[open.start..open.end],
            content: &content[open.end..close.start],
            end: &content[close.start..close.end],
            suffix: &content[close.end..],
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_html_comment_region() {
        let html = "<head>\n  <!--RFG start-->\n  OLD\n  <!--RFG end-->\n</head>";
        let region = find_region(html).unwrap().unwrap();
        assert_eq!(region.prefix, "<head>");
        assert_eq!(region.start, "\n  <!--RFG start-->\n  ");
        assert_eq!(region.content, "OLD");
        assert_eq!(region.end, "\n  <!--RFG end-->\n");
        assert_eq!(region.suffix, "</head>");
        assert_eq!(region.indent(), "  ");
    }

    #[test]
    fn replace_reindents_snippet() {
        let html = "<head>\n  <!--RFG start-->\n  OLD\n  <!--RFG end-->\n</head>";
        let region = find_region(html).unwrap().unwrap();
        assert_eq!(
            region.replace("<link a>\n<link b>"),
            "<head>\n  <!--RFG start-->\n  <link a>\n  <link b>\n  <!--RFG end-->\n</head>"
        );
    }

    #[test]
    fn accepts_template_dialects_and_names() {
        for (open, close) in [
            ("{# RealFaviconGenerator start #}", "{# RealFaviconGenerator end #}"),
            ("{{-- Real Favicon Generator START --}}", "{{-- real favicon generator End --}}"),
            ("<!-- ~ rfg _ start - -->", "<!--rfg-end-->"),
        ] {
            let html = format!("<head>\n{open}\nOLD\n{close}\n</head>");
            let region = find_region(&html).unwrap().expect(open);
            assert_eq!(region.content, "OLD", "dialect {open}");
        }
    }

    #[test]
    fn no_markers_is_none() {
        assert!(find_region("<head><title>x</title></head>").unwrap().is_none());
    }

    #[test]
    fn unrelated_comments_are_ignored() {
        assert!(find_region("<!-- start -->\n<!-- favicon end -->").unwrap().is_none());
    }

    #[test]
    fn start_without_end_is_unbalanced() {
        let err = find_region("<head>\n<!-- RFG start -->\n</head>").unwrap_err();
        assert!(matches!(err, InjectionError::Unbalanced { offset: 6 }));
    }

    #[test]
    fn end_without_start_is_unexpected() {
        let err = find_region("<head><!-- RFG end --></head>").unwrap_err();
        assert!(matches!(
            err,
            InjectionError::UnexpectedMarker {
                kind: MarkerKind::End,
                ..
            }
        ));
    }

    #[test]
    fn nested_start_is_unexpected() {
        let err = find_region("<!--RFG start--><!--RFG start--><!--RFG end-->").unwrap_err();
        assert!(matches!(
            err,
            InjectionError::UnexpectedMarker {
                kind: MarkerKind::Start,
                ..
            }
        ));
    }

    #[test]
    fn second_region_is_rejected() {
        let html = "<!--RFG start-->a<!--RFG end--><!--RFG start-->b<!--RFG end-->";
        assert!(matches!(
            find_region(html).unwrap_err(),
            InjectionError::DuplicateRegion { .. }
        ));
    }

    #[test]
    fn empty_region_without_indent() {
        let region = find_region("<!--RFG start--><!--RFG end-->").unwrap().unwrap();
        assert_eq!(region.content, "");
        assert_eq!(region.indent(), "");
        assert_eq!(
            region.replace("X\nY"),
            "<!--RFG start-->X\nY<!--RFG end-->"
        );
    }
}
