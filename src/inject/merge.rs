//! Heuristic `<head>` merge for documents without marker comments.
//!
//! The merge is two passes over the document:
//!
//! 1. **Remove** superseded elements: anything matching one of the
//!    descriptor's overlapping-markup selectors (unless a keep selector also
//!    matches), plus any element identical to one the snippet is about to
//!    add.
//! 2. **Insert** the snippet, one element per line, just before `</head>`,
//!    indented like the head's existing children.
//!
//! Because removal runs first and removes whole lines, merging the same
//! snippet into its own output is a no-op.
//!
//! Selectors come in two shapes, both accepted: markup (`<link rel="icon">`)
//! and attribute selectors (`link[rel="icon"]`, `meta[name=theme-color]`).
//! This is deliberately not a general HTML parser; it understands tags,
//! attributes, quoted values, and comments, which is all the generated
//! markup uses.

use super::InjectOptions;

const VOID_ELEMENTS: &[&str] = &["base", "link", "meta"];
const HEAD_INDENT: &str = "  ";

/// A start tag found in a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    pub start: usize,
    pub end: usize,
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Tag name plus attributes in a whitespace- and case-normalized form.
    fn identity(&self) -> String {
        let mut attrs: Vec<String> = self
            .attrs
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_ascii_lowercase(), v))
            .collect();
        attrs.sort();
        format!("{} {}", self.name.to_ascii_lowercase(), attrs.join(" "))
    }
}

/// Tag name plus required attributes, e.g. `link[rel="icon"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatcher {
    name: String,
    attrs: Vec<(String, Option<String>)>,
}

impl TagMatcher {
    /// Parse either `<link rel="icon">` or `link[rel="icon"]`.
    pub fn parse(selector: &str) -> Option<Self> {
        let selector = selector.trim();
        if selector.starts_with('<') {
            let element = scan_elements(selector).into_iter().next()?;
            return Some(Self {
                name: element.name,
                attrs: element
                    .attrs
                    .into_iter()
                    .map(|(k, v)| (k, Some(v)))
                    .collect(),
            });
        }

        let (name, mut rest) = match selector.find('[') {
            Some(pos) => (&selector[..pos], &selector[pos..]),
            None => (selector, ""),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return None;
        }

        let mut attrs = Vec::new();
        while let Some(inner) = rest.strip_prefix('[') {
            let close = inner.find(']')?;
            let body = &inner[..close];
            rest = &inner[close + 1..];
            match body.split_once('=') {
                Some((k, v)) => {
                    let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
                    attrs.push((k.trim().to_string(), Some(v.to_string())));
                }
                None => attrs.push((body.trim().to_string(), None)),
            }
        }
        if !rest.trim().is_empty() {
            return None;
        }

        Some(Self {
            name: name.to_string(),
            attrs,
        })
    }

    pub(crate) fn matches(&self, element: &Element) -> bool {
        element.name.eq_ignore_ascii_case(&self.name)
            && self
                .attrs
                .iter()
                .all(|(k, expected)| match (element.attr(k), expected) {
                    (Some(actual), Some(expected)) => actual.eq_ignore_ascii_case(expected),
                    (Some(_), None) => true,
                    (None, _) => false,
                })
    }
}

fn parse_matchers(selectors: &[String]) -> Vec<TagMatcher> {
    selectors
        .iter()
        .filter_map(|s| {
            let matcher = TagMatcher::parse(s);
            if matcher.is_none() {
                tracing::debug!("ignoring unsupported selector {s:?}");
            }
            matcher
        })
        .collect()
}

/// Find every start tag in `html`, skipping comments and closing tags.
pub(crate) fn scan_elements(html: &str) -> Vec<Element> {
    let bytes = html.as_bytes();
    let mut elements = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i..].starts_with(b"<!--") {
            match html[i + 4..].find("-->") {
                Some(pos) => i += 4 + pos + 3,
                None => break,
            }
            continue;
        }
        if bytes[i] == b'<' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_alphabetic()) {
            match parse_tag(html, i) {
                Some(element) => {
                    i = element.end;
                    elements.push(element);
                }
                None => break,
            }
            continue;
        }
        i += 1;
    }

    elements
}

/// Parse the start tag opening at `start`. `None` if it never closes.
fn parse_tag(html: &str, start: usize) -> Option<Element> {
    let bytes = html.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    let name = html[start + 1..i].to_string();
    let mut attrs = Vec::new();

    loop {
        while i < bytes.len() && (bytes[i].is_ascii_whitespace() || bytes[i] == b'/') {
            i += 1;
        }
        match *bytes.get(i)? {
            b'>' => {
                return Some(Element {
                    start,
                    end: i + 1,
                    name,
                    attrs,
                });
            }
            _ => {
                let key_start = i;
                while i < bytes.len()
                    && !bytes[i].is_ascii_whitespace()
                    && !matches!(bytes[i], b'=' | b'>' | b'/')
                {
                    i += 1;
                }
                let key = html[key_start..i].to_string();
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                if bytes.get(i) != Some(&b'=') {
                    attrs.push((key, String::new()));
                    continue;
                }
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                let value = match *bytes.get(i)? {
                    quote @ (b'"' | b'\'') => {
                        let close = html[i + 1..].find(quote as char)?;
                        let value = &html[i + 1..i + 1 + close];
                        i += close + 2;
                        value
                    }
                    _ => {
                        let value_start = i;
                        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>'
                        {
                            i += 1;
                        }
                        &html[value_start..i]
                    }
                };
                attrs.push((key, value.to_string()));
            }
        }
    }
}

/// Byte range an element occupies, including its closing tag if it has one.
fn element_extent(html: &str, element: &Element) -> (usize, usize) {
    let name = element.name.to_ascii_lowercase();
    let self_closing = html[..element.end].ends_with("/>");
    if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
        return (element.start, element.end);
    }
    let closing = format!("</{name}");
    let rest = html[element.end..].to_ascii_lowercase();
    match rest.find(&closing) {
        Some(pos) => match rest[pos..].find('>') {
            Some(gt) => (element.start, element.end + pos + gt + 1),
            None => (element.start, element.end),
        },
        None => (element.start, element.end),
    }
}

fn line_start(html: &str, pos: usize) -> usize {
    html[..pos].rfind('\n').map(|p| p + 1).unwrap_or(0)
}

fn line_end(html: &str, pos: usize) -> usize {
    html[pos..].find('\n').map(|p| pos + p + 1).unwrap_or(html.len())
}

fn is_blank(s: &str) -> bool {
    s.chars().all(char::is_whitespace)
}

/// Widen a removal to the whole line when the element is alone on it.
fn removal_range(html: &str, (start, end): (usize, usize)) -> (usize, usize) {
    let ls = line_start(html, start);
    let le = line_end(html, end);
    if is_blank(&html[ls..start]) && is_blank(&html[end..le]) {
        (ls, le)
    } else {
        (start, end)
    }
}

fn remove_elements(html: &str, snippet: &str, options: &InjectOptions) -> String {
    let remove = parse_matchers(&options.remove);
    let keep = parse_matchers(&options.keep);
    let snippet_identities: Vec<String> =
        scan_elements(snippet).iter().map(Element::identity).collect();

    let mut ranges: Vec<(usize, usize)> = scan_elements(html)
        .iter()
        .filter(|el| {
            let overlapping =
                remove.iter().any(|m| m.matches(el)) && !keep.iter().any(|m| m.matches(el));
            overlapping || snippet_identities.contains(&el.identity())
        })
        .map(|el| removal_range(html, element_extent(html, el)))
        .collect();
    ranges.sort();

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    for (start, end) in ranges {
        if start < cursor {
            // Nested in a range already removed.
            cursor = cursor.max(end);
            continue;
        }
        out.push_str(&html[cursor..start]);
        cursor = end;
    }
    out.push_str(&html[cursor..]);
    out
}

/// Position of `<name` (or `</name` when `name` starts with `/`) as a whole
/// tag name, case-insensitively.
fn find_tag(html: &str, name: &str) -> Option<usize> {
    let lower = html.to_ascii_lowercase();
    let needle = format!("<{name}");
    let mut from = 0;
    while let Some(pos) = lower[from..].find(&needle) {
        let at = from + pos;
        let next = lower.as_bytes().get(at + needle.len());
        if next.is_none_or(|b| b.is_ascii_whitespace() || matches!(b, b'>' | b'/')) {
            return Some(at);
        }
        from = at + needle.len();
    }
    None
}

fn leading_ws(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

fn snippet_lines(snippet: &str, indent: &str, newline: &str) -> String {
    snippet
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| format!("{indent}{l}{newline}"))
        .collect()
}

fn insert_into_head(html: &str, snippet: &str) -> String {
    let newline = if html.contains("\r\n") { "\r\n" } else { "\n" };

    if let Some(close) = find_tag(html, "/head") {
        let ls = line_start(html, close);
        let on_own_line = is_blank(&html[ls..close]);
        let close_indent = if on_own_line {
            &html[ls..close]
        } else {
            leading_ws(&html[ls..])
        };

        // Indent like the last existing child, else one level past </head>.
        let head_body_start = find_tag(&html[..close], "head")
            .and_then(|open| html[open..close].find('>').map(|gt| open + gt + 1))
            .unwrap_or(0);
        let body_end = if on_own_line { ls } else { close };
        let child_indent = html[head_body_start..body_end]
            .lines()
            .rev()
            .find(|l| !is_blank(l))
            .map(|l| leading_ws(l).to_string())
            .unwrap_or_else(|| format!("{close_indent}{HEAD_INDENT}"));

        let lines = snippet_lines(snippet, &child_indent, newline);
        let mut out = String::with_capacity(html.len() + lines.len() + 1);
        if on_own_line {
            out.push_str(&html[..ls]);
            out.push_str(&lines);
            out.push_str(&html[ls..]);
        } else {
            out.push_str(&html[..close]);
            out.push_str(newline);
            out.push_str(&lines);
            out.push_str(&html[close..]);
        }
        return out;
    }

    let lines = snippet_lines(snippet, HEAD_INDENT, newline);
    let head = format!("<head>{newline}{lines}</head>");

    // An opening <head> without a close, or an <html> with no head at all.
    for tag in ["head", "html"] {
        if let Some(open) = find_tag(html, tag)
            && let Some(gt) = html[open..].find('>')
        {
            let at = open + gt + 1;
            let insert = if tag == "head" {
                format!("{newline}{lines}")
            } else {
                format!("{newline}{head}")
            };
            return format!("{}{}{}", &html[..at], insert, &html[at..]);
        }
    }

    format!("{head}{newline}{html}")
}

/// Merge `snippet` into the document head.
pub fn merge_into_head(html: &str, snippet: &str, options: &InjectOptions) -> String {
    let cleaned = remove_elements(html, snippet, options);
    insert_into_head(&cleaned, snippet)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(remove: &[&str], keep: &[&str]) -> InjectOptions {
        InjectOptions {
            remove: remove.iter().map(|s| s.to_string()).collect(),
            keep: keep.iter().map(|s| s.to_string()).collect(),
        }
    }

    // =========================================================================
    // Selector parsing
    // =========================================================================

    #[test]
    fn parse_markup_selector() {
        let m = TagMatcher::parse(r#"<link rel="icon">"#).unwrap();
        assert_eq!(m.name, "link");
        assert_eq!(
            m.attrs,
            vec![("rel".to_string(), Some("icon".to_string()))]
        );
    }

    #[test]
    fn parse_attribute_selector() {
        let m = TagMatcher::parse(r#"meta[name='msapplication-TileColor'][content]"#).unwrap();
        assert_eq!(m.name, "meta");
        assert_eq!(
            m.attrs,
            vec![
                ("name".to_string(), Some("msapplication-TileColor".to_string())),
                ("content".to_string(), None)
            ]
        );
    }

    #[test]
    fn parse_rejects_complex_selectors() {
        assert!(TagMatcher::parse("head > link").is_none());
        assert!(TagMatcher::parse("").is_none());
        assert!(TagMatcher::parse("link[rel=icon").is_none());
    }

    #[test]
    fn matcher_is_case_insensitive_and_exact_on_values() {
        let m = TagMatcher::parse(r#"link[rel="icon"]"#).unwrap();
        let els = scan_elements(r#"<LINK REL="Icon"><link rel="shortcut icon">"#);
        assert!(m.matches(&els[0]));
        assert!(!m.matches(&els[1]));
    }

    // =========================================================================
    // Scanner
    // =========================================================================

    #[test]
    fn scanner_reads_attributes_and_skips_comments() {
        let els = scan_elements(
            r#"<!-- <link rel="old"> --><meta name=viewport content='a b'><link rel="icon" sizes="32x32" />"#,
        );
        assert_eq!(els.len(), 2);
        assert_eq!(els[0].name, "meta");
        assert_eq!(els[0].attr("content"), Some("a b"));
        assert_eq!(els[0].attr("name"), Some("viewport"));
        assert_eq!(els[1].attr("sizes"), Some("32x32"));
    }

    #[test]
    fn scanner_handles_bare_attributes_and_gt_in_values() {
        let els = scan_elements(r#"<script async src="a.js?x=>1"></script>"#);
        assert_eq!(els.len(), 1);
        assert_eq!(els[0].attr("async"), Some(""));
        assert_eq!(els[0].attr("src"), Some("a.js?x=>1"));
    }

    // =========================================================================
    // Merge
    // =========================================================================

    #[test]
    fn inserts_before_head_close_with_child_indent() {
        let html = "<html>\n  <head>\n    <title>x</title>\n  </head>\n</html>";
        let out = merge_into_head(html, r#"<link rel="icon" href="/favicon.ico">"#, &opts(&[], &[]));
        assert_eq!(
            out,
            "<html>\n  <head>\n    <title>x</title>\n    <link rel=\"icon\" href=\"/favicon.ico\">\n  </head>\n</html>"
        );
    }

    #[test]
    fn removes_overlapping_markup_once() {
        let html = "<head>\n  <link rel=\"icon\" href=\"/old.ico\">\n  <title>x</title>\n</head>";
        let snippet = "<link rel=\"icon\" href=\"/new.png\">";
        let options = opts(&[r#"<link rel="icon">"#], &[]);

        let first = merge_into_head(html, snippet, &options);
        let second = merge_into_head(&first, snippet, &options);

        assert_eq!(
            first,
            "<head>\n  <title>x</title>\n  <link rel=\"icon\" href=\"/new.png\">\n</head>"
        );
        assert_eq!(first, second);
        assert_eq!(second.matches("<link").count(), 1);
    }

    #[test]
    fn keep_overrides_removal() {
        let html = "<head>\n  <link rel=\"icon\" href=\"/brand.svg\" type=\"image/svg+xml\">\n</head>";
        let out = merge_into_head(
            html,
            "<link rel=\"icon\" href=\"/a.png\">",
            &opts(&["link[rel=icon]"], &[r#"link[type="image/svg+xml"]"#]),
        );
        assert!(out.contains("/brand.svg"));
        assert!(out.contains("/a.png"));
    }

    #[test]
    fn identical_elements_are_not_duplicated_without_selectors() {
        let snippet = "<meta name=\"theme-color\" content=\"#fff\">";
        let first = merge_into_head("<head>\n</head>", snippet, &opts(&[], &[]));
        let second = merge_into_head(&first, snippet, &opts(&[], &[]));
        assert_eq!(first, second);
        assert_eq!(first, "<head>\n  <meta name=\"theme-color\" content=\"#fff\">\n</head>");
    }

    #[test]
    fn inline_head_is_expanded_then_stable() {
        let snippet = "<link rel=\"icon\" href=\"/a.png\">\n<meta name=\"x\" content=\"y\">";
        let options = opts(&["link[rel=icon]", "meta[name=x]"], &[]);
        let first = merge_into_head("<html>\n<head></head>\n</html>", snippet, &options);
        assert_eq!(
            first,
            "<html>\n<head>\n  <link rel=\"icon\" href=\"/a.png\">\n  <meta name=\"x\" content=\"y\">\n</head>\n</html>"
        );
        assert_eq!(merge_into_head(&first, snippet, &options), first);
    }

    #[test]
    fn missing_head_is_created_inside_html() {
        let snippet = "<link rel=\"icon\" href=\"/a.png\">";
        let options = opts(&["link[rel=icon]"], &[]);
        let first = merge_into_head("<html>\n<body></body>\n</html>", snippet, &options);
        assert_eq!(
            first,
            "<html>\n<head>\n  <link rel=\"icon\" href=\"/a.png\">\n</head>\n<body></body>\n</html>"
        );
        assert_eq!(merge_into_head(&first, snippet, &options), first);
    }

    #[test]
    fn empty_document_gets_a_head() {
        let snippet = "<link rel=\"icon\" href=\"/a.png\">";
        let options = opts(&["link[rel=icon]"], &[]);
        let first = merge_into_head("", snippet, &options);
        assert_eq!(first, "<head>\n  <link rel=\"icon\" href=\"/a.png\">\n</head>\n");
        assert_eq!(merge_into_head(&first, snippet, &options), first);
    }

    #[test]
    fn crlf_documents_keep_crlf() {
        let html = "<head>\r\n  <title>x</title>\r\n</head>\r\n";
        let out = merge_into_head(html, "<link rel=\"icon\" href=\"/a.png\">", &opts(&[], &[]));
        assert_eq!(
            out,
            "<head>\r\n  <title>x</title>\r\n  <link rel=\"icon\" href=\"/a.png\">\r\n</head>\r\n"
        );
    }

    #[test]
    fn removes_non_void_elements_with_their_content() {
        let html = "<head>\n  <script id=\"old-icons\">x()</script>\n</head>";
        let out = merge_into_head(html, "<link rel=\"icon\" href=\"/a.png\">", &opts(&["script[id=old-icons]"], &[]));
        assert_eq!(out, "<head>\n  <link rel=\"icon\" href=\"/a.png\">\n</head>");
    }
}
