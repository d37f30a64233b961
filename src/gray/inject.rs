//! HTML fragment injection into buffered page bodies.
//!
//! Only the first occurrence of each marker is used. The caller runs this
//! at most once per response; a second pass would insert duplicates.

use memchr::memmem;

use crate::config::Injection;

const HEAD_CLOSE: &[u8] = b"</head>";
const BODY_OPEN: &[u8] = b"<body";
const BODY_CLOSE: &[u8] = b"</body>";

/// Inserts head fragments before `</head>`, body-first fragments after the
/// opening `<body ...>` tag and body-last fragments before `</body>`.
///
/// A missing marker or an empty fragment group leaves that spot untouched.
pub fn inject(body: &[u8], injection: &Injection) -> Vec<u8> {
    let mut inserts: Vec<(usize, String)> = Vec::with_capacity(3);

    if !injection.head.is_empty() {
        if let Some(pos) = memmem::find(body, HEAD_CLOSE) {
            inserts.push((pos, format!("{}\n", injection.head.join("\n"))));
        }
    }
    if !injection.body_first.is_empty() {
        if let Some(pos) = body_open_end(body) {
            inserts.push((pos, format!("\n{}", injection.body_first.join("\n"))));
        }
    }
    if !injection.body_last.is_empty() {
        if let Some(pos) = memmem::find(body, BODY_CLOSE) {
            inserts.push((pos, format!("{}\n", injection.body_last.join("\n"))));
        }
    }

    if inserts.is_empty() {
        return body.to_vec();
    }
    inserts.sort_by_key(|(pos, _)| *pos);

    let extra: usize = inserts.iter().map(|(_, s)| s.len()).sum();
    let mut out = Vec::with_capacity(body.len() + extra);
    let mut cursor = 0;
    for (pos, fragment) in inserts {
        out.extend_from_slice(&body[cursor..pos]);
        out.extend_from_slice(fragment.as_bytes());
        cursor = pos;
    }
    out.extend_from_slice(&body[cursor..]);
    out
}

/// Offset just past the first `<body>` or `<body attr...>` tag.
fn body_open_end(body: &[u8]) -> Option<usize> {
    memmem::find_iter(body, BODY_OPEN).find_map(|start| {
        let after = start + BODY_OPEN.len();
        match body.get(after) {
            Some(b'>') => Some(after + 1),
            Some(c) if c.is_ascii_whitespace() => {
                memchr::memchr(b'>', &body[after..]).map(|i| after + i + 1)
            }
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_injection(head: &[&str], first: &[&str], last: &[&str]) -> Injection {
        let owned = |v: &[&str]| -> Vec<String> { v.iter().map(|s| s.to_string()).collect() };
        Injection {
            head: owned(head),
            body_first: owned(first),
            body_last: owned(last),
        }
    }

    fn inject_str(body: &str, injection: &Injection) -> String {
        String::from_utf8(inject(body.as_bytes(), injection)).unwrap()
    }

    #[test]
    fn test_inject_all_markers() {
        let injection = make_injection(&["X"], &["Y"], &["Z"]);
        assert_eq!(
            inject_str("<html><head></head><body></body></html>", &injection),
            "<html><head>X\n</head><body>\nYZ\n</body></html>"
        );
    }

    #[test]
    fn test_inject_joins_fragments_with_newline() {
        let injection = make_injection(&["<a>", "<b>"], &[], &[]);
        assert_eq!(
            inject_str("<head></head>", &injection),
            "<head><a>\n<b>\n</head>"
        );
    }

    #[test]
    fn test_inject_only_first_marker() {
        let injection = make_injection(&[], &[], &["Z"]);
        assert_eq!(
            inject_str("<body></body><body></body>", &injection),
            "<body>Z\n</body><body></body>"
        );
    }

    #[test]
    fn test_inject_missing_marker_skipped() {
        let injection = make_injection(&["X"], &["Y"], &["Z"]);
        assert_eq!(inject_str("<div>plain</div>", &injection), "<div>plain</div>");
        assert_eq!(
            inject_str("<head></head><p>", &injection),
            "<head>X\n</head><p>"
        );
    }

    #[test]
    fn test_inject_body_with_attributes() {
        let injection = make_injection(&[], &["Y"], &[]);
        assert_eq!(
            inject_str("<body class=\"app\" id=\"root\"><p></p></body>", &injection),
            "<body class=\"app\" id=\"root\">\nY<p></p></body>"
        );
    }

    #[test]
    fn test_inject_ignores_body_lookalike_tags() {
        let injection = make_injection(&[], &["Y"], &[]);
        assert_eq!(
            inject_str("<bodyguard></bodyguard><body></body>", &injection),
            "<bodyguard></bodyguard><body>\nY</body>"
        );
    }

    #[test]
    fn test_inject_empty_groups_leave_body_untouched() {
        let injection = make_injection(&[], &[], &[]);
        let body = "<html><head></head><body></body></html>";
        assert_eq!(inject_str(body, &injection), body);
    }

    #[test]
    fn test_each_fragment_appears_once() {
        let injection = make_injection(&["HEADX"], &["FIRSTY"], &["LASTZ"]);
        let out = inject_str(
            "<html><head><title>t</title></head><body><main></main></body></html>",
            &injection,
        );
        for fragment in ["HEADX", "FIRSTY", "LASTZ"] {
            assert_eq!(out.matches(fragment).count(), 1, "{} in {}", fragment, out);
        }
    }

    #[test]
    fn test_inject_non_utf8_body_preserved() {
        let injection = make_injection(&["X"], &[], &[]);
        let mut body = vec![0xff, 0xfe];
        body.extend_from_slice(b"</head>");
        let out = inject(&body, &injection);
        assert_eq!(&out[..2], &[0xff, 0xfe]);
        assert_eq!(&out[2..], b"X\n</head>");
    }
}
