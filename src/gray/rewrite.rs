//! Resource path rewriting for the chosen version.
//!
//! Page requests are mapped onto an index template; sub-resource requests
//! get the rendered file template in place of their matched prefix. Route
//! lists arrive sorted longest prefix first.

use crate::config::{Rewrite, RouteTemplate};

/// Whether a request is a top-level page load rather than a sub-resource
/// fetch. CORS fetches are never pages; otherwise a path with no extension
/// or an `.html` extension is.
pub fn is_page_request(fetch_mode: &str, path: &str) -> bool {
    if fetch_mode.eq_ignore_ascii_case("cors") {
        return false;
    }
    let (path, _) = split_query(path);
    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rfind('.') {
        None => true,
        Some(dot) => last_segment[dot..].eq_ignore_ascii_case(".html"),
    }
}

/// Rewrites `path` for `version`, or returns `None` when it passes through
/// unchanged.
pub fn rewrite_path<'a>(
    rewrite: &Rewrite,
    path: &str,
    version: &'a str,
    is_page: bool,
    known_versions: impl Iterator<Item = &'a str> + Clone,
) -> Option<String> {
    if is_page {
        index_rewrite(path, version, &rewrite.index)
    } else {
        file_rewrite(path, version, &rewrite.file, known_versions)
    }
}

/// Maps a page path onto the longest matching index template.
///
/// The query string is carried over.
pub fn index_rewrite(path: &str, version: &str, routes: &[RouteTemplate]) -> Option<String> {
    let (path_only, query) = split_query(path);
    let route = routes.iter().find(|r| path_only.starts_with(&r.prefix))?;
    Some(format!("{}{}", route.render(version), query))
}

/// Replaces the longest matching prefix with the rendered file template.
///
/// A path that already starts with any route's template rendered for any
/// known version is left alone, so a second pass is a no-op.
pub fn file_rewrite<'a>(
    path: &str,
    version: &'a str,
    routes: &[RouteTemplate],
    known_versions: impl Iterator<Item = &'a str> + Clone,
) -> Option<String> {
    let (path_only, query) = split_query(path);

    if is_versioned(path_only, version, routes, known_versions) {
        return None;
    }

    let route = routes.iter().find(|r| path_only.starts_with(&r.prefix))?;
    let rest = &path_only[route.prefix.len()..];
    let rewritten = clean_path(&format!("{}/{}", route.render(version), rest));
    Some(format!("{}{}", rewritten, query))
}

fn is_versioned<'a>(
    path: &str,
    version: &'a str,
    routes: &[RouteTemplate],
    known_versions: impl Iterator<Item = &'a str> + Clone,
) -> bool {
    routes.iter().any(|route| {
        std::iter::once(version)
            .chain(known_versions.clone())
            .map(|v| clean_path(&route.render(v)))
            .filter(|rendered| rendered != "/")
            .any(|rendered| segment_prefix(&rendered, path))
    })
}

/// `prefix` matches `path` whole or up to a `/` boundary.
fn segment_prefix(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Splits `path?query` into the path and the `?query` suffix.
pub fn split_query(path: &str) -> (&str, &str) {
    match path.find('?') {
        Some(i) => (&path[..i], &path[i..]),
        None => (path, ""),
    }
}

/// Lexically normalises a path: duplicate slashes, `.` and `..` segments
/// are resolved. A trailing slash is dropped.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            s => segments.push(s),
        }
    }
    let joined = segments.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}
