//! Root normalization.
//!
//! Roots arrive as URI references: `/volumes/a`, `file://cephfs/volumes/a`,
//! `inode:1234`. They are stored in a single canonical form so that the same
//! subtree named two ways is one member:
//!
//! - `file:/<path>` with no repeated, leading-duplicate or trailing slashes
//!   and dot segments resolved
//! - `inode:<n>` with `n` a canonical non-zero decimal
//!
//! An authority is only tolerated when it names this filesystem (by name or by
//! numeric id), and is then dropped.

use thiserror::Error;
use url::Url;

use super::request::Roots;
use super::types::Root;

const FILE_SCHEME: &str = "file";
const INODE_SCHEME: &str = "inode";

/// Scheme used to hand the hierarchical part to the URL parser. It must not be a
/// "special" scheme, otherwise numeric hosts would be read as IPv4 addresses.
const PARSE_SCHEME: &str = "qroot";

#[derive(Debug, Error)]
pub enum RootError {
    #[error("couldn't parse root '{root}': {source}")]
    Parse {
        root: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme '{scheme}' in root '{root}'")]
    UnsupportedScheme { root: String, scheme: String },
    #[error("root '{root}' names authority '{authority}' which is neither the fs name nor the fs id")]
    ForeignAuthority { root: String, authority: String },
    #[error("root '{root}' contains '{character}' which is not allowed in a URI")]
    InvalidCharacter { root: String, character: char },
    #[error("root '{root}' carries user info or a port")]
    UserInfoOrPort { root: String },
    #[error("root '{root}' carries a query or a fragment")]
    QueryOrFragment { root: String },
    #[error("root '{root}' does not encode a valid inode number")]
    BadInode { root: String },
}

/// Normalize every root of `roots`.
///
/// Fails on the first root that can't be normalized; `roots` is only replaced
/// by the caller once every root passed.
pub fn sanitize_roots(roots: &Roots, fs_name: &str, fs_id: u64) -> Result<Roots, RootError> {
    roots
        .iter()
        .map(|root| normalize_root(root, fs_name, fs_id))
        .collect()
}

/// Normalize a single root.
pub fn normalize_root(root: &str, fs_name: &str, fs_id: u64) -> Result<Root, RootError> {
    // the URL parser would percent-encode these instead of failing
    if let Some(character) = root.chars().find(|c| !is_uri_char(*c)) {
        return Err(RootError::InvalidCharacter {
            root: root.to_string(),
            character,
        });
    }

    let (scheme, rest) = split_scheme(root);
    let scheme = scheme.unwrap_or_else(|| FILE_SCHEME.to_string());
    if scheme != FILE_SCHEME && scheme != INODE_SCHEME {
        return Err(RootError::UnsupportedScheme {
            root: root.to_string(),
            scheme,
        });
    }

    // a relative path is taken from the root of the filesystem
    let hierarchical = if rest.starts_with('/') {
        format!("{PARSE_SCHEME}:{rest}")
    } else {
        format!("{PARSE_SCHEME}:/{rest}")
    };
    let url = Url::parse(&hierarchical).map_err(|source| RootError::Parse {
        root: root.to_string(),
        source,
    })?;

    if url.query().is_some() || url.fragment().is_some() {
        return Err(RootError::QueryOrFragment { root: root.to_string() });
    }
    if !url.username().is_empty() || url.password().is_some() || url.port().is_some() {
        return Err(RootError::UserInfoOrPort { root: root.to_string() });
    }
    if let Some(authority) = url.host_str().filter(|host| !host.is_empty()) {
        let matches_name = authority == fs_name;
        let matches_id = authority.parse::<u64>().is_ok_and(|id| id == fs_id);
        if !matches_name && !matches_id {
            return Err(RootError::ForeignAuthority {
                root: root.to_string(),
                authority: authority.to_string(),
            });
        }
        tracing::trace!(root, authority, "dropping the fs authority of a root");
    }

    let path = collapse_slashes(url.path());

    let normalized = if scheme == FILE_SCHEME {
        format!("{FILE_SCHEME}:/{path}")
    } else {
        let canonical = path.parse::<u64>().ok().filter(|inode| *inode != 0 && inode.to_string() == path);
        match canonical {
            Some(inode) => format!("{INODE_SCHEME}:{inode}"),
            None => return Err(RootError::BadInode { root: root.to_string() }),
        }
    };

    if normalized != root {
        tracing::trace!(root, %normalized, "normalized root");
    }
    Ok(normalized)
}

/// Characters that may appear unescaped in a URI reference.
fn is_uri_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '.' | '_' | '~' | ':' | '/' | '?' | '#' | '[' | ']' | '@' | '!' | '$' | '&' | '\'' | '(' | ')'
                | '*' | '+' | ',' | ';' | '=' | '%'
        )
}

/// Split off a leading URI scheme, lowercased.
fn split_scheme(root: &str) -> (Option<String>, &str) {
    let Some((scheme, rest)) = root.split_once(':') else {
        return (None, root);
    };
    let mut chars = scheme.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if valid {
        (Some(scheme.to_ascii_lowercase()), rest)
    } else {
        (None, root)
    }
}

/// Drop leading, repeated and trailing slashes.
fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut skip_slash = true;
    for c in path.chars() {
        if c != '/' || !skip_slash {
            out.push(c);
        }
        skip_slash = c == '/';
    }
    if out.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS_NAME: &str = "cephfs";
    const FS_ID: u64 = 42;

    fn norm(root: &str) -> Result<Root, RootError> {
        normalize_root(root, FS_NAME, FS_ID)
    }

    #[test]
    fn test_plain_paths_become_file_roots() {
        assert_eq!(norm("/volumes/a").unwrap(), "file:/volumes/a");
        assert_eq!(norm("volumes/a").unwrap(), "file:/volumes/a");
        assert_eq!(norm("/volumes///a//").unwrap(), "file:/volumes/a");
        // a leading double slash starts an authority
        assert!(matches!(norm("//volumes/a"), Err(RootError::ForeignAuthority { .. })));
        assert_eq!(norm("/").unwrap(), "file:/");
        assert_eq!(norm("file:/volumes/a/").unwrap(), "file:/volumes/a");
    }

    #[test]
    fn test_dot_segments_are_resolved() {
        assert_eq!(norm("file:/a/./c/../b").unwrap(), "file:/a/b");
        assert_eq!(norm("/a/b/..").unwrap(), "file:/a");
    }

    #[test]
    fn test_own_authority_is_dropped() {
        assert_eq!(norm("file://cephfs/a").unwrap(), "file:/a");
        assert_eq!(norm("file://42/a").unwrap(), "file:/a");
        assert_eq!(norm("inode://cephfs/77/").unwrap(), "inode:77");
    }

    #[test]
    fn test_foreign_authority_is_rejected() {
        assert!(matches!(norm("file://otherfs/a"), Err(RootError::ForeignAuthority { .. })));
        // the fs name is matched exactly
        assert!(matches!(norm("file://CephFS/a"), Err(RootError::ForeignAuthority { .. })));
        assert!(matches!(norm("file://43/a"), Err(RootError::ForeignAuthority { .. })));
        assert!(matches!(norm("file://admin@cephfs/a"), Err(RootError::UserInfoOrPort { .. })));
        assert!(matches!(norm("file://cephfs:80/a"), Err(RootError::UserInfoOrPort { .. })));
    }

    #[test]
    fn test_query_and_fragment_are_rejected() {
        assert!(matches!(norm("/a?x=1"), Err(RootError::QueryOrFragment { .. })));
        assert!(matches!(norm("file:/a#frag"), Err(RootError::QueryOrFragment { .. })));
    }

    #[test]
    fn test_characters_outside_uris_are_rejected() {
        assert!(matches!(norm("/a b"), Err(RootError::InvalidCharacter { character: ' ', .. })));
        assert!(matches!(norm("/a\"b"), Err(RootError::InvalidCharacter { character: '"', .. })));
        assert!(matches!(norm("/caf\u{e9}"), Err(RootError::InvalidCharacter { .. })));
        assert_eq!(norm("/a%20b").unwrap(), "file:/a%20b");
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(norm("http:/a"), Err(RootError::UnsupportedScheme { .. })));
        assert_eq!(norm("FILE:/a").unwrap(), "file:/a");
    }

    #[test]
    fn test_inode_roots_must_be_canonical() {
        assert_eq!(norm("inode:1234").unwrap(), "inode:1234");
        assert_eq!(norm("inode:/1234").unwrap(), "inode:1234");
        assert!(matches!(norm("inode:0"), Err(RootError::BadInode { .. })));
        assert!(matches!(norm("inode:0012"), Err(RootError::BadInode { .. })));
        assert!(matches!(norm("inode:12a"), Err(RootError::BadInode { .. })));
        assert!(matches!(norm("inode:1/2"), Err(RootError::BadInode { .. })));
    }

    #[test]
    fn test_sanitize_merges_aliases() {
        let roots: Roots = ["/a", "file:/a/", "file://cephfs/a", "/b"].into_iter().map(String::from).collect();
        let sanitized = sanitize_roots(&roots, FS_NAME, FS_ID).unwrap();
        let expected: Roots = ["file:/a", "file:/b"].into_iter().map(String::from).collect();
        assert_eq!(sanitized, expected);

        let bad: Roots = ["/a", "http:/b"].into_iter().map(String::from).collect();
        assert!(sanitize_roots(&bad, FS_NAME, FS_ID).is_err());
    }
}
