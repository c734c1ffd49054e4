//! Canonical repository names.
//!
//! The canonical name doubles as daemon name, registry namespace and
//! base domain, so it has to fit the DNS label grammar. The short form
//! is the last path segment; the long (FQDN) form reverses the full
//! path and appends the hostname, which keeps names unique across
//! forges.

use url::Url;

/// Derives the canonical name of a repository reference.
///
/// Short form: last path segment minus a `.git` extension, lower-cased
/// with underscores replaced by hyphens. When that leaves nothing, or
/// when `fqdn` is set, the long form is used: the reversed dot-joined
/// path plus the hostname (`/a/b/c` at `example.com` becomes
/// `c.b.a.example.com`).
pub fn canonical_name(url: &Url, fqdn: bool) -> String {
    if fqdn {
        full_name(url)
    } else {
        simple_name(url)
    }
}

fn simple_name(url: &Url) -> String {
    let last = url
        .path()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default();
    let name = to_domain(last.trim_end_matches(".git"));
    if name.is_empty() {
        return full_name(url);
    }
    name
}

fn full_name(url: &Url) -> String {
    let mut segments: Vec<String> = url
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| to_domain(segment.trim_end_matches(".git")))
        .filter(|segment| !segment.is_empty())
        .collect();
    segments.reverse();

    let mut domain = segments.join(".");
    if let Some(host) = url.host_str() {
        if domain.is_empty() {
            domain = host.to_string();
        } else {
            domain = format!("{domain}.{host}");
        }
    }
    domain
}

fn to_domain(segment: &str) -> String {
    segment.to_lowercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn test_simple_name_strips_git_extension() {
        assert_eq!(
            canonical_name(&url("https://example.com/u/My_App.git"), false),
            "my-app"
        );
    }

    #[test]
    fn test_simple_name_without_extension() {
        assert_eq!(
            canonical_name(&url("ssh://git@example.com:22/team/service"), false),
            "service"
        );
    }

    #[test]
    fn test_full_name_reverses_path() {
        assert_eq!(
            canonical_name(&url("https://example.com/a/b/c"), true),
            "c.b.a.example.com"
        );
    }

    #[test]
    fn test_empty_path_falls_back_to_full_form() {
        assert_eq!(
            canonical_name(&url("https://example.com/"), false),
            "example.com"
        );
    }

    #[test]
    fn test_name_is_idempotent() {
        let name = canonical_name(&url("https://example.com/u/My_App.git"), false);
        assert_eq!(to_domain(&name), name);
    }
}
