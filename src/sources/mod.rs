//! Cookie and proxy list loaders
//!
//! Both loaders are best-effort: a missing or unreadable file is logged and
//! yields an empty result so the crawl can still start.

use std::collections::BTreeMap;
use std::path::Path;

/// Loads `key=value` cookies, one per line
///
/// Blank lines, lines starting with `#` and lines without `=` are ignored.
/// Keys and values are trimmed. Any I/O failure yields an empty map.
pub fn load_cookie_file(path: &Path) -> BTreeMap<String, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                "Failed to read cookie file {}: {} (continuing without cookies)",
                path.display(),
                e
            );
            return BTreeMap::new();
        }
    };

    let cookies = parse_cookies(&content);
    tracing::info!("Loaded {} cookies from {}", cookies.len(), path.display());
    cookies
}

fn parse_cookies(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Loads proxy URLs, one per line
///
/// Any I/O failure yields an empty list.
pub fn load_proxy_file(path: &Path) -> Vec<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(
                "Failed to read proxy file {}: {} (continuing without proxies)",
                path.display(),
                e
            );
            return Vec::new();
        }
    };

    let proxies: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    tracing::info!("Loaded {} proxies from {}", proxies.len(), path.display());
    proxies
}

/// Builds a `Cookie` header value from a cookie map
///
/// Returns `None` when there are no cookies to send.
pub fn cookie_header(cookies: &BTreeMap<String, String>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }

    Some(
        cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_cookies() {
        let file = temp_file("session = abc123\n\n# comment\nbroken-line\ncsrf_token=x=y\n");
        let cookies = load_cookie_file(file.path());

        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc123"));
        // Only the first '=' separates key and value
        assert_eq!(cookies.get("csrf_token").map(String::as_str), Some("x=y"));
    }

    #[test]
    fn test_missing_cookie_file_is_empty() {
        let cookies = load_cookie_file(Path::new("/nonexistent/cookies.txt"));
        assert!(cookies.is_empty());
    }

    #[test]
    fn test_load_proxies() {
        let file = temp_file("http://10.0.0.1:8080\n  \n# disabled\nsocks5://10.0.0.2:1080  \n");
        let proxies = load_proxy_file(file.path());
        assert_eq!(
            proxies,
            vec!["http://10.0.0.1:8080", "socks5://10.0.0.2:1080"]
        );
    }

    #[test]
    fn test_missing_proxy_file_is_empty() {
        assert!(load_proxy_file(Path::new("/nonexistent/proxies.txt")).is_empty());
    }

    #[test]
    fn test_cookie_header() {
        let mut cookies = BTreeMap::new();
        assert_eq!(cookie_header(&cookies), None);

        cookies.insert("b".to_string(), "2".to_string());
        cookies.insert("a".to_string(), "1".to_string());
        assert_eq!(cookie_header(&cookies).as_deref(), Some("a=1; b=2"));
    }
}
