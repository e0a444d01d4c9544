/// Split a seed-server list on any mix of spaces and commas
/// E.g. "http://a:4111, http://b:4111 http://c:4111" -> 3 entries
pub fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract "host:port" from a URL, tolerating a bare host:port
/// E.g. "http://localhost:4111/mcp" -> "localhost:4111"
pub fn host_port_from_url(url: &str) -> Option<String> {
    let without_scheme = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = without_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()?;
    if authority.is_empty() {
        return None;
    }
    Some(authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_list() {
        assert_eq!(
            parse_server_list("http://a:4111, http://b:4111 http://c:4111"),
            vec!["http://a:4111", "http://b:4111", "http://c:4111"]
        );
        assert_eq!(
            parse_server_list("  http://a:4111  "),
            vec!["http://a:4111"]
        );
        assert!(parse_server_list("").is_empty());
        assert!(parse_server_list(" , ").is_empty());
    }

    #[test]
    fn test_host_port_from_url() {
        assert_eq!(
            host_port_from_url("http://localhost:4111/mcp").unwrap(),
            "localhost:4111"
        );
        assert_eq!(
            host_port_from_url("127.0.0.1:4111").unwrap(),
            "127.0.0.1:4111"
        );
        assert!(host_port_from_url("http://").is_none());
    }
}
