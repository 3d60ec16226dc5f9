//! `WWW-Authenticate` challenge parsing.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

/// A parsed challenge, e.g.
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: AuthScheme,
    params: HashMap<String, String>,
}

impl AuthChallenge {
    /// Parse a header value. Returns `None` for unknown schemes or a Bearer
    /// challenge without a realm.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest),
            None => (header, ""),
        };

        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            AuthScheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return None;
        };

        let challenge = Self {
            scheme,
            params: parse_params(rest),
        };
        if scheme == AuthScheme::Bearer && challenge.realm().is_none() {
            return None;
        }
        Some(challenge)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    pub fn service(&self) -> Option<&str> {
        self.param("service")
    }
}

/// `key=value` or `key="quoted, value"` pairs separated by commas.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() && chars.peek().is_none() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    c => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_challenge() {
        let c = AuthChallenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#,
        )
        .unwrap();
        assert_eq!(c.scheme, AuthScheme::Bearer);
        assert_eq!(c.realm(), Some("https://auth.docker.io/token"));
        assert_eq!(c.service(), Some("registry.docker.io"));
        assert_eq!(c.param("scope"), Some("repository:library/alpine:pull"));
    }

    #[test]
    fn quoted_commas_stay_in_value() {
        let c = AuthChallenge::parse(
            r#"Bearer realm="https://r/token",scope="repository:a:pull,push""#,
        )
        .unwrap();
        assert_eq!(c.param("scope"), Some("repository:a:pull,push"));
    }

    #[test]
    fn basic_and_unknown() {
        let c = AuthChallenge::parse(r#"Basic realm="Registry Realm""#).unwrap();
        assert_eq!(c.scheme, AuthScheme::Basic);
        assert!(AuthChallenge::parse("Negotiate abc").is_none());
        assert!(AuthChallenge::parse(r#"Bearer service="x""#).is_none());
    }
}
