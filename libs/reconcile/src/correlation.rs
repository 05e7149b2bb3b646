//! Correlation tokens carried in instance URLs.
//!
//! Every instance a pool creates gets a token injected into its URL as a
//! query parameter so that downstream consumers (page scripts, extensions)
//! can tell apart instances that share a logical URL. Matching instances by
//! URL identity always compares URLs with that parameter stripped.

/// Query parameter used when none is configured.
pub const DEFAULT_CORRELATION_PARAM: &str = "ros_instance_name";

/// Build the correlation token for one pool member.
pub fn correlation_token(pool_type: &str, viewport: &str, id: &str) -> String {
    format!("{pool_type}__{viewport}__{id}")
}

/// Injects and strips the correlation query parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationParam {
    name: String,
}

impl Default for CorrelationParam {
    fn default() -> Self {
        Self::new(DEFAULT_CORRELATION_PARAM)
    }
}

impl CorrelationParam {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove every occurrence of the parameter from `url`.
    ///
    /// Empty query pairs are dropped and a query left empty loses its `?`,
    /// so the result is the URL-identity key used for matching.
    pub fn strip(&self, url: &str) -> String {
        let parts = UrlParts::split(url);
        let pairs: Vec<&str> = parts.pairs().filter(|p| !self.is_param(p)).collect();
        parts.join(&pairs, None)
    }

    /// Inject `token` into `url`, replacing any previous value.
    ///
    /// The parameter is appended last in the query and any fragment is kept
    /// after it.
    pub fn tag(&self, url: &str, token: &str) -> String {
        let parts = UrlParts::split(url);
        let pairs: Vec<&str> = parts.pairs().filter(|p| !self.is_param(p)).collect();
        let tagged = format!("{}={}", self.name, encode_component(token));
        parts.join(&pairs, Some(&tagged))
    }

    /// Return the raw (still encoded) token value carried by `url`, if any.
    pub fn token_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        let parts = UrlParts::split(url);
        parts
            .query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == self.name)
            .map(|(_, value)| value)
    }

    fn is_param(&self, pair: &str) -> bool {
        let key = pair.split_once('=').map(|(k, _)| k).unwrap_or(pair);
        key == self.name
    }
}

struct UrlParts<'a> {
    base: &'a str,
    query: Option<&'a str>,
    fragment: Option<&'a str>,
}

impl<'a> UrlParts<'a> {
    fn split(url: &'a str) -> Self {
        let (rest, fragment) = match url.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (url, None),
        };
        let (base, query) = match rest.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (rest, None),
        };
        Self {
            base,
            query,
            fragment,
        }
    }

    fn pairs(&self) -> impl Iterator<Item = &'a str> {
        self.query
            .into_iter()
            .flat_map(|q| q.split('&'))
            .filter(|p| !p.is_empty())
    }

    fn join(&self, pairs: &[&str], extra: Option<&str>) -> String {
        let mut query: Vec<&str> = pairs.to_vec();
        if let Some(extra) = extra {
            query.push(extra);
        }

        let mut out = String::from(self.base);
        if !query.is_empty() {
            out.push('?');
            out.push_str(&query.join("&"));
        }
        if let Some(fragment) = self.fragment {
            out.push('#');
            out.push_str(fragment);
        }
        out
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
