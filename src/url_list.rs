use rand::seq::SliceRandom;
use url::Url;

use crate::error::EftlError;

/// A single broker endpoint parsed out of the pipe-separated URL list,
/// carrying whatever user/password/client-id was embedded in it (§6 "URL
/// form").
#[derive(Debug, Clone)]
pub struct BrokerUrl {
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
}

impl BrokerUrl {
    fn parse(raw: &str) -> Result<Self, EftlError> {
        let url = Url::parse(raw)?;
        let username = if url.username().is_empty() { None } else { Some(url.username().to_string()) };
        let password = url.password().map(|p| p.to_string());
        let client_id = url
            .query_pairs()
            .find(|(k, _)| k == "clientId")
            .map(|(_, v)| v.into_owned());
        Ok(Self { url, username, password, client_id })
    }

    /// Whether this endpoint requires a TLS-wrapped transport, per the
    /// `wss`/`https` scheme convention in §6.
    pub fn is_tls(&self) -> bool {
        matches!(self.url.scheme(), "wss" | "https")
    }
}

/// C11: parses a pipe-separated URL list, shuffles it once per session, and
/// rotates through it on connect failure.
#[derive(Debug, Clone)]
pub struct UrlList {
    urls: Vec<BrokerUrl>,
    cursor: usize,
}

impl UrlList {
    pub fn parse(raw: &str) -> Result<Self, EftlError> {
        let mut urls = Vec::new();
        for piece in raw.split('|') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            urls.push(BrokerUrl::parse(piece)?);
        }
        if urls.is_empty() {
            return Err(EftlError::InvalidArg("empty url list".to_string()));
        }
        urls.shuffle(&mut rand::thread_rng());
        Ok(Self { urls, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    /// Index of the URL the cursor currently points at.
    pub fn index(&self) -> usize {
        self.cursor
    }

    pub fn set_index(&mut self, index: usize) {
        self.cursor = index % self.urls.len();
    }

    pub fn current(&self) -> &BrokerUrl {
        &self.urls[self.cursor]
    }

    /// Advances to the next URL in rotation, wrapping around, and reports
    /// whether the rotation wrapped back to index 0 (used by the backoff
    /// calculation in §4.2).
    pub fn advance(&mut self) -> bool {
        self.cursor = (self.cursor + 1) % self.urls.len();
        self.cursor == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &BrokerUrl> {
        self.urls.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pipe_separated_list() {
        let list = UrlList::parse("ws://a:b@host1:9191/channel|ws://host2:9191/channel?clientId=foo").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|u| u.client_id.as_deref() == Some("foo")));
    }

    #[test]
    fn rejects_empty_list() {
        assert!(UrlList::parse("   ").is_err());
    }

    #[test]
    fn advance_wraps_and_reports_wrap() {
        let mut list = UrlList::parse("ws://a|ws://b|ws://c").unwrap();
        list.set_index(0);
        assert!(!list.advance());
        assert!(!list.advance());
        assert!(list.advance());
        assert_eq!(list.index(), 0);
    }

    #[test]
    fn tls_scheme_detection() {
        let list = UrlList::parse("wss://secure.example.com|ws://plain.example.com").unwrap();
        let tls_count = list.iter().filter(|u| u.is_tls()).count();
        assert_eq!(tls_count, 1);
    }
}
