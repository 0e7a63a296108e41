//! Bridge domains and the domain/id blocklist.

use url::Url;

/// The domains the bridge itself owns and serves from.
#[derive(Debug, Clone)]
pub struct Domains {
    /// Parent of the per-protocol subdomains, eg `brid.gy`.
    pub superdomain: String,
    /// Canonical serving domain, eg `fed.brid.gy`.
    pub primary: String,
    /// Handle domains whose DNS we do not manage; TXT installs are skipped.
    pub reserved_handle_domains: Vec<String>,
    /// Domains we refuse to fetch from or subscribe to.
    pub blocklist: Vec<String>,
}

impl Default for Domains {
    fn default() -> Self {
        Domains {
            superdomain: "brid.gy".into(),
            primary: "fed.brid.gy".into(),
            reserved_handle_domains: vec!["bsky.social".into(), "bsky.brid.gy".into()],
            blocklist: vec!["localhost".into(), "localhost.localdomain".into()],
        }
    }
}

impl Domains {
    /// Whether `domain` is ours (the superdomain or any subdomain of it).
    pub fn is_ours(&self, domain: &str) -> bool {
        domain == self.superdomain || domain.ends_with(&format!(".{}", self.superdomain))
    }

    pub fn pds_url(&self) -> String {
        format!("https://atproto.{}", self.superdomain)
    }

    /// Whether `url_or_domain` is on the blocklist. Bare domains and full
    /// URLs are both accepted.
    pub fn is_blocklisted(&self, url_or_domain: &str) -> bool {
        let domain = domain_from_link(url_or_domain);
        let Some(domain) = domain else {
            return true;
        };
        self.blocklist
            .iter()
            .any(|blocked| domain == *blocked || domain.ends_with(&format!(".{blocked}")))
    }

    /// Whether `handle`'s domain is one we never install DNS records for.
    pub fn is_reserved_handle(&self, handle: &str) -> bool {
        self.reserved_handle_domains
            .iter()
            .any(|domain| handle == *domain || handle.ends_with(&format!(".{domain}")))
    }
}

/// Extracts the host from a URL, or returns the input if it already looks
/// like a bare domain.
pub fn domain_from_link(url_or_domain: &str) -> Option<String> {
    if let Ok(url) = Url::parse(url_or_domain) {
        if let Some(host) = url.host_str() {
            return Some(host.to_lowercase());
        }
    }
    if crate::ids::is_valid_domain(url_or_domain) {
        return Some(url_or_domain.to_lowercase());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ours() {
        let domains = Domains::default();
        assert!(domains.is_ours("brid.gy"));
        assert!(domains.is_ours("atproto.brid.gy"));
        assert!(!domains.is_ours("example.com"));
        assert!(!domains.is_ours("notbrid.gy.example.com"));
    }

    #[test]
    fn blocklist() {
        let domains = Domains::default();
        assert!(domains.is_blocklisted("ws://localhost:8080"));
        assert!(domains.is_blocklisted("https://evil.localhost"));
        assert!(!domains.is_blocklisted("wss://nos.lol"));
        // unparseable input is blocked rather than fetched
        assert!(domains.is_blocklisted("not a url"));
    }

    #[test]
    fn reserved_handles() {
        let domains = Domains::default();
        assert!(domains.is_reserved_handle("alice.bsky.social"));
        assert!(!domains.is_reserved_handle("alice.com"));
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_from_link("https://Example.com/a/b"), Some("example.com".into()));
        assert_eq!(domain_from_link("wss://relay.damus.io"), Some("relay.damus.io".into()));
        assert_eq!(domain_from_link("alice.com"), Some("alice.com".into()));
    }
}
