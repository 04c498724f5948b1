//! Static routing rule for form submissions
//!
//! Requests under the reserved prefix skip the worker pool and go, unmodified,
//! to the form submission service.

use crate::config::SubmissionConfig;
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct SubmissionRoute {
    prefix: String,
    addr: SocketAddr,
}

impl SubmissionRoute {
    pub fn new(prefix: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            prefix: prefix.into(),
            addr,
        }
    }

    pub fn from_config(config: &SubmissionConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.prefix.clone(), config.addr()?))
    }

    /// Address of the submission service if `path` falls under the prefix
    ///
    /// Plain prefix match on the raw path: `/submit`, `/submit/abc` and
    /// `/submitted` all match.
    pub fn route(&self, path: &str) -> Option<SocketAddr> {
        path.starts_with(&self.prefix).then_some(self.addr)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> SubmissionRoute {
        SubmissionRoute::new("/submit", "127.0.0.1:4000".parse().unwrap())
    }

    #[test]
    fn test_matches_prefix() {
        let route = route();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        assert_eq!(route.route("/submit"), Some(addr));
        assert_eq!(route.route("/submit/anything"), Some(addr));
        assert_eq!(route.route("/submit/shop.example.com?x=1"), Some(addr));
        assert_eq!(route.route("/submitted"), Some(addr));
    }

    #[test]
    fn test_other_paths_go_to_pool() {
        let route = route();

        assert_eq!(route.route("/"), None);
        assert_eq!(route.route("/health"), None);
        assert_eq!(route.route("/api/submit"), None);
        assert_eq!(route.route("/Submit"), None);
    }

    #[test]
    fn test_from_config() {
        let config = SubmissionConfig::default();
        let route = SubmissionRoute::from_config(&config).unwrap();
        assert_eq!(route.prefix(), "/submit");
        assert_eq!(route.addr().port(), 4000);
    }
}
