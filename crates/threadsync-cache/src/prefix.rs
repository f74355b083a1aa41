//! Cache key namespacing per instance and login state.

use std::fmt;

/// Derives cache keys for one `(instance host, authenticated?)` context.
///
/// Keys have the form `{host}/{auth|anon}/{natural key}`. A host never
/// contains `/`, so two contexts cannot produce overlapping key spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachePrefix {
    host: String,
    authenticated: bool,
    prefix: String,
}

impl CachePrefix {
    /// Build a prefix for the given instance.
    ///
    /// The host is normalized: scheme and path are dropped and it is
    /// lowercased, so `https://Lemmy.World/` and `lemmy.world` share a
    /// namespace.
    ///
    /// # Example
    ///
    /// ```
    /// use threadsync_cache::CachePrefix;
    ///
    /// let prefix = CachePrefix::new("https://Lemmy.World/", true);
    /// assert_eq!(prefix.key("https://lemmy.ml/post/1"), "lemmy.world/auth/https://lemmy.ml/post/1");
    /// ```
    pub fn new(instance_host: &str, is_authenticated: bool) -> Self {
        let host = normalize_host(instance_host);
        let mode = if is_authenticated { "auth" } else { "anon" };
        let prefix = format!("{host}/{mode}/");
        Self {
            host,
            authenticated: is_authenticated,
            prefix,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// Namespaced cache key for a natural key.
    pub fn key(&self, natural_key: &str) -> String {
        let mut key = String::with_capacity(self.prefix.len() + natural_key.len());
        key.push_str(&self.prefix);
        key.push_str(natural_key);
        key
    }

    /// Natural key of a cache key in this namespace, if it belongs here.
    pub fn strip<'a>(&self, cache_key: &'a str) -> Option<&'a str> {
        cache_key.strip_prefix(self.prefix.as_str())
    }
}

impl fmt::Display for CachePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}

fn normalize_host(input: &str) -> String {
    let trimmed = input.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_key_concatenates_prefix_and_natural_key() {
        let prefix = CachePrefix::new("lemmy.world", false);
        assert_eq!(prefix.as_str(), "lemmy.world/anon/");
        assert_eq!(prefix.key("0.12.34"), "lemmy.world/anon/0.12.34");
    }

    #[test_case("lemmy.world", "lemmy.world" ; "bare host")]
    #[test_case("https://lemmy.world", "lemmy.world" ; "with scheme")]
    #[test_case("  LEMMY.World/ ", "lemmy.world" ; "case and trailing slash")]
    #[test_case("http://localhost:8536/api", "localhost:8536" ; "port and path")]
    fn test_host_normalization(input: &str, expected: &str) {
        assert_eq!(CachePrefix::new(input, true).host(), expected);
    }

    #[test]
    fn test_equal_inputs_are_interchangeable() {
        let a = CachePrefix::new("https://Beehaw.org", true);
        let b = CachePrefix::new("beehaw.org", true);
        assert_eq!(a, b);
        assert_eq!(a.key("x"), b.key("x"));
    }

    #[test]
    fn test_auth_state_separates_namespaces() {
        let anon = CachePrefix::new("lemmy.world", false);
        let auth = CachePrefix::new("lemmy.world", true);
        assert_ne!(anon, auth);
        assert_ne!(anon.key("k"), auth.key("k"));
    }

    #[test]
    fn test_strip_only_matches_own_namespace() {
        let prefix = CachePrefix::new("lemmy.world", true);
        let other = CachePrefix::new("lemmy.ml", true);
        let key = prefix.key("https://lemmy.world/post/1");

        assert_eq!(prefix.strip(&key), Some("https://lemmy.world/post/1"));
        assert_eq!(other.strip(&key), None);
    }

    #[test]
    fn test_hosts_cannot_alias_through_mode_segment() {
        // host "a" + natural key "anon/x" must differ from host "a/anon"
        let a = CachePrefix::new("a", true);
        let tricky = CachePrefix::new("a/auth", false);
        assert_eq!(tricky.host(), "a");
        assert_ne!(a.key("anon/x"), tricky.key("x"));
    }
}
