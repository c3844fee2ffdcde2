//! Subscription keys.

use std::fmt;

/// Identity of one subscribable resource: a URI plus a discriminator.
///
/// The discriminator is a [`TemplateId`](datashare_proto::TemplateId) for rdb
/// subscriptions, a subscriber id for published data and `()` for
/// shared-config data. Keys order by URI first, then by discriminator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey<D> {
    uri: String,
    discriminator: D,
}

impl<D> SubscriptionKey<D> {
    /// Create a new key.
    pub fn new(uri: impl Into<String>, discriminator: D) -> Self {
        Self {
            uri: uri.into(),
            discriminator,
        }
    }

    /// The bare resource identifier.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The discriminator.
    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }
}

impl SubscriptionKey<()> {
    /// Create a key with no discriminator.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        Self::new(uri, ())
    }
}

impl<D> From<&SubscriptionKey<D>> for String {
    fn from(key: &SubscriptionKey<D>) -> Self {
        key.uri.clone()
    }
}

impl<D: fmt::Debug> fmt::Display for SubscriptionKey<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.uri, self.discriminator)
    }
}

/// Build one key per URI, all sharing a discriminator.
pub fn keys_for<D: Clone>(uris: &[String], discriminator: &D) -> Vec<SubscriptionKey<D>> {
    uris.iter()
        .map(|uri| SubscriptionKey::new(uri.clone(), discriminator.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datashare_proto::TemplateId;

    #[test]
    fn test_key_ordering_uri_first() {
        let a = SubscriptionKey::new("a", 9i64);
        let b = SubscriptionKey::new("b", 1i64);
        let b2 = SubscriptionKey::new("b", 2i64);

        assert!(a < b);
        assert!(b < b2);
        assert_ne!(b, b2);
        assert_eq!(b, SubscriptionKey::new("b", 1i64));
    }

    #[test]
    fn test_key_converts_to_uri() {
        let key = SubscriptionKey::new("datashare:///table", TemplateId::new(1, "bundle"));
        let uri: String = (&key).into();
        assert_eq!(uri, "datashare:///table");
        assert_eq!(key.discriminator().subscriber_id, 1);
    }

    #[test]
    fn test_keys_for() {
        let keys = keys_for(&["x".to_string(), "y".to_string()], &());
        assert_eq!(keys, vec![SubscriptionKey::from_uri("x"), SubscriptionKey::from_uri("y")]);
    }
}
