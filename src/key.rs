//! Canonical cache keys and the URN scheme
//!
//! A [`GCacheKey`] is an immutable fingerprint of one cached call:
//! `(key_type, id, use_case, sorted args)` plus behavior flags. Its URN is the
//! literal remote-store key:
//!
//! ```text
//! [{]PREFIX:KEY_TYPE:ID[}][?k1=v1&k2=v2...]#USE_CASE
//! ```
//!
//! The braces wrap the entity prefix exactly when invalidation tracking is on,
//! which keeps the value and its watermark co-located in sharded stores. No
//! escaping is applied; ids and argument values must avoid the separator
//! characters.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::KeyConfig;
use crate::context;

/// Caller-supplied transformation applied to payload bytes in the remote
/// tier: `dump` on the write path, `load` on the read path. Typical uses are
/// compression or a stable wire format for long-lived entries.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Transform payload bytes before they are stored.
    async fn dump(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Reverse [`Codec::dump`] on bytes read back from the store.
    async fn load(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// Immutable cache key with precomputed entity prefix and URN.
///
/// Equality and hashing cover `(key_type, id, use_case, args)` only, so two
/// keys built from the same call always share a slot in any tier.
#[derive(Clone)]
pub struct GCacheKey {
    key_type: String,
    id: String,
    use_case: String,
    args: Vec<(String, String)>,
    invalidation_tracking: bool,
    default_config: Option<KeyConfig>,
    codec: Option<Arc<dyn Codec>>,
    prefix: String,
    urn: String,
}

impl GCacheKey {
    /// Start building a key for `(key_type, id, use_case)`.
    pub fn builder(key_type: &str, id: &str, use_case: &str) -> GCacheKeyBuilder {
        GCacheKeyBuilder {
            key_type: key_type.to_string(),
            id: id.to_string(),
            use_case: use_case.to_string(),
            args: Vec::new(),
            invalidation_tracking: false,
            default_config: None,
            codec: None,
        }
    }

    /// Entity type of the id (e.g. `user_id`).
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// Entity id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Use case name scoping TTL, ramp, and the local sub-map.
    pub fn use_case(&self) -> &str {
        &self.use_case
    }

    /// Canonically sorted key arguments.
    pub fn args(&self) -> &[(String, String)] {
        &self.args
    }

    /// Whether writes to this key are subject to watermark invalidation.
    pub fn invalidation_tracking(&self) -> bool {
        self.invalidation_tracking
    }

    /// Config used when the provider returns nothing for this key.
    pub fn default_config(&self) -> Option<&KeyConfig> {
        self.default_config.as_ref()
    }

    /// Payload codec, if one is attached.
    pub fn codec(&self) -> Option<&Arc<dyn Codec>> {
        self.codec.as_ref()
    }

    /// Entity-level prefix (`PREFIX:KEY_TYPE:ID`, braced when tracking).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The full URN; this is the literal remote-store key.
    pub fn urn(&self) -> &str {
        &self.urn
    }

    /// Remote key of the watermark entry for this key's entity.
    pub fn watermark_key(&self) -> String {
        format!("{}#watermark", self.prefix)
    }
}

impl PartialEq for GCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_type == other.key_type
            && self.id == other.id
            && self.use_case == other.use_case
            && self.args == other.args
    }
}

impl Eq for GCacheKey {}

impl Hash for GCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.id.hash(state);
        self.use_case.hash(state);
        self.args.hash(state);
    }
}

impl fmt::Display for GCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.urn)
    }
}

impl fmt::Debug for GCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GCacheKey").field("urn", &self.urn).finish()
    }
}

/// Builder for [`GCacheKey`].
pub struct GCacheKeyBuilder {
    key_type: String,
    id: String,
    use_case: String,
    args: Vec<(String, String)>,
    invalidation_tracking: bool,
    default_config: Option<KeyConfig>,
    codec: Option<Arc<dyn Codec>>,
}

impl GCacheKeyBuilder {
    /// Add one named argument in its string form.
    pub fn arg(mut self, name: &str, value: &str) -> Self {
        self.args.push((name.to_string(), value.to_string()));
        self
    }

    /// Add several named arguments at once.
    pub fn args(mut self, args: Vec<(String, String)>) -> Self {
        self.args.extend(args);
        self
    }

    /// Enable watermark-based invalidation tracking for this key.
    pub fn track_for_invalidation(mut self, track: bool) -> Self {
        self.invalidation_tracking = track;
        self
    }

    /// Attach a config used when the provider has none for this use case.
    pub fn default_config(mut self, config: KeyConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    /// Attach a payload codec.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Finalize the key, sorting arguments and computing the URN.
    pub fn build(mut self) -> GCacheKey {
        self.args.sort_by(|a, b| a.0.cmp(&b.0));

        let mut prefix = format!("{}:{}", self.key_type, self.id);
        let urn_prefix = context::urn_prefix();
        if !urn_prefix.is_empty() {
            prefix = format!("{urn_prefix}:{prefix}");
        }
        if self.invalidation_tracking {
            prefix = format!("{{{prefix}}}");
        }

        let mut urn = prefix.clone();
        if !self.args.is_empty() {
            let joined: Vec<String> = self
                .args
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            urn.push('?');
            urn.push_str(&joined.join("&"));
        }
        urn.push('#');
        urn.push_str(&self.use_case);

        GCacheKey {
            key_type: self.key_type,
            id: self.id,
            use_case: self.use_case,
            args: self.args,
            invalidation_tracking: self.invalidation_tracking,
            default_config: self.default_config,
            codec: self.codec,
            prefix,
            urn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(key: &GCacheKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_urn_format_plain() {
        let key = GCacheKey::builder("user_id", "42", "users.load")
            .arg("flag", "true")
            .arg("depth", "3")
            .build();
        assert_eq!(key.urn(), "urn:user_id:42?depth=3&flag=true#users.load");
        assert_eq!(key.prefix(), "urn:user_id:42");
    }

    #[test]
    fn test_urn_format_tracked() {
        let key = GCacheKey::builder("user_id", "42", "users.load")
            .track_for_invalidation(true)
            .build();
        assert_eq!(key.urn(), "{urn:user_id:42}#users.load");
        assert_eq!(key.watermark_key(), "{urn:user_id:42}#watermark");
    }

    #[test]
    fn test_urn_without_args_has_no_query() {
        let key = GCacheKey::builder("t", "1", "uc").build();
        assert_eq!(key.urn(), "urn:t:1#uc");
    }

    #[test]
    fn test_equality_ignores_arg_insertion_order() {
        let a = GCacheKey::builder("t", "1", "uc")
            .arg("a", "1")
            .arg("b", "2")
            .build();
        let b = GCacheKey::builder("t", "1", "uc")
            .arg("b", "2")
            .arg("a", "1")
            .build();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.urn(), b.urn());
    }

    #[test]
    fn test_inequality_on_different_args() {
        let a = GCacheKey::builder("t", "1", "uc").arg("a", "1").build();
        let b = GCacheKey::builder("t", "1", "uc").arg("a", "2").build();
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_urn_is_deterministic_under_arg_shuffle(
            arg_map in proptest::collection::hash_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 0..6),
            shuffle in any::<u64>(),
        ) {
            let args: Vec<(String, String)> = arg_map.into_iter().collect();
            let key = GCacheKey::builder("t", "1", "uc")
                .args(args.clone())
                .build();

            let mut shuffled = args.clone();
            // Deterministic pseudo-shuffle driven by the seed.
            if !shuffled.is_empty() {
                let len = shuffled.len();
                for i in 0..len {
                    let j = (shuffle as usize).wrapping_add(i * 7) % len;
                    shuffled.swap(i, j);
                }
            }
            let reordered = GCacheKey::builder("t", "1", "uc")
                .args(shuffled)
                .build();

            prop_assert_eq!(key.urn(), reordered.urn());
            prop_assert_eq!(key, reordered);
        }
    }
}
