//! Tags and tag-driven invalidation
//!
//! Every cache write carries a set of tags. The remote backend keeps one set per
//! tag (`{version}#tag:{tag}`) listing the keys that carry it, written in the
//! same atomic batch as the value. Invalidating a tag unions those sets,
//! deletes the keys and then the sets themselves. Stale members (keys that
//! already expired) are harmless and disappear on the next invalidation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::CacheError;
use crate::remote::{RemoteStore, with_timeout};

/// Label attached to cache keys for bulk invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    /// Every key of `entity`
    pub fn entity(entity: &str) -> Self {
        Tag(entity.to_owned())
    }

    /// Every key that resolved to the record `primary_key` of `entity`
    pub fn record(entity: &str, primary_key: impl fmt::Display) -> Self {
        Tag(format!("{}:pk={}", entity, primary_key))
    }

    /// Keys sharing a combination of field values. Field order is irrelevant.
    pub fn fields<I, K, V>(entity: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: fmt::Display,
        V: fmt::Display,
    {
        let mut parts: Vec<String> = fields
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        parts.sort();
        Tag(format!("{}:{}", entity, parts.join("|")))
    }

    pub fn custom(tag: impl Into<String>) -> Self {
        Tag(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives "smart" tags from notable fields of a value being cached
pub type ValueTagger<V> = Arc<dyn Fn(&V) -> Vec<Tag> + Send + Sync>;

/// Remote key of the set holding every key tagged with `tag`.
///
/// Cache keys continue the version with `:`, tag sets with `#`, so the two
/// namespaces never overlap whatever the entity name or query body.
pub fn remote_tag_key(cache_version: &str, tag: &Tag) -> String {
    format!("{}#tag:{}", cache_version, tag)
}

/// Merge tag lists, dropping duplicates while keeping first-seen order.
pub fn merge_tags(base: Vec<Tag>, extra: impl IntoIterator<Item = Tag>) -> Vec<Tag> {
    let mut tags = base;
    for tag in extra {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

/// Delete every remote key registered under any of `tags`, plus the tag sets.
/// Returns the number of distinct keys removed.
pub async fn invalidate_remote(
    store: &dyn RemoteStore,
    cache_version: &str,
    tags: &[Tag],
    timeout: Duration,
) -> Result<u64, CacheError> {
    if tags.is_empty() {
        return Ok(0);
    }
    let tag_keys: Vec<String> = tags
        .iter()
        .map(|t| remote_tag_key(cache_version, t))
        .collect();

    let keys = with_timeout(timeout, store.union_keys_for_tags(&tag_keys)).await?;
    with_timeout(timeout, store.delete_keys_and_tags(&keys, &tag_keys)).await?;

    debug!(
        "Remote tag invalidation of {} tags removed {} keys",
        tags.len(),
        keys.len()
    );
    Ok(keys.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryRemote;

    #[test]
    fn test_tag_shapes() {
        assert_eq!(Tag::entity("users").as_str(), "users");
        assert_eq!(Tag::record("users", 42).as_str(), "users:pk=42");
        assert_eq!(
            Tag::fields("users", [("org", "3"), ("email", "a@b")]),
            Tag::fields("users", [("email", "a@b"), ("org", "3")])
        );
        assert_eq!(
            Tag::fields("users", [("org", 3)]).to_string(),
            "users:org=3"
        );
    }

    #[test]
    fn test_tag_keys_never_collide_with_cache_keys() {
        let tag_key = remote_tag_key("v1", &Tag::entity("users"));
        assert_eq!(tag_key, "v1#tag:users");
        let entry = crate::key::cache_key("v1", "tag", &"users".into());
        assert_ne!(tag_key, entry);
        assert!(!tag_key.starts_with(&crate::key::entity_prefix("v1", "tag")));
    }

    #[test]
    fn test_merge_tags_dedups() {
        let tags = merge_tags(
            vec![Tag::entity("users"), Tag::record("users", 1)],
            vec![Tag::record("users", 1), Tag::custom("vip")],
        );
        assert_eq!(
            tags,
            vec![
                Tag::entity("users"),
                Tag::record("users", 1),
                Tag::custom("vip")
            ]
        );
    }

    #[tokio::test]
    async fn test_invalidate_remote_removes_only_tagged_keys() {
        let remote = MemoryRemote::new();
        let red = remote_tag_key("v1", &Tag::custom("red"));
        let blue = remote_tag_key("v1", &Tag::custom("blue"));
        let ttl = Duration::from_secs(60);

        remote
            .set_with_tags_atomic("a", "1", ttl, &[red.clone()], ttl)
            .await
            .unwrap();
        remote
            .set_with_tags_atomic("b", "2", ttl, &[red.clone(), blue.clone()], ttl)
            .await
            .unwrap();
        remote
            .set_with_tags_atomic("c", "3", ttl, &[blue.clone()], ttl)
            .await
            .unwrap();

        let removed = invalidate_remote(&remote, "v1", &[Tag::custom("red")], ttl)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(remote.get("a").await.unwrap(), None);
        assert_eq!(remote.get("b").await.unwrap(), None);
        assert_eq!(remote.get("c").await.unwrap(), Some("3".to_owned()));
        assert!(!remote.has_key(&red));
        assert!(remote.has_key(&blue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_write_keeps_long_entry_reachable_from_tag() {
        let remote = MemoryRemote::new();
        let tag = Tag::entity("users");
        let tag_key = remote_tag_key("v1", &tag);
        let hour = Duration::from_secs(3600);

        remote
            .set_with_tags_atomic("long", "1", hour * 48, &[tag_key.clone()], hour * 24)
            .await
            .unwrap();
        remote
            .set_with_tags_atomic("short", "2", Duration::from_secs(60), &[tag_key.clone()], hour * 24)
            .await
            .unwrap();
        assert!(remote.tag_ttl(&tag_key).unwrap() > hour * 47);

        tokio::time::advance(hour * 30).await;
        assert_eq!(remote.get("long").await.unwrap(), Some("1".to_owned()));

        let removed = invalidate_remote(&remote, "v1", &[tag], Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(remote.get("long").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_set_expires_after_its_longest_member() {
        let remote = MemoryRemote::new();
        let tag_key = remote_tag_key("v1", &Tag::custom("t"));
        let ttl = Duration::from_secs(60);
        remote
            .set_with_tags_atomic("k", "1", ttl, &[tag_key.clone()], ttl * 2)
            .await
            .unwrap();

        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert!(remote.has_key(&tag_key));
        tokio::time::advance(ttl).await;
        assert!(!remote.has_key(&tag_key));
    }

    #[tokio::test]
    async fn test_invalidate_remote_tolerates_stale_members() {
        let remote = MemoryRemote::new();
        let tag = remote_tag_key("v1", &Tag::entity("users"));
        let ttl = Duration::from_secs(60);
        remote
            .set_with_tags_atomic("gone", "1", ttl, &[tag.clone()], ttl)
            .await
            .unwrap();
        remote.delete("gone").await.unwrap();

        let removed = invalidate_remote(&remote, "v1", &[Tag::entity("users")], ttl)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!remote.has_key(&tag));
    }
}
