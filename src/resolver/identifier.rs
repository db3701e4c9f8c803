use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheEntry, IdentifierCache, LookupKind};
use crate::error::Result;
use crate::models::object_class;
use crate::storage::SqliteStorage;

static URL_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("valid scheme regex"));

/// True for `scheme://…` values, which always point outside the import.
pub(crate) fn has_url_scheme(raw: &str) -> bool {
    URL_SCHEME.is_match(raw.trim())
}

/// Parsed `xlink:href` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference<'a> {
    /// gml:id inside the document being imported
    Local(&'a str),
    /// Target in another document, which the importer never follows
    Remote {
        document: &'a str,
        fragment: Option<&'a str>,
    },
}

impl<'a> Reference<'a> {
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        if let Some(local) = raw.strip_prefix('#') {
            return Reference::Local(local);
        }

        if has_url_scheme(raw) {
            return match raw.split_once('#') {
                Some((document, fragment)) => Reference::Remote {
                    document,
                    fragment: Some(fragment).filter(|f| !f.is_empty()),
                },
                None => Reference::Remote {
                    document: raw,
                    fragment: None,
                },
            };
        }

        match raw.split_once('#') {
            Some((document, fragment)) if !document.is_empty() => Reference::Remote {
                document,
                fragment: Some(fragment).filter(|f| !f.is_empty()),
            },
            _ => Reference::Local(raw),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Reference::Remote { .. })
    }
}

/// Store id a reference resolved to, with the orientation accumulated on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedReference {
    pub id: i64,
    pub root_id: i64,
    pub reverse: bool,
    pub object_class: i32,
}

/// Resolves gml:ids through the identifier cache, chasing indirections, with a
/// direct store lookup as fallback.
pub struct IdentifierResolver {
    cache: Arc<dyn IdentifierCache>,
    storage: SqliteStorage,
    max_depth: usize,
}

impl IdentifierResolver {
    pub fn new(cache: Arc<dyn IdentifierCache>, storage: SqliteStorage, max_depth: usize) -> Self {
        Self {
            cache,
            storage,
            max_depth: max_depth.max(1),
        }
    }

    pub fn cache(&self) -> &Arc<dyn IdentifierCache> {
        &self.cache
    }

    /// `Ok(None)` means the reference cannot be resolved yet.
    pub async fn resolve(
        &self,
        reference: &str,
        kind: LookupKind,
        force_store_fallback: bool,
    ) -> Result<Option<ResolvedReference>> {
        let mut current = strip_marker(reference).to_string();
        let mut reverse = false;
        let mut root_hint: Option<i64> = None;
        let mut visited: HashSet<String> = HashSet::new();

        loop {
            if !visited.insert(current.clone()) {
                tracing::debug!("Indirection cycle through '{}' ({:?})", current, kind);
                return Ok(None);
            }
            if visited.len() > self.max_depth {
                tracing::warn!(
                    "Indirection chain from '{}' exceeds {} hops",
                    reference,
                    self.max_depth
                );
                return Ok(None);
            }

            match self.cache.get(&current, kind).await? {
                Some(CacheEntry::Resolved {
                    id,
                    root_id,
                    reverse: hop_reverse,
                    object_class,
                }) => {
                    reverse ^= hop_reverse;
                    if id > 0 {
                        return Ok(Some(ResolvedReference {
                            id,
                            root_id,
                            reverse,
                            object_class,
                        }));
                    }
                    if root_id > 0 {
                        root_hint = Some(root_id);
                    }
                    break;
                }
                Some(CacheEntry::Indirection {
                    mapping,
                    reverse: hop_reverse,
                    root_id,
                }) => {
                    reverse ^= hop_reverse;
                    current = strip_marker(&mapping).to_string();
                    // With a known tree the mapped id is looked up inside it
                    if let Some(root_id) = root_id.filter(|r| *r > 0) {
                        root_hint = Some(root_id);
                        break;
                    }
                }
                None => break,
            }
        }

        self.store_fallback(&current, kind, reverse, root_hint, force_store_fallback)
            .await
    }

    async fn store_fallback(
        &self,
        gmlid: &str,
        kind: LookupKind,
        reverse: bool,
        root_hint: Option<i64>,
        force: bool,
    ) -> Result<Option<ResolvedReference>> {
        match kind {
            LookupKind::Geometry => {
                if let Some(root_id) = root_hint {
                    if let Some((id, root_id)) =
                        self.storage.find_geometry(gmlid, Some(root_id)).await?
                    {
                        return Ok(Some(geometry(id, root_id, reverse)));
                    }
                    if !force {
                        return Ok(None);
                    }
                }
                Ok(self
                    .storage
                    .find_geometry(gmlid, None)
                    .await?
                    .map(|(id, root_id)| geometry(id, root_id, reverse)))
            }
            LookupKind::Feature if force => Ok(self.storage.find_feature(gmlid).await?.map(
                |(id, object_class)| ResolvedReference {
                    id,
                    root_id: id,
                    reverse,
                    object_class,
                },
            )),
            LookupKind::SurfaceData if force => Ok(self
                .storage
                .find_surface_data(gmlid)
                .await?
                .map(|(id, object_class)| ResolvedReference {
                    id,
                    root_id: id,
                    reverse,
                    object_class,
                })),
            _ => Ok(None),
        }
    }
}

fn strip_marker(reference: &str) -> &str {
    let reference = reference.trim();
    reference.strip_prefix('#').unwrap_or(reference)
}

fn geometry(id: i64, root_id: i64, reverse: bool) -> ResolvedReference {
    ResolvedReference {
        id,
        root_id,
        reverse,
        object_class: object_class::SURFACE_GEOMETRY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryIdentifierCache;
    use crate::test_support::{insert_cityobject, insert_geometry, node, test_storage};

    fn resolved(id: i64, reverse: bool) -> CacheEntry {
        CacheEntry::Resolved {
            id,
            root_id: id,
            reverse,
            object_class: object_class::SURFACE_GEOMETRY,
        }
    }

    fn indirection(mapping: &str, reverse: bool) -> CacheEntry {
        CacheEntry::Indirection {
            mapping: mapping.to_string(),
            reverse,
            root_id: None,
        }
    }

    #[test]
    fn test_reference_parse() {
        assert_eq!(Reference::parse("#poly_1"), Reference::Local("poly_1"));
        assert_eq!(Reference::parse("poly_1"), Reference::Local("poly_1"));
        assert_eq!(
            Reference::parse("other.gml#poly_1"),
            Reference::Remote {
                document: "other.gml",
                fragment: Some("poly_1")
            }
        );
        assert_eq!(
            Reference::parse("http://example.org/city.gml"),
            Reference::Remote {
                document: "http://example.org/city.gml",
                fragment: None
            }
        );
        assert!(Reference::parse("file:///data/a.gml#x").is_remote());
        assert!(!Reference::parse("#x").is_remote());
    }

    #[tokio::test]
    async fn test_chain_xors_every_hop() {
        let (storage, _temp) = test_storage().await;
        let cache = Arc::new(MemoryIdentifierCache::new());
        // a -(rev)-> b -(rev)-> c -(rev)-> d = Resolved(rev)
        cache.put("a", LookupKind::Geometry, indirection("#b", true)).await.unwrap();
        cache.put("b", LookupKind::Geometry, indirection("c", true)).await.unwrap();
        cache.put("c", LookupKind::Geometry, indirection("d", true)).await.unwrap();
        cache.put("d", LookupKind::Geometry, resolved(40, true)).await.unwrap();
        let resolver = IdentifierResolver::new(cache, storage, 32);

        // Four flags set: XOR is false
        let result = resolver.resolve("#a", LookupKind::Geometry, false).await.unwrap().unwrap();
        assert_eq!(result.id, 40);
        assert!(!result.reverse);

        // Three flags set: XOR is true
        let result = resolver.resolve("b", LookupKind::Geometry, false).await.unwrap().unwrap();
        assert!(result.reverse);
    }

    #[tokio::test]
    async fn test_indirection_cycle_terminates() {
        let (storage, _temp) = test_storage().await;
        let cache = Arc::new(MemoryIdentifierCache::new());
        cache.put("a", LookupKind::Feature, indirection("b", false)).await.unwrap();
        cache.put("b", LookupKind::Feature, indirection("a", true)).await.unwrap();
        let resolver = IdentifierResolver::new(cache, storage, 32);

        assert_eq!(resolver.resolve("a", LookupKind::Feature, true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chain_longer_than_bound_is_rejected() {
        let (storage, _temp) = test_storage().await;
        let cache = Arc::new(MemoryIdentifierCache::new());
        for i in 0..10 {
            let next = indirection(&format!("n{}", i + 1), false);
            cache
                .put(&format!("n{}", i), LookupKind::Geometry, next)
                .await
                .unwrap();
        }
        cache.put("n10", LookupKind::Geometry, resolved(5, false)).await.unwrap();

        let bounded = IdentifierResolver::new(cache.clone(), storage.clone(), 4);
        assert_eq!(bounded.resolve("n0", LookupKind::Geometry, false).await.unwrap(), None);

        let roomy = IdentifierResolver::new(cache, storage, 32);
        assert_eq!(
            roomy.resolve("n0", LookupKind::Geometry, false).await.unwrap().map(|r| r.id),
            Some(5)
        );
    }

    #[tokio::test]
    async fn test_cache_hit_and_store_fallback_agree() {
        let (storage, _temp) = test_storage().await;
        insert_geometry(&storage, &node(10, Some("poly"), None, 10)).await;

        let warm = Arc::new(MemoryIdentifierCache::new());
        warm.put("poly", LookupKind::Geometry, resolved(10, false)).await.unwrap();
        let from_cache = IdentifierResolver::new(warm, storage.clone(), 32)
            .resolve("#poly", LookupKind::Geometry, false)
            .await
            .unwrap();

        let cold = Arc::new(MemoryIdentifierCache::new());
        let from_store = IdentifierResolver::new(cold, storage, 32)
            .resolve("#poly", LookupKind::Geometry, true)
            .await
            .unwrap();

        assert!(from_cache.is_some());
        assert_eq!(from_cache, from_store);
    }

    #[tokio::test]
    async fn test_indirection_with_root_uses_tree_lookup() {
        let (storage, _temp) = test_storage().await;
        insert_geometry(&storage, &node(1, Some("solid"), None, 1)).await;
        insert_geometry(&storage, &node(2, Some("shell"), Some(1), 1)).await;
        insert_geometry(&storage, &node(7, Some("shell"), None, 7)).await;

        let cache = Arc::new(MemoryIdentifierCache::new());
        cache
            .put(
                "alias",
                LookupKind::Geometry,
                CacheEntry::Indirection {
                    mapping: "shell".to_string(),
                    reverse: true,
                    root_id: Some(1),
                },
            )
            .await
            .unwrap();
        let resolver = IdentifierResolver::new(cache, storage, 32);

        let result = resolver.resolve("alias", LookupKind::Geometry, false).await.unwrap().unwrap();
        assert_eq!((result.id, result.root_id, result.reverse), (2, 1, true));
    }

    #[tokio::test]
    async fn test_feature_fallback_only_when_forced() {
        let (storage, _temp) = test_storage().await;
        insert_cityobject(&storage, 3, "GRP", object_class::CITY_OBJECT_GROUP).await;
        let resolver =
            IdentifierResolver::new(Arc::new(MemoryIdentifierCache::new()), storage, 32);

        assert_eq!(resolver.resolve("GRP", LookupKind::Feature, false).await.unwrap(), None);
        let forced = resolver.resolve("GRP", LookupKind::Feature, true).await.unwrap().unwrap();
        assert_eq!((forced.id, forced.object_class), (3, object_class::CITY_OBJECT_GROUP));
    }
}
