use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hcm_core::entity::{Entity, IdField};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    tenant_id: String,
    field: IdField,
    value: String,
}

struct CachedEntity<E> {
    entity: E,
    expires_at: Instant,
}

/// Read-through cache of the latest known version of each entity, addressable
/// by both `id` and `clientReferenceId`. A zero TTL disables caching.
pub struct EntityCache<E> {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CachedEntity<E>>>,
}

impl<E: Entity> EntityCache<E> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores each entity under both identifiers. An older row version never
    /// replaces a newer cached one.
    pub fn put(&self, entities: &[E]) {
        if self.ttl.is_zero() {
            return;
        }
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.entries.lock().expect("entity cache lock");
        for entity in entities {
            for field in [IdField::Id, IdField::ClientReferenceId] {
                let Some(value) = field.value_of(entity) else {
                    continue;
                };
                let key = CacheKey {
                    tenant_id: entity.tenant_id().to_string(),
                    field,
                    value: value.to_string(),
                };
                let newer = entries.get(&key).map_or(true, |cached| {
                    cached.entity.row_version() <= entity.row_version()
                });
                if newer {
                    entries.insert(
                        key,
                        CachedEntity {
                            entity: entity.clone(),
                            expires_at,
                        },
                    );
                }
            }
        }
    }

    pub fn get(&self, tenant_id: &str, field: IdField, value: &str) -> Option<E> {
        let key = CacheKey {
            tenant_id: tenant_id.to_string(),
            field,
            value: value.to_string(),
        };
        let mut entries = self.entries.lock().expect("entity cache lock");
        match entries.get(&key) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.entity.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("entity cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcm_core::domain::ProjectFacility;
    use hcm_core::entity::EntityMeta;

    fn facility(version: i64) -> ProjectFacility {
        ProjectFacility {
            meta: EntityMeta {
                id: Some("pf-1".into()),
                client_reference_id: Some("c-1".into()),
                tenant_id: "t1".into(),
                row_version: version,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn entries_are_reachable_by_both_identifiers() {
        let cache = EntityCache::new(Duration::from_secs(60));
        cache.put(&[facility(1)]);

        assert!(cache.get("t1", IdField::Id, "pf-1").is_some());
        assert!(cache.get("t1", IdField::ClientReferenceId, "c-1").is_some());
        assert!(cache.get("t2", IdField::Id, "pf-1").is_none());
    }

    #[test]
    fn older_versions_do_not_replace_newer_ones() {
        let cache = EntityCache::new(Duration::from_secs(60));
        cache.put(&[facility(3)]);
        cache.put(&[facility(2)]);

        let cached = cache.get("t1", IdField::Id, "pf-1").expect("cached");
        assert_eq!(cached.meta.row_version, 3);
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = EntityCache::new(Duration::from_millis(1));
        cache.put(&[facility(1)]);
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.get("t1", IdField::Id, "pf-1").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache = EntityCache::new(Duration::ZERO);
        cache.put(&[facility(1)]);
        assert!(cache.is_empty());
    }
}
