use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt::Display,
    hash::{Hash, Hasher},
};
use uuid::Uuid;

/// An immutable read-only snapshot as held by some store.
///
/// Identity is global: two stores hold the same snapshot iff one's `uuid`
/// matches the other's `uuid` or `received_uuid`. Equality and hashing use
/// `uuid` alone; ordering is by `(otime, uuid)` so that planner traversals
/// are deterministic.
#[derive(Serialize, Deserialize, Clone, Debug, Eq)]
pub struct Volume {
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub received_uuid: Option<Uuid>,
    pub otime: DateTime<Utc>,
    /// Approximate exclusive usage in bytes. Zero when the holding store has
    /// no size accounting for this snapshot.
    pub size: u64,
    /// Store-relative locations, used for exclusion filtering.
    pub paths: Vec<String>,
}

impl PartialEq for Volume {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
    }
}

impl Hash for Volume {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uuid.hash(state);
    }
}

impl Ord for Volume {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.otime, self.uuid).cmp(&(other.otime, other.uuid))
    }
}

impl PartialOrd for Volume {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.paths.first() {
            Some(path) => write!(f, "{} ({})", path, self.uuid),
            None => write!(f, "{}", self.uuid),
        }
    }
}

impl Volume {
    /// Whether this volume materializes the snapshot identified by `uuid`,
    /// either directly or as the received copy of it.
    pub fn mirrors(&self, uuid: Uuid) -> bool {
        self.uuid == uuid || self.received_uuid == Some(uuid)
    }
}

/// A candidate parent→child transfer. `from_uuid = None` is a full send.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Diff {
    pub to_uuid: Uuid,
    pub from_uuid: Option<Uuid>,
    /// Name of the store that can supply the bytes.
    pub sink: String,
    /// Estimated or measured stream size in bytes.
    pub size: u64,
    /// True when `size` came from measurement rather than estimation.
    pub exact: bool,
}

impl Display for Diff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.from_uuid {
            Some(from) => write!(f, "{} -> {} from {}", from, self.to_uuid, self.sink),
            None => write!(f, "full -> {} from {}", self.to_uuid, self.sink),
        }
    }
}

/// Resolves every uuid in an equivalence class (`uuid == received_uuid`
/// links) to a single canonical identity, the source-side uuid.
///
/// Received links can in principle chain (a restored snapshot re-sent to a
/// further store); resolution follows the chain with a revisit guard so that
/// corrupted metadata cannot loop it.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    links: HashMap<Uuid, Uuid>,
}

impl IdentityIndex {
    pub fn build<'a>(volumes: impl Iterator<Item = &'a Volume>) -> Self {
        let mut links = HashMap::new();
        for volume in volumes {
            if let Some(received) = volume.received_uuid {
                links.insert(volume.uuid, received);
            }
        }
        Self { links }
    }

    pub fn resolve(&self, uuid: Uuid) -> Uuid {
        let mut current = uuid;
        let mut hops = 0;
        while let Some(&next) = self.links.get(&current) {
            hops += 1;
            if next == uuid || hops > self.links.len() {
                slog_scope::warn!("received uuid chain loops at {}, using it unresolved", uuid);
                return uuid;
            }
            current = next;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn volume(uuid: u128, otime: i64) -> Volume {
        Volume {
            uuid: Uuid::from_u128(uuid),
            parent_uuid: None,
            received_uuid: None,
            otime: Utc.timestamp(otime, 0),
            size: 0,
            paths: vec![],
        }
    }

    #[test]
    fn equality_ignores_everything_but_uuid() {
        let mut a = volume(1, 100);
        let mut b = volume(1, 999);
        a.size = 10;
        b.paths = vec![String::from("elsewhere")];
        assert_eq!(a, b);
    }

    #[test]
    fn ordering_is_otime_then_uuid() {
        let early = volume(9, 100);
        let late = volume(1, 200);
        let late_same_time = volume(2, 200);
        assert!(early < late);
        assert!(late < late_same_time);
    }

    #[test]
    fn mirrors_by_received_uuid() {
        let mut copy = volume(7, 100);
        copy.received_uuid = Some(Uuid::from_u128(1));
        assert!(copy.mirrors(Uuid::from_u128(1)));
        assert!(copy.mirrors(Uuid::from_u128(7)));
        assert!(!copy.mirrors(Uuid::from_u128(2)));
    }

    #[test]
    fn identity_resolves_received_copies() {
        let source = volume(1, 100);
        let mut copy = volume(7, 100);
        copy.received_uuid = Some(source.uuid);
        let index = IdentityIndex::build(vec![&source, &copy].into_iter());
        assert_eq!(index.resolve(copy.uuid), source.uuid);
        assert_eq!(index.resolve(source.uuid), source.uuid);
    }

    #[test]
    fn identity_tolerates_looping_links() {
        let mut a = volume(1, 100);
        let mut b = volume(2, 100);
        a.received_uuid = Some(b.uuid);
        b.received_uuid = Some(a.uuid);
        let index = IdentityIndex::build(vec![&a, &b].into_iter());
        assert_eq!(index.resolve(a.uuid), a.uuid);
    }
}
