use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;

use crate::events::{EventBus, FRIENDS_CHANGED};
use crate::identity::{FetchError, Identity, IdentityService, RelationMap};
use crate::names::NameResolver;
use crate::state::{Snapshot, Store};

/// store table of the local identity's relations
pub const FRIENDS: &str = "friends";

/// the local identity's relations, split by kind
///
/// An identity is in at most one of the two lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSet {
    pub following: Vec<Identity>,
    pub blocking: Vec<Identity>,
}

impl FriendSet {
    /// split a raw relation map, keeping its order
    pub fn from_relations(relations: &RelationMap) -> Self {
        let mut friends = FriendSet::default();
        for (id, relation) in relations {
            match relation {
                Some(true) => friends.following.push(id.clone()),
                Some(false) => friends.blocking.push(id.clone()),
                None => {}
            }
        }
        friends
    }

    /// everyone mentioned, followed identities first
    pub fn identities(&self) -> Vec<Identity> {
        self.following
            .iter()
            .chain(&self.blocking)
            .cloned()
            .collect()
    }
}

/// returned Error for failed relation refreshes
#[derive(Error, Debug)]
pub enum FriendsError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// `update_friends` needs to know whose relations to fetch
    #[error("local identity is not known yet")]
    NoLocalIdentity,
}

/// Keeps the local identity's friend set in the store.
#[derive(Clone)]
pub struct Friends {
    store: Arc<Store>,
    bus: EventBus,
    service: Arc<dyn IdentityService>,
    names: Arc<dyn NameResolver>,
}

impl Friends {
    pub fn new(
        store: Arc<Store>,
        bus: EventBus,
        service: Arc<dyn IdentityService>,
        names: Arc<dyn NameResolver>,
    ) -> Self {
        Friends {
            store,
            bus,
            service,
            names,
        }
    }

    /// refetch the local identity's relations and replace the friend set
    ///
    /// On failure the previous friend set stays and nothing is emitted.
    pub async fn update_friends(&self) -> Result<FriendSet, FriendsError> {
        let me = self.store.me().ok_or(FriendsError::NoLocalIdentity)?;
        let relations = self.service.fetch_relations(&me).await?;
        let friends = FriendSet::from_relations(&relations);

        self.store.set(&[FRIENDS], json!(friends));
        tracing::debug!(
            "friends: following {}, blocking {}",
            friends.following.len(),
            friends.blocking.len()
        );
        self.bus.emit(
            FRIENDS_CHANGED,
            json!({
                "following": friends.following.len(),
                "blocking": friends.blocking.len(),
            }),
        );
        self.names.bulk_names(&friends.identities());
        Ok(friends)
    }

    /// the friend set as an immutable snapshot
    pub fn get_friends(&self) -> Snapshot {
        self.store.snapshot(&[FRIENDS])
    }

    /// the friend set as a plain struct; empty before the first refresh
    pub fn get_friends_plain(&self) -> FriendSet {
        self.store.get_as(&[FRIENDS]).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityService;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    /// remembers what it was asked to resolve
    #[derive(Default)]
    struct RecordingResolver {
        bulk_calls: Mutex<Vec<Vec<Identity>>>,
    }

    impl NameResolver for RecordingResolver {
        fn get_name(&self, id: &str) -> String {
            id.to_string()
        }

        fn bulk_names(&self, ids: &[Identity]) {
            self.bulk_calls.lock().push(ids.to_vec());
        }
    }

    struct Fixture {
        friends: Friends,
        store: Arc<Store>,
        bus: EventBus,
        service: Arc<MemoryIdentityService>,
        names: Arc<RecordingResolver>,
    }

    fn fixture(service: MemoryIdentityService) -> Fixture {
        let store = Arc::new(Store::new());
        store.set_me("me123");
        let bus = EventBus::start(Duration::from_secs(1), 16);
        let service = Arc::new(service);
        let names = Arc::new(RecordingResolver::default());
        let friends = Friends::new(
            Arc::clone(&store),
            bus.clone(),
            service.clone(),
            names.clone(),
        );
        Fixture {
            friends,
            store,
            bus,
            service,
            names,
        }
    }

    fn abc() -> MemoryIdentityService {
        MemoryIdentityService::new("me123")
            .with_relation("a", Some(true))
            .with_relation("b", Some(false))
            .with_relation("c", Some(true))
    }

    #[tokio::test(start_paused = true)]
    async fn update_friends_partitions_relations() {
        let f = fixture(abc());
        let mut changed = f.bus.subscribe(FRIENDS_CHANGED);

        f.friends.update_friends().await.unwrap();

        assert_eq!(
            f.store.get_in(&[FRIENDS, "following"]),
            Some(json!(["a", "c"]))
        );
        assert_eq!(f.store.get_in(&[FRIENDS, "blocking"]), Some(json!(["b"])));

        f.bus.flush().await;
        assert!(changed.try_recv().is_ok());
        assert_eq!(changed.try_recv(), Err(TryRecvError::Empty));

        assert_eq!(
            *f.names.bulk_calls.lock(),
            vec![vec!["a".to_string(), "c".to_string(), "b".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn neutral_relations_are_dropped() {
        let f = fixture(abc().with_relation("d", None));

        let friends = f.friends.update_friends().await.unwrap();

        assert_eq!(friends.identities(), vec!["a", "c", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_replaces_the_whole_set() {
        let f = fixture(abc());
        f.store.set(
            &[FRIENDS],
            json!({ "following": ["b", "z"], "blocking": ["a"] }),
        );

        f.friends.update_friends().await.unwrap();

        assert_eq!(
            f.friends.get_friends_plain(),
            FriendSet {
                following: vec!["a".into(), "c".into()],
                blocking: vec!["b".into()],
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_previous_set() {
        let f = fixture(abc());
        f.friends.update_friends().await.unwrap();
        f.bus.flush().await;
        let mut changed = f.bus.subscribe(FRIENDS_CHANGED);
        let before = f.friends.get_friends();
        let version = f.store.version();

        f.service.set_offline(true);
        let err = f.friends.update_friends().await.unwrap_err();
        assert!(matches!(err, FriendsError::Fetch(FetchError::FetchFailed(_))));

        f.bus.flush().await;
        assert_eq!(changed.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(f.store.version(), version);
        assert_eq!(f.friends.get_friends(), before);
        assert_eq!(f.names.bulk_calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn needs_a_local_identity() {
        let f = fixture(abc());
        f.store.set(&["me"], serde_json::Value::Null);

        let err = f.friends.update_friends().await.unwrap_err();

        assert!(matches!(err, FriendsError::NoLocalIdentity));
        assert!(f.service.requests().is_empty());
        assert_eq!(f.friends.get_friends().value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_and_plain_views_agree() {
        let f = fixture(abc());
        let table = json!({ "following": ["a"], "blocking": ["b"] });
        f.store.set(&[FRIENDS], table.clone());

        assert_eq!(f.friends.get_friends(), table);
        assert_eq!(
            f.friends.get_friends_plain(),
            FriendSet {
                following: vec!["a".into()],
                blocking: vec!["b".into()],
            }
        );
    }

    #[test]
    fn empty_before_first_refresh() {
        let store = Arc::new(Store::new());
        assert_eq!(store.get_as::<FriendSet>(&[FRIENDS]), None);
        assert_eq!(FriendSet::default().identities(), Vec::<Identity>::new());
    }
}
