use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// opaque, stable identifier of a network participant
pub type Identity = String;

/// one participant's label for a subject: the name and the logical time it was given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, u64)", into = "(String, u64)")]
pub struct Claim {
    pub name: String,
    pub timestamp: u64,
}

impl Claim {
    pub fn new(name: impl Into<String>, timestamp: u64) -> Self {
        Claim {
            name: name.into(),
            timestamp,
        }
    }
}

impl From<(String, u64)> for Claim {
    fn from((name, timestamp): (String, u64)) -> Self {
        Claim { name, timestamp }
    }
}

impl From<Claim> for (String, u64) {
    fn from(claim: Claim) -> Self {
        (claim.name, claim.timestamp)
    }
}

/// everything the network says about one subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutRecord {
    /// claimant -> claim
    #[serde(default)]
    pub name: HashMap<Identity, Claim>,
}

/// subject -> what the network says about it
pub type AboutRecords = HashMap<Identity, AboutRecord>;

/// identity -> Some(true) following, Some(false) blocking, None neither
pub type RelationMap = IndexMap<Identity, Option<bool>>;

/// returned Error for failed calls into the identity service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

/// The external network-identity service, as far as this crate needs it.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// the identity of the local user
    async fn whoami(&self) -> Result<Identity, FetchError>;

    /// self-descriptions for a batch of subjects, in one round trip
    async fn fetch_self_descriptions(&self, ids: &[Identity]) -> Result<AboutRecords, FetchError>;

    /// the follow/block relations `local` has declared
    async fn fetch_relations(&self, local: &str) -> Result<RelationMap, FetchError>;
}

/// a call received by [`MemoryIdentityService`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Whoami,
    SelfDescriptions(Vec<Identity>),
    Relations(Identity),
}

#[derive(Debug, Default, Deserialize)]
struct Fixture {
    me: Identity,
    #[serde(default)]
    about: AboutRecords,
    #[serde(default)]
    relations: RelationMap,
}

/// returned Error for fixture loading failures
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid fixture: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Identity service answering from memory.
///
/// Serves a fixed social graph, remembers every request made of it and can be
/// taken offline so that every call fails.
#[derive(Debug, Default)]
pub struct MemoryIdentityService {
    fixture: Fixture,
    requests: Mutex<Vec<Request>>,
    offline: AtomicBool,
}

impl MemoryIdentityService {
    /// create a service for the local identity `me` with no graph data
    pub fn new(me: impl Into<Identity>) -> Self {
        MemoryIdentityService {
            fixture: Fixture {
                me: me.into(),
                ..Fixture::default()
            },
            ..MemoryIdentityService::default()
        }
    }

    /// load the service contents from a JSON fixture file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, FixtureError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, FixtureError> {
        let fixture: Fixture = serde_json::from_str(text)?;
        Ok(MemoryIdentityService {
            fixture,
            ..MemoryIdentityService::default()
        })
    }

    /// record that `claimant` calls `subject` by `name`
    pub fn with_claim(mut self, subject: &str, claimant: &str, name: &str, timestamp: u64) -> Self {
        self.fixture
            .about
            .entry(subject.to_string())
            .or_default()
            .name
            .insert(claimant.to_string(), Claim::new(name, timestamp));
        self
    }

    /// record a relation of the local identity
    pub fn with_relation(mut self, id: &str, relation: Option<bool>) -> Self {
        self.fixture.relations.insert(id.to_string(), relation);
        self
    }

    /// make every following call fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// every request received so far, oldest first
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    /// the id batches requested through `fetch_self_descriptions`
    pub fn name_requests(&self) -> Vec<Vec<Identity>> {
        self.requests
            .lock()
            .iter()
            .filter_map(|r| match r {
                Request::SelfDescriptions(ids) => Some(ids.clone()),
                _ => None,
            })
            .collect()
    }

    fn receive(&self, request: Request) -> Result<(), FetchError> {
        tracing::debug!("identity service: {:?}", request);
        self.requests.lock().push(request);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::FetchFailed("identity service offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityService for MemoryIdentityService {
    async fn whoami(&self) -> Result<Identity, FetchError> {
        self.receive(Request::Whoami)?;
        Ok(self.fixture.me.clone())
    }

    async fn fetch_self_descriptions(&self, ids: &[Identity]) -> Result<AboutRecords, FetchError> {
        self.receive(Request::SelfDescriptions(ids.to_vec()))?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.fixture
                    .about
                    .get(id)
                    .map(|record| (id.clone(), record.clone()))
            })
            .collect())
    }

    async fn fetch_relations(&self, local: &str) -> Result<RelationMap, FetchError> {
        self.receive(Request::Relations(local.to_string()))?;
        if local == self.fixture.me {
            Ok(self.fixture.relations.clone())
        } else {
            Ok(RelationMap::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_parse_fixture() {
        let service = MemoryIdentityService::from_json(
            r#"{
                "me": "me123",
                "about": { "you123": { "name": { "you123": ["you", 3] } } },
                "relations": { "a": true, "b": false, "c": null }
            }"#,
        )
        .unwrap();

        assert_eq!(service.fixture.me, "me123");
        assert_eq!(
            service.fixture.about["you123"].name["you123"],
            Claim::new("you", 3)
        );
        let relations: Vec<_> = service.fixture.relations.into_iter().collect();
        assert_eq!(
            relations,
            vec![
                ("a".to_string(), Some(true)),
                ("b".to_string(), Some(false)),
                ("c".to_string(), None)
            ]
        );
    }

    #[test]
    fn rejects_malformed_fixture() {
        let err = MemoryIdentityService::from_json(r#"{ "about": {} }"#).unwrap_err();
        assert!(matches!(err, FixtureError::Parse(_)));
    }

    #[tokio::test]
    async fn serves_only_requested_subjects() {
        let service = MemoryIdentityService::new("me123")
            .with_claim("a", "a", "alice", 1)
            .with_claim("b", "b", "bob", 1);

        let records = service
            .fetch_self_descriptions(&["a".to_string(), "z".to_string()])
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert!(records.contains_key("a"));
        assert_eq!(
            service.requests(),
            vec![Request::SelfDescriptions(vec!["a".into(), "z".into()])]
        );
    }

    #[tokio::test]
    async fn offline_service_fails_and_still_records() {
        let service = MemoryIdentityService::new("me123");
        service.set_offline(true);

        assert!(matches!(
            service.whoami().await,
            Err(FetchError::FetchFailed(_))
        ));
        assert_eq!(service.requests(), vec![Request::Whoami]);

        service.set_offline(false);
        assert_eq!(service.whoami().await.unwrap(), "me123");
    }
}
