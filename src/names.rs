use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::events::{EventBus, AUTHORS_CHANGED};
use crate::identity::{AboutRecords, Claim, FetchError, Identity, IdentityService};
use crate::state::{Snapshot, Store};

/// store table of canonical names, identity -> name
pub const AUTHORS: &str = "authors";

/// The part of name resolution other components lean on: display names that
/// never wait on the network.
///
/// Both calls are synchronous and may be made from any thread.
pub trait NameResolver: Send + Sync {
    /// the canonical name of `id`, or `id` itself while the name is fetched
    fn get_name(&self, id: &str) -> String;

    /// fetch, in the background, the names of whichever `ids` are unknown
    fn bulk_names(&self, ids: &[Identity]);
}

/// choose the canonical name of `id` from everything said about it
///
/// The local identity's label wins outright, then the subject's own label,
/// then the most recent label from anyone else. Equal timestamps go to the
/// greater claimant so the choice never depends on map order.
pub fn good_name<'a>(id: &str, me: Option<&str>, records: &'a AboutRecords) -> Option<&'a Claim> {
    let claims = &records.get(id)?.name;

    if let Some(claim) = me.and_then(|me| claims.get(me)) {
        return Some(claim);
    }
    if let Some(claim) = claims.get(id) {
        return Some(claim);
    }
    claims
        .iter()
        .max_by(|(a_id, a), (b_id, b)| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a_id.cmp(b_id))
        })
        .map(|(_, claim)| claim)
}

/// Resolves identities to canonical names and keeps them in the store.
#[derive(Clone)]
pub struct Authors {
    store: Arc<Store>,
    bus: EventBus,
    service: Arc<dyn IdentityService>,
    in_flight: Arc<Mutex<HashSet<Identity>>>,
    runtime: Handle,
}

impl Authors {
    /// Must be called inside a tokio runtime; background fetches run on it.
    pub fn new(store: Arc<Store>, bus: EventBus, service: Arc<dyn IdentityService>) -> Self {
        Authors {
            store,
            bus,
            service,
            in_flight: Arc::default(),
            runtime: Handle::current(),
        }
    }

    /// pick the canonical name of `id` from `records` and store it
    ///
    /// Returns the stored name; `None` when nothing is known about `id`, in
    /// which case the store is left alone.
    pub fn set_good_name(&self, id: &str, records: &AboutRecords) -> Option<String> {
        let me = self.store.me();
        let claim = good_name(id, me.as_deref(), records)?;
        self.store
            .set(&[AUTHORS, id], Value::String(claim.name.clone()));
        Some(claim.name.clone())
    }

    /// fetch what is said about `ids` in one call and store their names
    ///
    /// Emits a single `authors-changed` however many ids were asked for.
    /// Nothing is written or emitted when the fetch fails.
    pub async fn set_name(&self, ids: &[Identity]) -> Result<(), FetchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let records = self.service.fetch_self_descriptions(ids).await?;

        let resolved: Vec<&Identity> = ids
            .iter()
            .filter(|id| self.set_good_name(id, &records).is_some())
            .collect();
        tracing::debug!(
            "authors: resolved {} of {} requested names",
            resolved.len(),
            ids.len()
        );
        self.bus.emit(AUTHORS_CHANGED, json!(resolved));
        Ok(())
    }

    /// fetch the names of whichever `ids` are unknown and wait for them
    ///
    /// Returns the ids that were fetched. Ids already being fetched by a lazy
    /// lookup are not fetched again.
    pub async fn resolve_missing(&self, ids: &[Identity]) -> Result<Vec<Identity>, FetchError> {
        let claimed = self.claim_missing(ids);
        if claimed.ids.is_empty() {
            return Ok(Vec::new());
        }
        self.set_name(&claimed.ids).await?;
        Ok(claimed.ids.clone())
    }

    /// identity going by `name`, or `name` itself if nobody does
    pub fn get_id(&self, name: &str) -> Identity {
        let authors = self.get();
        authors
            .value()
            .and_then(Value::as_object)
            .and_then(|table| {
                table
                    .iter()
                    .find(|(_, value)| value.as_str() == Some(name))
                    .map(|(id, _)| id.clone())
            })
            .unwrap_or_else(|| name.to_string())
    }

    /// every canonical name starting with `partial`, in the order they were first stored
    pub fn find_matches(&self, partial: &str) -> Vec<String> {
        let authors = self.get();
        authors
            .value()
            .and_then(Value::as_object)
            .map(|table| {
                table
                    .values()
                    .filter_map(Value::as_str)
                    .filter(|name| name.starts_with(partial))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// the author table as an immutable snapshot
    pub fn get(&self) -> Snapshot {
        self.store.snapshot(&[AUTHORS])
    }

    /// the author table as a plain map
    pub fn get_plain(&self) -> IndexMap<Identity, String> {
        self.store.get_as(&[AUTHORS]).unwrap_or_default()
    }

    fn stored_name(&self, id: &str) -> Option<String> {
        match self.store.get_in(&[AUTHORS, id])? {
            Value::String(name) => Some(name),
            _ => None,
        }
    }

    /// mark the ids that are neither stored nor already being fetched
    fn claim_missing(&self, ids: &[Identity]) -> InFlight {
        let authors = self.get();
        let table = authors.value().and_then(Value::as_object);
        let mut in_flight = self.in_flight.lock();
        let missing = ids
            .iter()
            .filter(|id| !table.is_some_and(|table| table.contains_key(id.as_str())))
            .filter(|id| in_flight.insert(id.to_string()))
            .cloned()
            .collect();
        InFlight {
            ids: missing,
            set: Arc::clone(&self.in_flight),
        }
    }
}

impl NameResolver for Authors {
    fn get_name(&self, id: &str) -> String {
        match self.stored_name(id) {
            Some(name) => name,
            None => {
                self.bulk_names(&[id.to_string()]);
                id.to_string()
            }
        }
    }

    fn bulk_names(&self, ids: &[Identity]) {
        let claimed = self.claim_missing(ids);
        if claimed.ids.is_empty() {
            return;
        }
        let authors = self.clone();
        self.runtime.spawn(async move {
            if let Err(err) = authors.set_name(&claimed.ids).await {
                tracing::warn!("authors: could not fetch {:?}: {}", claimed.ids, err);
            }
        });
    }
}

/// ids with a lazy fetch outstanding; released when dropped
struct InFlight {
    ids: Vec<Identity>,
    set: Arc<Mutex<HashSet<Identity>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self.set.lock();
        for id in &self.ids {
            set.remove(id);
        }
    }
}
