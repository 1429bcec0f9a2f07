//! Reactive state for a social-network client.
//!
//! A shared [`Store`](state::Store) holds canonical author names and the local
//! identity's friend set. [`Authors`](names::Authors) and
//! [`Friends`](friends::Friends) fill it from an
//! [`IdentityService`](identity::IdentityService), and an
//! [`EventBus`](events::EventBus) tells observers, at most once per flush
//! interval, that a view changed.

pub mod config;
pub mod events;
pub mod friends;
pub mod identity;
pub mod names;
pub mod session;
pub mod state;

pub use config::Config;
pub use events::{EventBus, AUTHORS_CHANGED, FRIENDS_CHANGED};
pub use friends::{FriendSet, Friends, FriendsError};
pub use identity::{FetchError, Identity, IdentityService, MemoryIdentityService};
pub use names::{Authors, NameResolver};
pub use session::Session;
pub use state::{Snapshot, Store};
