//! The five cooperating pieces of the challenge subsystem: key cache,
//! durable local PoC store, address-hash replay filter, deterministic
//! target/path derivation and the challenge manager actor.

mod addr_filter;
pub mod error;
mod key_cache;
mod manager;
mod store;
pub mod target;


pub use self::{
    addr_filter::{AddrHashCheck, AddrHashFilter},
    key_cache::{CachedKey, KeyCache, KeyCacheWriter},
    manager::{ChallengeManager, ChallengeManagerHandle, Command, TargetCheck},
    store::PocStore,
};
