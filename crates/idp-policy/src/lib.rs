//! Authorization policy handling
//!
//! - [`PolicyCache`]: service id to shared policy sets
//! - [`DecisionEngine`]: deny-overrides evaluation of cached policies
//! - [`AuthorizationProcessor`]: signed decision query answering
//! - [`PolicyCacheSynchronizer`]: durable store polling and cache-clear pushes

pub mod authz;
pub mod cache;
pub mod engine;
pub mod error;
pub mod policy;
pub mod sync;

pub use authz::AuthorizationProcessor;
pub use cache::{CachedPolicy, PolicyCache, PolicySet};
pub use engine::{AppliedTarget, DecisionEngine, DecisionRecord};
pub use error::{PolicyError, Result};
pub use policy::{Condition, Policy, Rule, RuleCondition, RuleSlot, TargetPattern};
pub use sync::{ClearCacheSigner, NotifyOutcome, PolicyCacheSynchronizer, SyncConfig, SyncReport};
