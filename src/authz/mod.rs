//! Role-based access control over entities, manager methods and arbitrary
//! named permissions.

pub mod audit;
pub mod binding;
pub mod engine;
pub mod entry;
pub mod errors;
pub mod index;
pub mod loader;
pub mod org_cache;
pub mod policy;
pub mod predicates;
pub mod store;
pub mod types;
pub mod web;

pub use binding::{CallContext, Predicate, PredicateContract, PredicateRegistry};
pub use engine::{Authorizer, MethodCallDefault};
pub use errors::{AuthzError, CheckError};
pub use org_cache::{MokaBackend, OrgDescendantCache};
pub use types::{Actee, AuthToken, Entity, EntityRecord, Principal};
