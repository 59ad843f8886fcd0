use std::sync::Arc;
use std::time::Duration;

use gatekeeper::authz::audit::MemoryAuditSink;
use gatekeeper::authz::org_cache::{MokaBackend, OrgDescendantCache};
use gatekeeper::authz::predicates::builtin_registry;
use gatekeeper::authz::store::MemoryStore;
use gatekeeper::authz::types::{AuthToken, EntityDecl, ManagerDecl, Principal, TypeRegistry};
use gatekeeper::authz::{Authorizer, MethodCallDefault};

/// Type registry shared by the integration tests.
///
/// `Person <- User <- Instructor`, plus `Course` and `Document`, and one
/// manager with two methods.
pub fn fixture_registry() -> TypeRegistry {
    TypeRegistry::build(
        vec![
            EntityDecl::new("Person", None),
            EntityDecl::new("User", Some("Person")),
            EntityDecl::new("Instructor", Some("User")),
            EntityDecl::new("Course", None),
            EntityDecl::new("Document", None),
        ],
        vec![ManagerDecl::new("UserManager")
            .alias("user_manager")
            .method("reset_password", &["user_id", "new_password"])
            .method("deactivate", &["user_id"])],
    )
    .expect("fixture registry is valid")
}

/// An in-memory store with the builtin predicates and an org cache wired up
pub struct TestWorld {
    pub store: Arc<MemoryStore>,
    pub types: Arc<TypeRegistry>,
    pub org_cache: Arc<OrgDescendantCache>,
    pub audit: Arc<MemoryAuditSink>,
}

impl TestWorld {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let org_cache = Arc::new(OrgDescendantCache::new(
            "test_orgs",
            store.clone(),
            Arc::new(MokaBackend::new(Duration::from_secs(60), 1_000)),
        ));
        Self {
            store,
            types: Arc::new(fixture_registry()),
            org_cache,
            audit: Arc::new(MemoryAuditSink::default()),
        }
    }

    pub fn authorizer(&self) -> Authorizer {
        self.authorizer_with(MethodCallDefault::Allow)
    }

    pub fn authorizer_with(&self, default: MethodCallDefault) -> Authorizer {
        let predicates = builtin_registry(self.store.clone(), self.org_cache.clone());
        Authorizer::new(self.store.clone(), self.types.clone(), predicates)
            .expect("index builds")
            .with_method_call_default(default)
            .with_audit_sink(self.audit.clone())
    }
}

pub fn user(id: i64, name: &str) -> Principal {
    Principal::User(AuthToken::new(id, name))
}
