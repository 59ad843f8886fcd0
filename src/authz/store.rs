//! Boundary to the persistence layer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::authz::errors::AuthzError;
use crate::authz::types::{AclRecord, OrgEdge, OrgId, UserId};

/// Source of every stored ACL record, read in one pass.
pub trait AclStore: Send + Sync {
    fn load_acl_records(&self) -> Result<Vec<AclRecord>, AuthzError>;
}

/// Source of the organization tree as `(id, parent)` pairs.
pub trait OrgStore: Send + Sync {
    fn load_org_edges(&self) -> Result<Vec<OrgEdge>, AuthzError>;
}

/// Facts about principals that builtin predicates consult.
pub trait Directory: Send + Sync {
    fn is_member(&self, user: UserId, group: &str) -> bool;

    /// Organizations in which `user` directly holds `role`.
    fn org_role_orgs(&self, user: UserId, role: &str) -> BTreeSet<OrgId>;
}

#[derive(Debug, Default)]
struct MemoryState {
    acl: BTreeMap<i64, AclRecord>,
    orgs: BTreeMap<OrgId, Option<OrgId>>,
    members: HashMap<String, BTreeSet<UserId>>,
    org_roles: HashMap<(UserId, String), BTreeSet<OrgId>>,
}

/// In-process store. Mutations do not notify anyone; callers flush the
/// authorizer or invalidate the org cache themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record with the same id.
    pub fn put_acl_record(&self, record: AclRecord) {
        self.state.write().acl.insert(record.id, record);
    }

    pub fn remove_acl_record(&self, id: i64) -> Option<AclRecord> {
        self.state.write().acl.remove(&id)
    }

    pub fn put_org(&self, id: OrgId, parent: Option<OrgId>) {
        self.state.write().orgs.insert(id, parent);
    }

    pub fn remove_org(&self, id: OrgId) {
        self.state.write().orgs.remove(&id);
    }

    pub fn add_member(&self, group: &str, user: UserId) {
        self.state
            .write()
            .members
            .entry(group.to_string())
            .or_default()
            .insert(user);
    }

    pub fn remove_member(&self, group: &str, user: UserId) {
        if let Some(members) = self.state.write().members.get_mut(group) {
            members.remove(&user);
        }
    }

    pub fn grant_org_role(&self, user: UserId, role: &str, org: OrgId) {
        self.state
            .write()
            .org_roles
            .entry((user, role.to_string()))
            .or_default()
            .insert(org);
    }

    pub fn revoke_org_role(&self, user: UserId, role: &str, org: OrgId) {
        if let Some(orgs) = self
            .state
            .write()
            .org_roles
            .get_mut(&(user, role.to_string()))
        {
            orgs.remove(&org);
        }
    }
}

impl AclStore for MemoryStore {
    fn load_acl_records(&self) -> Result<Vec<AclRecord>, AuthzError> {
        Ok(self.state.read().acl.values().cloned().collect())
    }
}

impl OrgStore for MemoryStore {
    fn load_org_edges(&self) -> Result<Vec<OrgEdge>, AuthzError> {
        Ok(self
            .state
            .read()
            .orgs
            .iter()
            .map(|(&id, &parent)| OrgEdge { id, parent })
            .collect())
    }
}

impl Directory for MemoryStore {
    fn is_member(&self, user: UserId, group: &str) -> bool {
        self.state
            .read()
            .members
            .get(group)
            .map(|m| m.contains(&user))
            .unwrap_or(false)
    }

    fn org_role_orgs(&self, user: UserId, role: &str) -> BTreeSet<OrgId> {
        self.state
            .read()
            .org_roles
            .get(&(user, role.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::types::ACL_RECORD_VERSION;

    #[test]
    fn test_acl_records_replace_by_id() {
        let store = MemoryStore::new();
        let mut record = AclRecord {
            version: ACL_RECORD_VERSION,
            id: 1,
            role: "a".into(),
            privileges: BTreeMap::new(),
            arbitrary_perms: BTreeSet::new(),
            checks: vec![],
        };
        store.put_acl_record(record.clone());
        record.role = "b".into();
        store.put_acl_record(record);
        let loaded = store.load_acl_records().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].role, "b");
        assert!(store.remove_acl_record(1).is_some());
        assert!(store.load_acl_records().unwrap().is_empty());
    }

    #[test]
    fn test_directory_memberships() {
        let store = MemoryStore::new();
        let alice = UserId(1);
        assert!(!store.is_member(alice, "staff"));
        store.add_member("staff", alice);
        assert!(store.is_member(alice, "staff"));
        store.remove_member("staff", alice);
        assert!(!store.is_member(alice, "staff"));

        store.grant_org_role(alice, "admin", 3);
        store.grant_org_role(alice, "admin", 4);
        store.revoke_org_role(alice, "admin", 3);
        assert_eq!(store.org_role_orgs(alice, "admin"), BTreeSet::from([4]));
        assert!(store.org_role_orgs(alice, "viewer").is_empty());
    }

    #[test]
    fn test_org_edges() {
        let store = MemoryStore::new();
        store.put_org(1, None);
        store.put_org(2, Some(1));
        store.remove_org(1);
        assert_eq!(
            store.load_org_edges().unwrap(),
            vec![OrgEdge {
                id: 2,
                parent: Some(1)
            }]
        );
    }
}
