use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::authz::errors::AuthzError;
use crate::authz::policy::{parse_kdl_document, PolicyDocument};
use crate::authz::store::{AclStore, Directory, OrgStore};
use crate::authz::types::*;

/// Memberships and org roles from the last successful load.
#[derive(Debug, Default)]
struct DirectorySnapshot {
    members: HashMap<String, BTreeSet<UserId>>,
    org_roles: HashMap<(UserId, String), BTreeSet<OrgId>>,
}

impl DirectorySnapshot {
    fn from_document(doc: &PolicyDocument) -> Self {
        let mut snapshot = Self::default();
        for (group, user) in &doc.members {
            snapshot
                .members
                .entry(group.clone())
                .or_default()
                .insert(*user);
        }
        for grant in &doc.org_roles {
            snapshot
                .org_roles
                .entry((grant.user, grant.role.clone()))
                .or_default()
                .insert(grant.org);
        }
        snapshot
    }
}

/// A directory of `.kdl` policy files used as the backing store.
///
/// Every ACL or org load re-reads the directory, so edits on disk are picked
/// up by the next flush or cache invalidation. Directory lookups answer from
/// whatever the most recent load saw.
#[derive(Debug)]
pub struct PolicyDir {
    dir: PathBuf,
    directory: RwLock<Arc<DirectorySnapshot>>,
}

impl PolicyDir {
    pub fn open(dir: &Path) -> Result<Self, AuthzError> {
        if !dir.is_dir() {
            return Err(AuthzError::InvalidPolicy(format!(
                "policies directory `{}` does not exist or is not a directory",
                dir.display()
            )));
        }
        let policy_dir = Self {
            dir: dir.to_path_buf(),
            directory: RwLock::new(Arc::new(DirectorySnapshot::default())),
        };
        policy_dir.load()?;
        Ok(policy_dir)
    }

    /// Parse and merge every `.kdl` file in the directory, in file-name order.
    pub fn load(&self) -> Result<PolicyDocument, AuthzError> {
        let doc = load_policies(&self.dir)?;
        *self.directory.write() = Arc::new(DirectorySnapshot::from_document(&doc));
        Ok(doc)
    }

    /// Build the type registry from the declared entities and managers.
    pub fn load_type_registry(&self) -> Result<TypeRegistry, AuthzError> {
        let doc = self.load()?;
        TypeRegistry::build(doc.entities, doc.managers)
    }

    fn snapshot(&self) -> Arc<DirectorySnapshot> {
        Arc::clone(&self.directory.read())
    }
}

/// Load all `.kdl` policy files from `dir` into one merged document.
pub fn load_policies(dir: &Path) -> Result<PolicyDocument, AuthzError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    let mut merged = PolicyDocument::default();
    let mut file_count = 0;
    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AuthzError::PolicyLoadError {
                path: path.display().to_string(),
                source,
            })?;
        merged.merge(parse_kdl_document(&contents)?);
        file_count += 1;
    }

    tracing::debug!(
        files = file_count,
        entities = merged.entities.len(),
        managers = merged.managers.len(),
        acls = merged.acls.len(),
        orgs = merged.orgs.len(),
        "Loaded policy files"
    );

    Ok(merged)
}

impl AclStore for PolicyDir {
    fn load_acl_records(&self) -> Result<Vec<AclRecord>, AuthzError> {
        Ok(self.load()?.acls)
    }
}

impl OrgStore for PolicyDir {
    fn load_org_edges(&self) -> Result<Vec<OrgEdge>, AuthzError> {
        Ok(self.load()?.orgs)
    }
}

impl Directory for PolicyDir {
    fn is_member(&self, user: UserId, group: &str) -> bool {
        self.snapshot()
            .members
            .get(group)
            .map(|m| m.contains(&user))
            .unwrap_or(false)
    }

    fn org_role_orgs(&self, user: UserId, role: &str) -> BTreeSet<OrgId> {
        self.snapshot()
            .org_roles
            .get(&(user, role.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}
