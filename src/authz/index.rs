use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::authz::binding::PredicateRegistry;
use crate::authz::entry::AclEntry;
use crate::authz::errors::AuthzError;
use crate::authz::types::{AclRecord, ObjectOp, Privilege, TypeRegistry};

/// What to look up in the index.
#[derive(Debug, Clone, Copy)]
pub enum AclQuery<'a> {
    /// Operation on an entity type; falls back along the type's ancestors.
    Object(ObjectOp, &'a str),
    /// (manager, method), canonical names
    Method(&'a str, &'a str),
    Arbitrary(&'a str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub entries: usize,
    pub create_types: usize,
    pub read_types: usize,
    pub update_types: usize,
    pub delete_types: usize,
    pub methods: usize,
    pub arbitrary: usize,
}

type Bucket = Vec<Arc<AclEntry>>;

/// Read-only lookup structure over every ACL entry.
///
/// An entry only ever lands in a bucket for a capability its record actually
/// grants, so presence in a bucket is enough to go on to predicate
/// evaluation. It is never enough to grant.
#[derive(Debug, Default)]
pub struct AclIndex {
    types: Arc<TypeRegistry>,
    create: HashMap<String, Bucket>,
    read: HashMap<String, Bucket>,
    update: HashMap<String, Bucket>,
    delete: HashMap<String, Bucket>,
    methods: HashMap<(String, String), Bucket>,
    arbitrary: HashMap<String, Bucket>,
    entries: usize,
}

impl AclIndex {
    pub fn build(
        records: Vec<AclRecord>,
        types: Arc<TypeRegistry>,
        predicates: &PredicateRegistry,
    ) -> Result<Self, AuthzError> {
        let mut index = AclIndex {
            types,
            ..Default::default()
        };

        for record in records {
            let entry = Arc::new(AclEntry::from_record(record, predicates)?);
            index.entries += 1;

            for (type_name, privilege) in entry.privileges() {
                match privilege {
                    Privilege::Crud(crud) => {
                        if !index.types.is_entity(type_name) {
                            return Err(AuthzError::UnauthorizableType(type_name.clone()));
                        }
                        for op in [
                            ObjectOp::Create,
                            ObjectOp::Read,
                            ObjectOp::Update,
                            ObjectOp::Delete,
                        ] {
                            if crud.grants(op) {
                                index
                                    .object_buckets_mut(op)
                                    .entry(type_name.clone())
                                    .or_default()
                                    .push(Arc::clone(&entry));
                            }
                        }
                    }
                    Privilege::Methods { methods } => {
                        if !index.types.is_manager(type_name) {
                            return Err(AuthzError::UnauthorizableType(type_name.clone()));
                        }
                        for method in methods {
                            index
                                .methods
                                .entry((type_name.clone(), method.clone()))
                                .or_default()
                                .push(Arc::clone(&entry));
                        }
                    }
                }
            }

            for perm in entry.arbitrary_perms() {
                index
                    .arbitrary
                    .entry(perm.clone())
                    .or_default()
                    .push(Arc::clone(&entry));
            }
        }

        Ok(index)
    }

    /// Candidate entries for a query. Never fails; unknown keys yield an
    /// empty slice.
    pub fn collect(&self, query: AclQuery<'_>) -> &[Arc<AclEntry>] {
        let bucket = match query {
            AclQuery::Object(op, type_name) => {
                let buckets = self.object_buckets(op);
                self.types
                    .lineage(type_name)
                    .iter()
                    .filter_map(|t| buckets.get(t))
                    .find(|b| !b.is_empty())
            }
            AclQuery::Method(manager, method) => self
                .methods
                .get(&(manager.to_string(), method.to_string())),
            AclQuery::Arbitrary(perm) => self.arbitrary.get(perm),
        };
        bucket.map(|b| b.as_slice()).unwrap_or(&[])
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            entries: self.entries,
            create_types: self.create.len(),
            read_types: self.read.len(),
            update_types: self.update.len(),
            delete_types: self.delete.len(),
            methods: self.methods.len(),
            arbitrary: self.arbitrary.len(),
        }
    }

    fn object_buckets(&self, op: ObjectOp) -> &HashMap<String, Bucket> {
        match op {
            ObjectOp::Create => &self.create,
            ObjectOp::Read => &self.read,
            ObjectOp::Update => &self.update,
            ObjectOp::Delete => &self.delete,
        }
    }

    fn object_buckets_mut(&mut self, op: ObjectOp) -> &mut HashMap<String, Bucket> {
        match op {
            ObjectOp::Create => &mut self.create,
            ObjectOp::Read => &mut self.read,
            ObjectOp::Update => &mut self.update,
            ObjectOp::Delete => &mut self.delete,
        }
    }
}
