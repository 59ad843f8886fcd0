use std::collections::{BTreeMap, BTreeSet};

use gatekeeper::authz::types::{
    AclRecord, CheckSpec, CrudRecord, EntityRecord, Privilege, ACL_RECORD_VERSION,
};
use serde_json::Value;

/// Builder for ACL records as the persistence layer would hand them over
pub struct AclRecordBuilder {
    record: AclRecord,
}

impl AclRecordBuilder {
    pub fn new(id: i64, role: &str) -> Self {
        Self {
            record: AclRecord {
                version: ACL_RECORD_VERSION,
                id,
                role: role.to_string(),
                privileges: BTreeMap::new(),
                arbitrary_perms: BTreeSet::new(),
                checks: Vec::new(),
            },
        }
    }

    /// Bind a predicate; `params` must be a JSON object.
    pub fn check(mut self, predicate: &str, params: Value) -> Self {
        self.record.checks.push(CheckSpec {
            predicate: predicate.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
        });
        self
    }

    pub fn create(mut self, type_name: &str) -> Self {
        self.crud(type_name).create = true;
        self
    }

    pub fn read(mut self, type_name: &str, fields: &[&str]) -> Self {
        self.crud(type_name)
            .read
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn update(mut self, type_name: &str, fields: &[&str]) -> Self {
        self.crud(type_name)
            .update
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn delete(mut self, type_name: &str) -> Self {
        self.crud(type_name).delete = true;
        self
    }

    pub fn methods(mut self, manager: &str, methods: &[&str]) -> Self {
        self.record.privileges.insert(
            manager.to_string(),
            Privilege::Methods {
                methods: methods.iter().map(|m| m.to_string()).collect(),
            },
        );
        self
    }

    pub fn arbitrary(mut self, perm: &str) -> Self {
        self.record.arbitrary_perms.insert(perm.to_string());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.record.version = version;
        self
    }

    pub fn build(self) -> AclRecord {
        self.record
    }

    fn crud(&mut self, type_name: &str) -> &mut CrudRecord {
        let privilege = self
            .record
            .privileges
            .entry(type_name.to_string())
            .or_insert_with(|| Privilege::Crud(CrudRecord::default()));
        match privilege {
            Privilege::Crud(crud) => crud,
            Privilege::Methods { .. } => panic!("`{type_name}` already holds method privileges"),
        }
    }
}

/// Builder for entity instances used as actees
pub struct EntityBuilder {
    entity: EntityRecord,
}

impl EntityBuilder {
    pub fn new(type_name: &str) -> Self {
        Self {
            entity: EntityRecord::new(type_name),
        }
    }

    pub fn id(self, id: i64) -> Self {
        self.field("id", id)
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.entity = self.entity.with(name, value);
        self
    }

    pub fn build(self) -> EntityRecord {
        self.entity
    }
}
