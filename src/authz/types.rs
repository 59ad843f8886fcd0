use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::authz::errors::AuthzError;

/// Current schema version of stored [`AclRecord`]s.
pub const ACL_RECORD_VERSION: u32 = 1;

pub type OrgId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user/{}", self.0)
    }
}

/// Validated token of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub user_id: UserId,
    pub username: String,
}

impl AuthToken {
    pub fn new(user_id: i64, username: &str) -> Self {
        Self {
            user_id: UserId(user_id),
            username: username.to_string(),
        }
    }
}

/// The acting identity handed in by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Guest,
    User(AuthToken),
    /// A non-empty principal value that failed validation upstream.
    Invalid { reason: String },
}

impl Principal {
    pub fn token(&self) -> Option<&AuthToken> {
        match self {
            Principal::User(token) => Some(token),
            _ => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Principal::Guest)
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Guest => write!(f, "guest"),
            Principal::User(token) => write!(f, "{}", token.user_id),
            Principal::Invalid { .. } => write!(f, "invalid"),
        }
    }
}

/// A business-entity instance the engine can authorize against.
pub trait Entity: std::fmt::Debug + Send + Sync {
    /// Stable type name, as registered in the [`TypeRegistry`].
    fn type_name(&self) -> &str;

    fn field(&self, name: &str) -> Option<Value>;
}

/// Generic entity: a type name plus a JSON field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub type_name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl EntityRecord {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(field.to_string(), value.into());
        self
    }
}

impl Entity for EntityRecord {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// The object instance or type being acted upon.
#[derive(Debug, Clone, Copy)]
pub enum Actee<'a> {
    Type(&'a str),
    Instance(&'a dyn Entity),
}

impl<'a> Actee<'a> {
    pub fn type_name(&self) -> &'a str {
        match *self {
            Actee::Type(name) => name,
            Actee::Instance(entity) => entity.type_name(),
        }
    }

    pub fn instance(&self) -> Option<&'a dyn Entity> {
        match *self {
            Actee::Type(_) => None,
            Actee::Instance(entity) => Some(entity),
        }
    }

    /// Field of the instance; `None` for bare types.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.instance().and_then(|e| e.field(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectOp {
    Create,
    Read,
    Update,
    Delete,
}

impl ObjectOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectOp::Create => "create",
            ObjectOp::Read => "read",
            ObjectOp::Update => "update",
            ObjectOp::Delete => "delete",
        }
    }
}

/// Operations that are authorized per attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeOp {
    Read,
    Update,
}

impl From<AttributeOp> for ObjectOp {
    fn from(op: AttributeOp) -> Self {
        match op {
            AttributeOp::Read => ObjectOp::Read,
            AttributeOp::Update => ObjectOp::Update,
        }
    }
}

/// Object-level privileges one ACL entry grants on one type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrudRecord {
    #[serde(default, alias = "c")]
    pub create: bool,
    #[serde(default, alias = "r")]
    pub read: BTreeSet<String>,
    #[serde(default, alias = "u")]
    pub update: BTreeSet<String>,
    #[serde(default, alias = "d")]
    pub delete: bool,
}

impl CrudRecord {
    /// Whether the record grants `op` at all (a non-empty field set for read/update).
    pub fn grants(&self, op: ObjectOp) -> bool {
        match op {
            ObjectOp::Create => self.create,
            ObjectOp::Read => !self.read.is_empty(),
            ObjectOp::Update => !self.update.is_empty(),
            ObjectOp::Delete => self.delete,
        }
    }

    pub fn fields(&self, op: AttributeOp) -> &BTreeSet<String> {
        match op {
            AttributeOp::Read => &self.read,
            AttributeOp::Update => &self.update,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Privilege {
    Crud(CrudRecord),
    Methods { methods: BTreeSet<String> },
}

/// A check predicate reference plus its static parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub predicate: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Stored form of one ACL entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRecord {
    #[serde(default = "default_record_version")]
    pub version: u32,
    pub id: i64,
    pub role: String,
    #[serde(default)]
    pub privileges: BTreeMap<String, Privilege>,
    #[serde(default)]
    pub arbitrary_perms: BTreeSet<String>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

fn default_record_version() -> u32 {
    ACL_RECORD_VERSION
}

/// An organization as loaded from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgEdge {
    pub id: OrgId,
    pub parent: Option<OrgId>,
}

// ---------- Type registry ----------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl {
    pub name: String,
    pub parent: Option<String>,
}

impl EntityDecl {
    pub fn new(name: &str, parent: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            parent: parent.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerDecl {
    pub name: String,
    pub aliases: Vec<String>,
    /// method name -> ordered parameter names
    pub methods: BTreeMap<String, Vec<String>>,
}

impl ManagerDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    pub fn method(mut self, method: &str, parameters: &[&str]) -> Self {
        self.methods.insert(
            method.to_string(),
            parameters.iter().map(|p| p.to_string()).collect(),
        );
        self
    }
}

/// Static registry of authorizable types, with each entity's ancestor chain
/// precomputed once.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    /// type -> [type, parent, grandparent, ...]
    lineage: HashMap<String, Vec<String>>,
    managers: HashMap<String, ManagerDecl>,
    /// alias -> canonical manager name
    aliases: HashMap<String, String>,
}

impl TypeRegistry {
    pub fn build(entities: Vec<EntityDecl>, managers: Vec<ManagerDecl>) -> Result<Self, AuthzError> {
        let mut parents: HashMap<String, Option<String>> = HashMap::new();
        for decl in entities {
            if parents.contains_key(&decl.name) {
                return Err(AuthzError::InvalidTypeRegistry(format!(
                    "entity `{}` declared twice",
                    decl.name
                )));
            }
            parents.insert(decl.name, decl.parent);
        }

        let mut lineage = HashMap::new();
        for name in parents.keys() {
            let mut chain = vec![name.clone()];
            let mut seen = HashSet::from([name.as_str()]);
            let mut current = name.as_str();
            while let Some(Some(parent)) = parents.get(current) {
                if !parents.contains_key(parent) {
                    return Err(AuthzError::InvalidTypeRegistry(format!(
                        "entity `{current}` extends undeclared `{parent}`"
                    )));
                }
                if !seen.insert(parent.as_str()) {
                    return Err(AuthzError::InvalidTypeRegistry(format!(
                        "inheritance cycle through `{parent}`"
                    )));
                }
                chain.push(parent.clone());
                current = parent.as_str();
            }
            lineage.insert(name.clone(), chain);
        }

        let mut by_name = HashMap::new();
        let mut aliases = HashMap::new();
        for manager in managers {
            if lineage.contains_key(&manager.name) || by_name.contains_key(&manager.name) {
                return Err(AuthzError::InvalidTypeRegistry(format!(
                    "manager `{}` clashes with another declared type",
                    manager.name
                )));
            }
            for alias in &manager.aliases {
                aliases.insert(alias.clone(), manager.name.clone());
            }
            by_name.insert(manager.name.clone(), manager);
        }

        Ok(Self {
            lineage,
            managers: by_name,
            aliases,
        })
    }

    pub fn is_entity(&self, name: &str) -> bool {
        self.lineage.contains_key(name)
    }

    pub fn is_manager(&self, name: &str) -> bool {
        self.managers.contains_key(name)
    }

    /// The type itself followed by its ancestors, nearest first. Empty for
    /// unregistered types.
    pub fn lineage(&self, type_name: &str) -> &[String] {
        self.lineage
            .get(type_name)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn canonical_manager<'a>(&'a self, name: &'a str) -> &'a str {
        if self.managers.contains_key(name) {
            return name;
        }
        self.aliases.get(name).map(|s| s.as_str()).unwrap_or(name)
    }

    /// Declared parameter names of a manager method, if known.
    pub fn method_parameters(&self, manager: &str, method: &str) -> &[String] {
        self.managers
            .get(manager)
            .and_then(|m| m.methods.get(method))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn entity_count(&self) -> usize {
        self.lineage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TypeRegistry {
        TypeRegistry::build(
            vec![
                EntityDecl::new("Person", None),
                EntityDecl::new("User", Some("Person")),
                EntityDecl::new("Instructor", Some("User")),
            ],
            vec![ManagerDecl::new("UserManager")
                .alias("user_manager")
                .method("reset_password", &["user_id", "new_password"])],
        )
        .unwrap()
    }

    #[test]
    fn test_lineage_nearest_first() {
        let reg = registry();
        assert_eq!(reg.lineage("Instructor"), ["Instructor", "User", "Person"]);
        assert_eq!(reg.lineage("Person"), ["Person"]);
        assert!(reg.lineage("Unknown").is_empty());
    }

    #[test]
    fn test_registry_rejects_cycles_and_unknown_parents() {
        let err = TypeRegistry::build(
            vec![EntityDecl::new("A", Some("B")), EntityDecl::new("B", Some("A"))],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidTypeRegistry(_)));

        let err = TypeRegistry::build(vec![EntityDecl::new("A", Some("Missing"))], vec![])
            .unwrap_err();
        assert!(matches!(err, AuthzError::InvalidTypeRegistry(_)));
    }

    #[test]
    fn test_manager_aliases_and_parameters() {
        let reg = registry();
        assert!(reg.is_manager("UserManager"));
        assert!(!reg.is_entity("UserManager"));
        assert_eq!(reg.canonical_manager("user_manager"), "UserManager");
        assert_eq!(reg.canonical_manager("Other"), "Other");
        assert_eq!(
            reg.method_parameters("UserManager", "reset_password"),
            ["user_id", "new_password"]
        );
        assert!(reg.method_parameters("UserManager", "nope").is_empty());
    }

    #[test]
    fn test_acl_record_deserializes_short_crud_keys() {
        let record: AclRecord = serde_json::from_value(json!({
            "id": 3,
            "role": "admin",
            "privileges": {
                "User": { "kind": "crud", "c": true, "r": ["name"], "d": true },
                "UserManager": { "kind": "methods", "methods": ["reset_password"] }
            },
            "checks": [{ "predicate": "anyone" }]
        }))
        .unwrap();
        assert_eq!(record.version, ACL_RECORD_VERSION);
        let Privilege::Crud(crud) = &record.privileges["User"] else {
            panic!("expected crud privilege");
        };
        assert!(crud.grants(ObjectOp::Create));
        assert!(crud.grants(ObjectOp::Read));
        assert!(!crud.grants(ObjectOp::Update));
        assert!(crud.grants(ObjectOp::Delete));
    }

    #[test]
    fn test_actee_fields() {
        let user = EntityRecord::new("User").with("id", 4);
        let actee = Actee::Instance(&user);
        assert_eq!(actee.type_name(), "User");
        assert_eq!(actee.field("id"), Some(json!(4)));
        assert_eq!(Actee::Type("User").field("id"), None);
    }
}
