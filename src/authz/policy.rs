use std::collections::{BTreeMap, BTreeSet};

use kdl::{KdlDocument, KdlNode, KdlValue};
use serde_json::{Map, Value};

use crate::authz::errors::AuthzError;
use crate::authz::types::*;

/// A user's role within one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgRoleGrant {
    pub user: UserId,
    pub role: String,
    pub org: OrgId,
}

/// Everything one or more policy files declare.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyDocument {
    pub entities: Vec<EntityDecl>,
    pub managers: Vec<ManagerDecl>,
    pub acls: Vec<AclRecord>,
    pub orgs: Vec<OrgEdge>,
    /// (group, user)
    pub members: Vec<(String, UserId)>,
    pub org_roles: Vec<OrgRoleGrant>,
}

impl PolicyDocument {
    pub fn merge(&mut self, other: PolicyDocument) {
        self.entities.extend(other.entities);
        self.managers.extend(other.managers);
        self.acls.extend(other.acls);
        self.orgs.extend(other.orgs);
        self.members.extend(other.members);
        self.org_roles.extend(other.org_roles);
    }
}

/// Parse a KDL document string into a [`PolicyDocument`].
pub fn parse_kdl_document(source: &str) -> Result<PolicyDocument, AuthzError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AuthzError::KdlParse(e.to_string()))?;

    let mut policy = PolicyDocument::default();

    for node in doc.nodes() {
        match node.name().value() {
            "entity" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "entity node requires a string argument (e.g. entity \"User\")".into(),
                    )
                })?;
                let parent = string_prop(node, "extends");
                policy.entities.push(EntityDecl { name, parent });
            }
            "manager" => policy.managers.push(parse_manager(node)?),
            "role" => {
                let role = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "role node requires a string argument (e.g. role \"instructor\")".into(),
                    )
                })?;
                for child in child_nodes(node) {
                    match child.name().value() {
                        "acl" => policy.acls.push(parse_acl(&role, child)?),
                        other => {
                            return Err(AuthzError::InvalidPolicy(format!(
                                "unexpected child `{other}` in role `{role}` (expected `acl`)"
                            )));
                        }
                    }
                }
            }
            "org" => {
                let id = first_int_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy("org node requires an integer id (e.g. org 2 parent=1)".into())
                })?;
                policy.orgs.push(OrgEdge {
                    id,
                    parent: int_prop(node, "parent"),
                });
            }
            "member" => {
                let group = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "member node requires a group argument (e.g. member \"staff\" user=1)".into(),
                    )
                })?;
                let user = int_prop(node, "user").ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!("member `{group}` missing integer `user` property"))
                })?;
                policy.members.push((group, UserId(user)));
            }
            "org-role" => {
                let role = first_string_arg(node).ok_or_else(|| {
                    AuthzError::InvalidPolicy(
                        "org-role node requires a role argument (e.g. org-role \"admin\" user=1 org=2)"
                            .into(),
                    )
                })?;
                let (Some(user), Some(org)) = (int_prop(node, "user"), int_prop(node, "org")) else {
                    return Err(AuthzError::InvalidPolicy(format!(
                        "org-role `{role}` needs integer `user` and `org` properties"
                    )));
                };
                policy.org_roles.push(OrgRoleGrant {
                    user: UserId(user),
                    role,
                    org,
                });
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

fn parse_manager(node: &KdlNode) -> Result<ManagerDecl, AuthzError> {
    let name = first_string_arg(node).ok_or_else(|| {
        AuthzError::InvalidPolicy(
            "manager node requires a string argument (e.g. manager \"UserManager\")".into(),
        )
    })?;
    let mut manager = ManagerDecl {
        name,
        aliases: string_prop(node, "alias").into_iter().collect(),
        methods: BTreeMap::new(),
    };
    for child in child_nodes(node) {
        match child.name().value() {
            "method" => {
                let mut args = string_args(child).into_iter();
                let method = args.next().ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!(
                        "method in manager `{}` requires a name",
                        manager.name
                    ))
                })?;
                manager.methods.insert(method, args.collect());
            }
            "alias" => manager.aliases.extend(string_args(child)),
            other => {
                return Err(AuthzError::InvalidPolicy(format!(
                    "unexpected child `{other}` in manager `{}` (expected `method` or `alias`)",
                    manager.name
                )));
            }
        }
    }
    Ok(manager)
}

fn parse_acl(role: &str, node: &KdlNode) -> Result<AclRecord, AuthzError> {
    let id = int_prop(node, "id").ok_or_else(|| {
        AuthzError::InvalidPolicy(format!("acl in role `{role}` missing integer `id` property"))
    })?;
    let version = match int_prop(node, "version") {
        Some(v) => u32::try_from(v).map_err(|_| {
            AuthzError::InvalidPolicy(format!("acl {id} has an invalid version {v}"))
        })?,
        None => ACL_RECORD_VERSION,
    };

    let mut record = AclRecord {
        version,
        id,
        role: role.to_string(),
        privileges: BTreeMap::new(),
        arbitrary_perms: BTreeSet::new(),
        checks: Vec::new(),
    };

    for child in child_nodes(node) {
        match child.name().value() {
            "check" => {
                let predicate = first_string_arg(child).ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!(
                        "check in acl {id} requires a predicate name (e.g. check \"is_member_of\" group=\"staff\")"
                    ))
                })?;
                record.checks.push(CheckSpec {
                    predicate,
                    params: check_params(child),
                });
            }
            "privilege" => {
                let type_name = first_string_arg(child).ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!("privilege in acl {id} requires a type name"))
                })?;
                let crud = parse_crud(id, &type_name, child)?;
                insert_privilege(&mut record, type_name, Privilege::Crud(crud))?;
            }
            "methods" => {
                let manager = first_string_arg(child).ok_or_else(|| {
                    AuthzError::InvalidPolicy(format!("methods in acl {id} requires a manager name"))
                })?;
                let methods = dash_list(child).into_iter().collect();
                insert_privilege(&mut record, manager, Privilege::Methods { methods })?;
            }
            "arbitrary" => record.arbitrary_perms.extend(string_args(child)),
            other => {
                return Err(AuthzError::InvalidPolicy(format!(
                    "unexpected child `{other}` in acl {id} (expected `check`, `privilege`, `methods` or `arbitrary`)"
                )));
            }
        }
    }

    Ok(record)
}

fn parse_crud(id: i64, type_name: &str, node: &KdlNode) -> Result<CrudRecord, AuthzError> {
    let mut crud = CrudRecord::default();
    for op in child_nodes(node) {
        match op.name().value() {
            "create" => crud.create = true,
            "read" => crud.read.extend(string_args(op)),
            "update" => crud.update.extend(string_args(op)),
            "delete" => crud.delete = true,
            other => {
                return Err(AuthzError::InvalidPolicy(format!(
                    "unexpected operation `{other}` for `{type_name}` in acl {id}"
                )));
            }
        }
    }
    Ok(crud)
}

fn insert_privilege(
    record: &mut AclRecord,
    type_name: String,
    privilege: Privilege,
) -> Result<(), AuthzError> {
    if record.privileges.contains_key(&type_name) {
        return Err(AuthzError::InvalidPolicy(format!(
            "acl {} declares `{type_name}` twice",
            record.id
        )));
    }
    record.privileges.insert(type_name, privilege);
    Ok(())
}

/// Properties become scalar params; child nodes become list params.
fn check_params(node: &KdlNode) -> Map<String, Value> {
    let mut params = Map::new();
    for entry in node.entries() {
        if let Some(name) = entry.name() {
            params.insert(name.value().to_string(), to_json(entry.value()));
        }
    }
    for child in child_nodes(node) {
        let values = child
            .entries()
            .iter()
            .filter(|e| e.name().is_none())
            .map(|e| to_json(e.value()))
            .collect();
        params.insert(child.name().value().to_string(), Value::Array(values));
    }
    params
}

fn to_json(value: &KdlValue) -> Value {
    if let Some(s) = value.as_string() {
        Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string()))
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(b) = value.as_bool() {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

fn child_nodes(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|c| c.nodes()).unwrap_or(&[])
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn first_int_arg(node: &KdlNode) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .and_then(|i| i64::try_from(i).ok())
}

/// All positional string arguments, in order.
fn string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn string_prop(node: &KdlNode, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn int_prop(node: &KdlNode, key: &str) -> Option<i64> {
    node.get(key)
        .and_then(|v| v.as_integer())
        .and_then(|i| i64::try_from(i).ok())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
fn dash_list(node: &KdlNode) -> Vec<String> {
    child_nodes(node)
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}
