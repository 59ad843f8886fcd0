use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::authz::audit::{self, AuditSink, DecisionRecord, EntryDecision};
use crate::authz::binding::{CallContext, MethodCall, PredicateRegistry};
use crate::authz::entry::AclEntry;
use crate::authz::errors::AuthzError;
use crate::authz::index::{AclIndex, AclQuery, IndexStats};
use crate::authz::store::AclStore;
use crate::authz::types::{Actee, AttributeOp, ObjectOp, Principal, TypeRegistry};

/// Verdict for manager methods that no ACL entry mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodCallDefault {
    #[default]
    Allow,
    Deny,
}

/// The decision engine.
///
/// Holds the current [`AclIndex`] behind an atomic pointer. Every public
/// operation takes one snapshot of the index and evaluates against it to
/// completion; [`Authorizer::flush`] builds a replacement off to the side and
/// swaps it in, so readers never see a half-built index and never wait on a
/// rebuild. Flushes are serialized against each other.
pub struct Authorizer {
    index: ArcSwap<AclIndex>,
    /// Held from store load to publish so the newest load is stored last.
    flush_lock: Mutex<()>,
    store: Arc<dyn AclStore>,
    types: Arc<TypeRegistry>,
    predicates: PredicateRegistry,
    method_default: MethodCallDefault,
    audit: Option<Arc<dyn AuditSink>>,
}

impl Authorizer {
    pub fn new(
        store: Arc<dyn AclStore>,
        types: Arc<TypeRegistry>,
        predicates: PredicateRegistry,
    ) -> Result<Self, AuthzError> {
        let index = build_index(store.as_ref(), &types, &predicates)?;
        Ok(Self {
            index: ArcSwap::from_pointee(index),
            flush_lock: Mutex::new(()),
            store,
            types,
            predicates,
            method_default: MethodCallDefault::default(),
            audit: None,
        })
    }

    pub fn with_method_call_default(mut self, default: MethodCallDefault) -> Self {
        self.method_default = default;
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Current index snapshot.
    pub fn index(&self) -> Arc<AclIndex> {
        self.index.load_full()
    }

    /// Rebuild the index from the store and publish it. On failure the
    /// previous index stays in place.
    pub fn flush(&self) -> Result<IndexStats, AuthzError> {
        let _flushing = self.flush_lock.lock();
        let index = build_index(self.store.as_ref(), &self.types, &self.predicates)?;
        let stats = index.stats();
        self.index.store(Arc::new(index));
        tracing::info!(
            entries = stats.entries,
            methods = stats.methods,
            arbitrary = stats.arbitrary,
            "ACL index flushed"
        );
        Ok(stats)
    }

    pub fn check_create_permissions(
        &self,
        principal: &Principal,
        actee: Actee<'_>,
    ) -> Result<(), AuthzError> {
        self.check_object(ObjectOp::Create, principal, actee)
    }

    pub fn check_delete_permissions(
        &self,
        principal: &Principal,
        actee: Actee<'_>,
    ) -> Result<(), AuthzError> {
        self.check_object(ObjectOp::Delete, principal, actee)
    }

    pub fn check_read_permissions(
        &self,
        principal: &Principal,
        actee: Actee<'_>,
        attributes: &BTreeSet<String>,
    ) -> Result<(), AuthzError> {
        let authorized =
            self.get_authorized_attributes(AttributeOp::Read, principal, actee, attributes, None)?;
        require_coverage("read", actee.type_name(), attributes, &authorized)
    }

    pub fn check_update_permissions(
        &self,
        principal: &Principal,
        actee: Actee<'_>,
        update_map: &Map<String, Value>,
    ) -> Result<(), AuthzError> {
        let requested: BTreeSet<String> = update_map.keys().cloned().collect();
        let authorized = self.get_authorized_attributes(
            AttributeOp::Update,
            principal,
            actee,
            &requested,
            Some(update_map),
        )?;
        require_coverage("update", actee.type_name(), &requested, &authorized)
    }

    /// Which of `requested` the principal may read or update on `actee`.
    /// An empty `requested` asks for everything authorized.
    pub fn get_authorized_attributes(
        &self,
        op: AttributeOp,
        principal: &Principal,
        actee: Actee<'_>,
        requested: &BTreeSet<String>,
        update_map: Option<&Map<String, Value>>,
    ) -> Result<BTreeSet<String>, AuthzError> {
        let index = self.index.load_full();
        let type_name = actee.type_name();
        let lineage = index.types().lineage(type_name);
        let ctx = match op {
            AttributeOp::Read => CallContext::object(ObjectOp::Read),
            AttributeOp::Update => CallContext::update(update_map),
        };

        let mut authorized = BTreeSet::new();
        let mut decisions = Vec::new();
        for entry in index.collect(AclQuery::Object(op.into(), type_name)) {
            let Some(fields) = entry.attribute_fields(op, lineage) else {
                continue;
            };
            // skip entries that could not add anything we still need
            let useful = if requested.is_empty() {
                !fields.is_subset(&authorized)
            } else {
                fields
                    .iter()
                    .any(|f| requested.contains(f) && !authorized.contains(f))
            };
            if !useful {
                continue;
            }

            let decision = entry.check(principal, Some(actee), &ctx)?;
            let verdict = decision.verdict;
            decisions.push(decision);
            if !verdict {
                continue;
            }
            authorized.extend(fields.iter().cloned());
            if !requested.is_empty() && requested.is_subset(&authorized) {
                break;
            }
        }

        let result: BTreeSet<String> = if requested.is_empty() {
            authorized
        } else {
            authorized.intersection(requested).cloned().collect()
        };
        let op_name = ObjectOp::from(op).as_str();
        self.record(op_name, principal, type_name, decisions, !result.is_empty());
        Ok(result)
    }

    /// Check a manager method invocation. Methods no ACL entry mentions fall
    /// back to the configured [`MethodCallDefault`].
    pub fn check_method_call(
        &self,
        principal: &Principal,
        manager: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), AuthzError> {
        let index = self.index.load_full();
        let types = index.types();
        let manager = types.canonical_manager(manager);
        let target = format!("{manager}.{method}");
        let entries = index.collect(AclQuery::Method(manager, method));

        if entries.is_empty() {
            return match self.method_default {
                MethodCallDefault::Allow => {
                    tracing::warn!(%target, "no ACL bound to method, allowing by default");
                    self.record("method", principal, &target, Vec::new(), true);
                    Ok(())
                }
                MethodCallDefault::Deny => {
                    self.record("method", principal, &target, Vec::new(), false);
                    Err(AuthzError::denied(format!("no ACL grants calling {target}")))
                }
            };
        }

        let ctx = CallContext::method_call(MethodCall {
            manager,
            method,
            args,
            kwargs,
            parameters: types.method_parameters(manager, method),
        });
        let mut decisions = Vec::new();
        let allowed = any_entry_passes(entries, principal, None, &ctx, &mut decisions)?;
        self.record("method", principal, &target, decisions, allowed);
        if allowed {
            Ok(())
        } else {
            Err(AuthzError::denied(format!("{principal} may not call {target}")))
        }
    }

    pub fn check_arbitrary_permissions(
        &self,
        principal: &Principal,
        permission: &str,
    ) -> Result<(), AuthzError> {
        let index = self.index.load_full();
        let entries = index.collect(AclQuery::Arbitrary(permission));
        let mut decisions = Vec::new();
        let allowed = any_entry_passes(
            entries,
            principal,
            None,
            &CallContext::default(),
            &mut decisions,
        )?;
        self.record("arbitrary", principal, permission, decisions, allowed);
        if allowed {
            Ok(())
        } else {
            Err(AuthzError::denied(format!(
                "{principal} lacks permission `{permission}`"
            )))
        }
    }

    fn check_object(
        &self,
        op: ObjectOp,
        principal: &Principal,
        actee: Actee<'_>,
    ) -> Result<(), AuthzError> {
        let index = self.index.load_full();
        let type_name = actee.type_name();
        let lineage = index.types().lineage(type_name);
        // a closer privilege record without `op` shadows the ancestor that granted it
        let entries: Vec<Arc<AclEntry>> = index
            .collect(AclQuery::Object(op, type_name))
            .iter()
            .filter(|entry| entry.crud_for(op, lineage).is_some())
            .cloned()
            .collect();
        let ctx = CallContext::object(op);
        let mut decisions = Vec::new();
        let allowed = any_entry_passes(&entries, principal, Some(actee), &ctx, &mut decisions)?;
        self.record(op.as_str(), principal, type_name, decisions, allowed);
        if allowed {
            Ok(())
        } else {
            Err(AuthzError::PermissionDenied {
                message: format!("{principal} may not {} {type_name}", op.as_str()),
                type_name: Some(type_name.to_string()),
                denied: BTreeSet::new(),
            })
        }
    }

    fn record(
        &self,
        operation: &str,
        principal: &Principal,
        target: &str,
        entries: Vec<EntryDecision>,
        allowed: bool,
    ) {
        audit::emit(
            self.audit.as_deref(),
            DecisionRecord {
                operation: operation.to_string(),
                principal: principal.to_string(),
                target: target.to_string(),
                entries,
                allowed,
            },
        );
    }
}

impl std::fmt::Debug for Authorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorizer")
            .field("index", &self.index.load().stats())
            .field("predicates", &self.predicates)
            .field("method_default", &self.method_default)
            .finish()
    }
}

fn build_index(
    store: &dyn AclStore,
    types: &Arc<TypeRegistry>,
    predicates: &PredicateRegistry,
) -> Result<AclIndex, AuthzError> {
    let records = store.load_acl_records()?;
    AclIndex::build(records, Arc::clone(types), predicates)
}

/// True as soon as one entry's combined check passes.
fn any_entry_passes(
    entries: &[Arc<AclEntry>],
    principal: &Principal,
    actee: Option<Actee<'_>>,
    ctx: &CallContext<'_>,
    decisions: &mut Vec<EntryDecision>,
) -> Result<bool, AuthzError> {
    for entry in entries {
        let decision = entry.check(principal, actee, ctx)?;
        let verdict = decision.verdict;
        decisions.push(decision);
        if verdict {
            return Ok(true);
        }
    }
    Ok(false)
}

fn require_coverage(
    op: &str,
    type_name: &str,
    requested: &BTreeSet<String>,
    authorized: &BTreeSet<String>,
) -> Result<(), AuthzError> {
    if requested.is_empty() {
        if authorized.is_empty() {
            return Err(AuthzError::PermissionDenied {
                message: format!("no attribute of {type_name} may be {op}"),
                type_name: Some(type_name.to_string()),
                denied: BTreeSet::new(),
            });
        }
        return Ok(());
    }
    let denied: BTreeSet<String> = requested.difference(authorized).cloned().collect();
    if denied.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = denied.iter().map(|s| s.as_str()).collect();
    Err(AuthzError::PermissionDenied {
        message: format!("cannot {op} {} of {type_name}", names.join(", ")),
        type_name: Some(type_name.to_string()),
        denied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::audit::MemoryAuditSink;
    use crate::authz::binding::{Predicate, PredicateContract};
    use crate::authz::errors::CheckError;
    use crate::authz::store::MemoryStore;
    use crate::authz::types::{
        AclRecord, AuthToken, CheckSpec, CrudRecord, EntityDecl, EntityRecord, ManagerDecl,
        Privilege, ACL_RECORD_VERSION,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Passes for the user id given in `user`.
    struct IsUser;

    impl Predicate for IsUser {
        fn contract(&self) -> PredicateContract {
            PredicateContract::ACTOR
        }

        fn check(
            &self,
            principal: Option<&AuthToken>,
            _actee: Option<Actee<'_>>,
            params: &Map<String, Value>,
            _ctx: &CallContext<'_>,
        ) -> Result<bool, CheckError> {
            let wanted = params.get("user").and_then(Value::as_i64);
            Ok(principal.map(|t| Some(t.user_id.0) == wanted).unwrap_or(false))
        }
    }

    fn types() -> Arc<TypeRegistry> {
        Arc::new(
            TypeRegistry::build(
                vec![
                    EntityDecl::new("Person", None),
                    EntityDecl::new("User", Some("Person")),
                ],
                vec![ManagerDecl::new("UserManager").alias("user_manager")],
            )
            .unwrap(),
        )
    }

    fn crud(read: &[&str], update: &[&str]) -> Privilege {
        Privilege::Crud(CrudRecord {
            create: false,
            read: read.iter().map(|s| s.to_string()).collect(),
            update: update.iter().map(|s| s.to_string()).collect(),
            delete: false,
        })
    }

    fn record(id: i64, user: i64, privileges: Vec<(&str, Privilege)>) -> AclRecord {
        AclRecord {
            version: ACL_RECORD_VERSION,
            id,
            role: format!("role-{id}"),
            privileges: privileges
                .into_iter()
                .map(|(t, p)| (t.to_string(), p))
                .collect::<BTreeMap<_, _>>(),
            arbitrary_perms: BTreeSet::new(),
            checks: vec![CheckSpec {
                predicate: "is_user".into(),
                params: json!({ "user": user }).as_object().cloned().unwrap(),
            }],
        }
    }

    fn authorizer(records: Vec<AclRecord>) -> (Authorizer, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for r in records {
            store.put_acl_record(r);
        }
        let predicates = PredicateRegistry::new().with("is_user", IsUser);
        let authz = Authorizer::new(store.clone(), types(), predicates).unwrap();
        (authz, store)
    }

    fn user(id: i64) -> Principal {
        Principal::User(AuthToken::new(id, "someone"))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_attributes_union_across_entries() {
        let (authz, _) = authorizer(vec![
            record(1, 1, vec![("User", crud(&["name"], &[]))]),
            record(2, 1, vec![("User", crud(&["email"], &[]))]),
            record(3, 2, vec![("User", crud(&["salary"], &[]))]),
        ]);
        let target = EntityRecord::new("User");
        let got = authz
            .get_authorized_attributes(
                AttributeOp::Read,
                &user(1),
                Actee::Instance(&target),
                &set(&["name", "email", "salary"]),
                None,
            )
            .unwrap();
        assert_eq!(got, set(&["name", "email"]));

        let everything = authz
            .get_authorized_attributes(AttributeOp::Read, &user(1), Actee::Type("User"), &set(&[]), None)
            .unwrap();
        assert_eq!(everything, set(&["name", "email"]));
    }

    #[test]
    fn test_read_denial_carries_attributes_and_type() {
        let (authz, _) = authorizer(vec![record(1, 1, vec![("User", crud(&["name"], &[]))])]);
        let err = authz
            .check_read_permissions(&user(1), Actee::Type("User"), &set(&["name", "salary"]))
            .unwrap_err();
        match err {
            AuthzError::PermissionDenied {
                type_name, denied, ..
            } => {
                assert_eq!(type_name.as_deref(), Some("User"));
                assert_eq!(denied, set(&["salary"]));
            }
            other => panic!("unexpected error {other:?}"),
        }
        authz
            .check_read_permissions(&user(1), Actee::Type("User"), &set(&["name"]))
            .unwrap();
    }

    #[test]
    fn test_update_uses_update_map_keys() {
        let (authz, _) = authorizer(vec![record(1, 1, vec![("Person", crud(&[], &["name"]))])]);
        let ok = json!({ "name": "Bo" }).as_object().cloned().unwrap();
        authz
            .check_update_permissions(&user(1), Actee::Type("User"), &ok)
            .unwrap();
        let too_much = json!({ "name": "Bo", "admin": true }).as_object().cloned().unwrap();
        assert!(authz
            .check_update_permissions(&user(1), Actee::Type("User"), &too_much)
            .unwrap_err()
            .is_permission_denied());
    }

    #[test]
    fn test_method_call_default_and_binding() {
        let (authz, store) = authorizer(vec![]);
        let kwargs = Map::new();
        authz
            .check_method_call(&user(1), "UserManager", "deactivate", &[], &kwargs)
            .unwrap();

        let mut methods = record(9, 2, vec![]);
        methods.privileges.insert(
            "UserManager".into(),
            Privilege::Methods {
                methods: set(&["deactivate"]),
            },
        );
        store.put_acl_record(methods);
        authz.flush().unwrap();
        assert!(authz
            .check_method_call(&user(1), "user_manager", "deactivate", &[], &kwargs)
            .is_err());
        authz
            .check_method_call(&user(2), "user_manager", "deactivate", &[], &kwargs)
            .unwrap();
    }

    #[test]
    fn test_method_call_default_deny() {
        let (authz, _) = authorizer(vec![]);
        let authz = authz.with_method_call_default(MethodCallDefault::Deny);
        assert!(authz
            .check_method_call(&user(1), "UserManager", "deactivate", &[], &Map::new())
            .unwrap_err()
            .is_permission_denied());
    }

    #[test]
    fn test_failed_flush_keeps_previous_index() {
        let (authz, store) = authorizer(vec![record(1, 1, vec![("User", crud(&["name"], &[]))])]);
        store.put_acl_record(record(2, 1, vec![("Spaceship", crud(&["x"], &[]))]));
        assert!(matches!(
            authz.flush(),
            Err(AuthzError::UnauthorizableType(_))
        ));
        assert_eq!(authz.index().stats().entries, 1);
    }

    #[test]
    fn test_snapshot_survives_flush() {
        let (authz, store) = authorizer(vec![record(1, 1, vec![("User", crud(&["name"], &[]))])]);
        let before = authz.index();
        store.remove_acl_record(1);
        authz.flush().unwrap();
        assert_eq!(before.stats().entries, 1);
        assert_eq!(authz.index().stats().entries, 0);
    }

    #[test]
    fn test_decisions_are_audited() {
        let (authz, _) = authorizer(vec![record(1, 1, vec![("User", crud(&["name"], &[]))])]);
        let sink = Arc::new(MemoryAuditSink::new());
        let authz = authz.with_audit_sink(sink.clone());
        let _ = authz.check_read_permissions(&user(2), Actee::Type("User"), &set(&["name"]));
        let record = sink.last().unwrap();
        assert_eq!(record.operation, "read");
        assert_eq!(record.target, "User");
        assert!(!record.allowed);
        assert_eq!(record.entries.len(), 1);
        assert_eq!(record.entries[0].role, "role-1");
        assert!(!record.entries[0].verdict);
    }

    #[test]
    fn test_subtype_record_shadows_supertype_grant() {
        let delete_only = Privilege::Crud(CrudRecord {
            delete: true,
            ..Default::default()
        });
        let (authz, _) = authorizer(vec![
            record(
                1,
                1,
                vec![("User", delete_only.clone()), ("Person", crud(&["salary"], &[]))],
            ),
            record(2, 2, vec![("User", crud(&["name"], &[])), ("Person", delete_only)]),
        ]);
        let salary = set(&["salary"]);

        let got = authz
            .get_authorized_attributes(AttributeOp::Read, &user(1), Actee::Type("User"), &salary, None)
            .unwrap();
        assert!(got.is_empty());
        assert!(authz
            .check_read_permissions(&user(1), Actee::Type("User"), &salary)
            .unwrap_err()
            .is_permission_denied());
        authz
            .check_delete_permissions(&user(1), Actee::Type("User"))
            .unwrap();
        authz
            .check_read_permissions(&user(1), Actee::Type("Person"), &salary)
            .unwrap();

        assert!(authz
            .check_delete_permissions(&user(2), Actee::Type("User"))
            .unwrap_err()
            .is_permission_denied());
        authz
            .check_delete_permissions(&user(2), Actee::Type("Person"))
            .unwrap();
    }

    /// Blocks the first armed load after reading the records until released.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl AclStore for GatedStore {
        fn load_acl_records(&self) -> Result<Vec<AclRecord>, AuthzError> {
            let records = self.inner.load_acl_records()?;
            let gate = self.gate.lock().take();
            if let Some((started, go)) = gate {
                let _ = started.send(());
                let _ = go.recv();
            }
            Ok(records)
        }
    }

    #[test]
    fn test_overlapping_flushes_publish_latest_records() {
        let inner = Arc::new(MemoryStore::new());
        inner.put_acl_record(record(1, 1, vec![("User", crud(&["name"], &[]))]));
        let store = Arc::new(GatedStore {
            inner: inner.clone(),
            gate: Mutex::new(None),
        });
        let predicates = PredicateRegistry::new().with("is_user", IsUser);
        let authz = Authorizer::new(store.clone(), types(), predicates).unwrap();

        let (started_tx, started_rx) = mpsc::channel();
        let (go_tx, go_rx) = mpsc::channel();
        *store.gate.lock() = Some((started_tx, go_rx));

        thread::scope(|s| {
            let stale = s.spawn(|| authz.flush().unwrap());
            started_rx.recv().unwrap();
            inner.put_acl_record(record(2, 1, vec![("User", crud(&["email"], &[]))]));
            let fresh = s.spawn(|| authz.flush().unwrap());
            // give the second flush time to reach the store
            thread::sleep(Duration::from_millis(50));
            go_tx.send(()).unwrap();
            stale.join().unwrap();
            fresh.join().unwrap();
        });

        assert_eq!(authz.index().stats().entries, 2);
    }
}
