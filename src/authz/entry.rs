use std::collections::{BTreeMap, BTreeSet};

use crate::authz::audit::{BindingOutcome, BindingResult, EntryDecision};
use crate::authz::binding::{CallContext, CheckBinding, PredicateRegistry};
use crate::authz::errors::{AuthzError, CheckError};
use crate::authz::types::{
    Actee, AclRecord, AttributeOp, CrudRecord, ObjectOp, Principal, Privilege, ACL_RECORD_VERSION,
};

/// One role's privilege bundle plus the predicates that restrict it.
#[derive(Debug, Clone)]
pub struct AclEntry {
    id: i64,
    role: String,
    privileges: BTreeMap<String, Privilege>,
    arbitrary_perms: BTreeSet<String>,
    bindings: Vec<CheckBinding>,
}

impl AclEntry {
    pub fn from_record(record: AclRecord, predicates: &PredicateRegistry) -> Result<Self, AuthzError> {
        if record.version != ACL_RECORD_VERSION {
            return Err(AuthzError::UnsupportedRecordVersion {
                id: record.id,
                version: record.version,
            });
        }
        let bindings = record
            .checks
            .iter()
            .map(|spec| CheckBinding::bind(spec, predicates))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: record.id,
            role: record.role,
            privileges: record.privileges,
            arbitrary_perms: record.arbitrary_perms,
            bindings,
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn privileges(&self) -> &BTreeMap<String, Privilege> {
        &self.privileges
    }

    pub fn arbitrary_perms(&self) -> &BTreeSet<String> {
        &self.arbitrary_perms
    }

    pub fn bindings(&self) -> &[CheckBinding] {
        &self.bindings
    }

    /// The nearest CRUD record along `lineage` (type first, then ancestors),
    /// if it grants `op`. A closer record shadows its ancestors even when it
    /// grants nothing for `op`.
    pub fn crud_for(&self, op: ObjectOp, lineage: &[String]) -> Option<&CrudRecord> {
        let crud = lineage.iter().find_map(|type_name| match self.privileges.get(type_name) {
            Some(Privilege::Crud(crud)) => Some(crud),
            _ => None,
        })?;
        crud.grants(op).then_some(crud)
    }

    pub fn attribute_fields(&self, op: AttributeOp, lineage: &[String]) -> Option<&BTreeSet<String>> {
        self.crud_for(op.into(), lineage).map(|crud| crud.fields(op))
    }

    /// Run every binding in order.
    ///
    /// Bindings that report the actee or update as not applicable are
    /// skipped. The first binding that returns `false` decides the entry. An
    /// entry none of whose bindings applied is denied.
    pub fn check(
        &self,
        principal: &Principal,
        actee: Option<Actee<'_>>,
        ctx: &CallContext<'_>,
    ) -> Result<EntryDecision, AuthzError> {
        let mut valid_type = false;
        let mut outcomes = Vec::with_capacity(self.bindings.len());

        for binding in &self.bindings {
            let result = match binding.call(principal, actee, ctx) {
                Ok(true) => {
                    valid_type = true;
                    BindingResult::Passed
                }
                Ok(false) => {
                    let result = if principal.is_guest() && !binding.allow_guests() {
                        BindingResult::GuestRejected
                    } else {
                        BindingResult::Failed
                    };
                    outcomes.push(BindingOutcome {
                        predicate: binding.name().to_string(),
                        result,
                    });
                    return Ok(self.decision(outcomes, false));
                }
                Err(CheckError::InvalidActeeType(reason)) => BindingResult::NotApplicable(reason),
                Err(err @ CheckError::AttributeNotUpdated(_)) => {
                    valid_type = true;
                    BindingResult::NotApplicable(err.to_string())
                }
                Err(CheckError::NotLoggedIn) => return Err(AuthzError::NotLoggedIn),
                Err(CheckError::Failed(message)) => {
                    return Err(AuthzError::PredicateFailed {
                        predicate: binding.name().to_string(),
                        message,
                    })
                }
            };
            outcomes.push(BindingOutcome {
                predicate: binding.name().to_string(),
                result,
            });
        }

        Ok(self.decision(outcomes, valid_type))
    }

    fn decision(&self, bindings: Vec<BindingOutcome>, verdict: bool) -> EntryDecision {
        EntryDecision {
            role: self.role.clone(),
            entry_id: self.id,
            bindings,
            verdict,
        }
    }
}
