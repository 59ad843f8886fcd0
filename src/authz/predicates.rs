//! Predicates every deployment gets for free.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::authz::binding::{CallContext, Predicate, PredicateContract, PredicateRegistry};
use crate::authz::errors::CheckError;
use crate::authz::org_cache::OrgDescendantCache;
use crate::authz::store::Directory;
use crate::authz::types::{Actee, AuthToken};

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(_) => Err(format!("`{key}` must be a non-empty string")),
        None => Err(format!("missing `{key}`")),
    }
}

fn optional_str<'a>(
    params: &'a Map<String, Value>,
    key: &str,
    default: &'a str,
) -> Result<&'a str, String> {
    match params.get(key) {
        None => Ok(default),
        Some(_) => required_str(params, key),
    }
}

fn param<'a>(params: &'a Map<String, Value>, key: &str, default: &'a str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn token(principal: Option<&AuthToken>) -> Result<&AuthToken, CheckError> {
    principal.ok_or(CheckError::NotLoggedIn)
}

fn is_user_id(value: &Value, token: &AuthToken) -> bool {
    value.as_i64() == Some(token.user_id.0)
}

/// Unconditional grant, guests included.
#[derive(Debug, Default)]
pub struct Anyone;

impl Predicate for Anyone {
    fn contract(&self) -> PredicateContract {
        PredicateContract::OPEN
    }

    fn check(
        &self,
        _principal: Option<&AuthToken>,
        _actee: Option<Actee<'_>>,
        _params: &Map<String, Value>,
        _ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        Ok(true)
    }
}

/// Principal belongs to the group named by `group`.
pub struct IsMemberOf {
    directory: Arc<dyn Directory>,
}

impl IsMemberOf {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }
}

impl Predicate for IsMemberOf {
    fn contract(&self) -> PredicateContract {
        PredicateContract::ACTOR
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        required_str(params, "group").map(|_| ())
    }

    fn check(
        &self,
        principal: Option<&AuthToken>,
        _actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        _ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = token(principal)?;
        Ok(self
            .directory
            .is_member(token.user_id, param(params, "group", "")))
    }
}

/// Principal holds `role` in the actee's organization or in any of its
/// ancestors. The organization is read from the actee field named by
/// `field` (default `organization`).
pub struct HasOrgRole {
    directory: Arc<dyn Directory>,
    org_cache: Arc<OrgDescendantCache>,
}

impl HasOrgRole {
    pub fn new(directory: Arc<dyn Directory>, org_cache: Arc<OrgDescendantCache>) -> Self {
        Self {
            directory,
            org_cache,
        }
    }
}

impl Predicate for HasOrgRole {
    fn contract(&self) -> PredicateContract {
        PredicateContract::OBJECT
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        required_str(params, "role")?;
        optional_str(params, "field", "organization").map(|_| ())
    }

    fn check(
        &self,
        principal: Option<&AuthToken>,
        actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        _ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = token(principal)?;
        let field = param(params, "field", "organization");
        let target = actee
            .and_then(|a| a.field(field))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                CheckError::InvalidActeeType(format!("actee has no integer `{field}` field"))
            })?;
        let held = self
            .directory
            .org_role_orgs(token.user_id, param(params, "role", ""));
        self.org_cache
            .covers(&held, target)
            .map_err(|err| CheckError::Failed(err.to_string()))
    }
}

/// The actee is the principal's own user record.
#[derive(Debug, Default)]
pub struct ActorIsActee;

impl Predicate for ActorIsActee {
    fn contract(&self) -> PredicateContract {
        PredicateContract::OBJECT
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        optional_str(params, "type", "User").map(|_| ())
    }

    fn check(
        &self,
        principal: Option<&AuthToken>,
        actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        _ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = token(principal)?;
        let user_type = param(params, "type", "User");
        let Some(actee) = actee.filter(|a| a.type_name() == user_type) else {
            return Err(CheckError::InvalidActeeType(format!("actee is not a {user_type}")));
        };
        match actee.field("id") {
            Some(id) => Ok(is_user_id(&id, token)),
            None => Err(CheckError::InvalidActeeType("actee has no `id`".into())),
        }
    }
}

/// The actee's `field` (default `owner`) holds the principal's user id.
#[derive(Debug, Default)]
pub struct OwnsActee;

impl Predicate for OwnsActee {
    fn contract(&self) -> PredicateContract {
        PredicateContract::OBJECT
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        optional_str(params, "field", "owner").map(|_| ())
    }

    fn check(
        &self,
        principal: Option<&AuthToken>,
        actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        _ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = token(principal)?;
        let field = param(params, "field", "owner");
        match actee.and_then(|a| a.field(field)) {
            Some(owner) => Ok(is_user_id(&owner, token)),
            None => Err(CheckError::InvalidActeeType(format!(
                "actee has no `{field}` field"
            ))),
        }
    }
}

/// The method argument named by `argument` is the principal's user id.
#[derive(Debug, Default)]
pub struct ArgumentIsActor;

impl Predicate for ArgumentIsActor {
    fn contract(&self) -> PredicateContract {
        PredicateContract::ACTOR
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        required_str(params, "argument").map(|_| ())
    }

    fn check(
        &self,
        principal: Option<&AuthToken>,
        _actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = token(principal)?;
        let Some(call) = ctx.method else {
            return Err(CheckError::InvalidActeeType("not a method call".into()));
        };
        Ok(call
            .argument(param(params, "argument", ""))
            .map(|value| is_user_id(value, token))
            .unwrap_or(false))
    }
}

/// An update may only set `field` to one of `values`. Updates that leave
/// the field alone are not this predicate's business.
#[derive(Debug, Default)]
pub struct UpdateValueIn;

impl Predicate for UpdateValueIn {
    fn contract(&self) -> PredicateContract {
        PredicateContract::ACTOR
    }

    fn validate_params(&self, params: &Map<String, Value>) -> Result<(), String> {
        required_str(params, "field")?;
        match params.get("values") {
            Some(Value::Array(_)) => Ok(()),
            _ => Err("`values` must be a list".into()),
        }
    }

    fn check(
        &self,
        _principal: Option<&AuthToken>,
        _actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let field = param(params, "field", "");
        let Some(new_value) = ctx.update_map.and_then(|m| m.get(field)) else {
            return Err(CheckError::AttributeNotUpdated(field.to_string()));
        };
        Ok(params
            .get("values")
            .and_then(Value::as_array)
            .map(|allowed| allowed.contains(new_value))
            .unwrap_or(false))
    }
}

/// Registry holding every builtin under its policy name.
pub fn builtin_registry(
    directory: Arc<dyn Directory>,
    org_cache: Arc<OrgDescendantCache>,
) -> PredicateRegistry {
    PredicateRegistry::new()
        .with("anyone", Anyone)
        .with("is_member_of", IsMemberOf::new(Arc::clone(&directory)))
        .with("has_org_role", HasOrgRole::new(directory, org_cache))
        .with("actor_is_actee", ActorIsActee)
        .with("owns_actee", OwnsActee)
        .with("argument_is_actor", ArgumentIsActor)
        .with("update_value_in", UpdateValueIn)
}
