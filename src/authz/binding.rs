//! Check predicates and their bindings to ACL entries.
//!
//! A predicate is a pluggable boolean test over `(principal, actee, static
//! params, call context)`. Each predicate declares a [`PredicateContract`]
//! at registration time; the contract is copied into every [`CheckBinding`]
//! when the index is built, so the hot path never has to ask the predicate
//! what it needs.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::authz::errors::{AuthzError, CheckError};
use crate::authz::types::{Actee, AuthToken, CheckSpec, ObjectOp, Principal};

/// What a predicate needs from its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredicateContract {
    /// The predicate cannot run without an actee.
    pub actee_required: bool,
    /// The predicate may be evaluated for guests (no auth token).
    pub allow_guests: bool,
}

impl PredicateContract {
    /// Authenticated principal, actee required.
    pub const OBJECT: Self = Self {
        actee_required: true,
        allow_guests: false,
    };

    /// Authenticated principal, no actee.
    pub const ACTOR: Self = Self {
        actee_required: false,
        allow_guests: false,
    };

    pub const OPEN: Self = Self {
        actee_required: false,
        allow_guests: true,
    };
}

pub trait Predicate: Send + Sync {
    fn contract(&self) -> PredicateContract;

    /// Checked once per binding when the index is built.
    fn validate_params(&self, _params: &Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    /// `principal` is `None` only for guests, and only when the contract
    /// allows guests. `actee` is always `Some` when the contract requires it.
    fn check(
        &self,
        principal: Option<&AuthToken>,
        actee: Option<Actee<'_>>,
        params: &Map<String, Value>,
        ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError>;
}

/// Named predicates available to ACL records.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, predicate: Arc<dyn Predicate>) {
        self.predicates.insert(name.to_string(), predicate);
    }

    pub fn with(mut self, name: &str, predicate: impl Predicate + 'static) -> Self {
        self.register(name, Arc::new(predicate));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Predicate>> {
        self.predicates.get(name)
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("PredicateRegistry")
            .field("predicates", &names)
            .finish()
    }
}

/// The manager method being invoked, for method-call checks.
#[derive(Debug, Clone, Copy)]
pub struct MethodCall<'a> {
    pub manager: &'a str,
    pub method: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
    /// Declared parameter names of the method, in positional order.
    pub parameters: &'a [String],
}

impl<'a> MethodCall<'a> {
    /// Look an argument up by name: keyword arguments first, then the
    /// positional argument at the parameter's declared position.
    pub fn argument(&self, name: &str) -> Option<&'a Value> {
        let (args, kwargs): (&'a [Value], &'a Map<String, Value>) = (self.args, self.kwargs);
        if let Some(value) = kwargs.get(name) {
            return Some(value);
        }
        let position = self.parameters.iter().position(|p| p == name)?;
        args.get(position)
    }
}

/// Per-call context handed to every predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext<'a> {
    pub op: Option<ObjectOp>,
    /// Pending changes, for update checks
    pub update_map: Option<&'a Map<String, Value>>,
    pub method: Option<MethodCall<'a>>,
}

impl<'a> CallContext<'a> {
    pub fn object(op: ObjectOp) -> Self {
        Self {
            op: Some(op),
            ..Default::default()
        }
    }

    pub fn update(update_map: Option<&'a Map<String, Value>>) -> Self {
        Self {
            op: Some(ObjectOp::Update),
            update_map,
            method: None,
        }
    }

    pub fn method_call(call: MethodCall<'a>) -> Self {
        Self {
            op: None,
            update_map: None,
            method: Some(call),
        }
    }
}

/// A predicate bound to one ACL entry with its static parameters.
#[derive(Clone)]
pub struct CheckBinding {
    name: String,
    predicate: Arc<dyn Predicate>,
    params: Map<String, Value>,
    actee_required: bool,
    allow_guests: bool,
}

impl CheckBinding {
    pub fn bind(spec: &CheckSpec, registry: &PredicateRegistry) -> Result<Self, AuthzError> {
        let predicate = registry
            .get(&spec.predicate)
            .ok_or_else(|| AuthzError::UnknownPredicate(spec.predicate.clone()))?;
        predicate
            .validate_params(&spec.params)
            .map_err(|message| AuthzError::InvalidPredicateParams {
                predicate: spec.predicate.clone(),
                message,
            })?;
        let contract = predicate.contract();
        Ok(Self {
            name: spec.predicate.clone(),
            predicate: Arc::clone(predicate),
            params: spec.params.clone(),
            actee_required: contract.actee_required,
            allow_guests: contract.allow_guests,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow_guests(&self) -> bool {
        self.allow_guests
    }

    /// Evaluate the binding. Guests are turned away without invoking the
    /// predicate unless the contract allows them.
    pub fn call(
        &self,
        principal: &Principal,
        actee: Option<Actee<'_>>,
        ctx: &CallContext<'_>,
    ) -> Result<bool, CheckError> {
        let token = match principal {
            Principal::User(token) => Some(token),
            Principal::Invalid { .. } => return Err(CheckError::NotLoggedIn),
            Principal::Guest if !self.allow_guests => return Ok(false),
            Principal::Guest => None,
        };
        if self.actee_required && actee.is_none() {
            return Err(CheckError::InvalidActeeType(format!(
                "`{}` requires an actee",
                self.name
            )));
        }
        self.predicate.check(token, actee, &self.params, ctx)
    }
}

impl std::fmt::Debug for CheckBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckBinding")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("actee_required", &self.actee_required)
            .field("allow_guests", &self.allow_guests)
            .finish()
    }
}
