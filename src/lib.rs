//! Gatekeeper - authorization decision engine
//!
//! Indexed role ACLs with check predicates, plus a generation-versioned cache
//! of the organization hierarchy. The binary serves a small admin API; the
//! library is what host applications call on every request.

pub mod authz;
pub mod errors;
pub mod settings;
