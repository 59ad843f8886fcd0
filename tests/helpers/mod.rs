#![allow(dead_code)]

pub mod builders;
pub mod fixtures;

pub use builders::{AclRecordBuilder, EntityBuilder};
pub use fixtures::{fixture_registry, user, TestWorld};
