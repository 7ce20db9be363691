#![allow(dead_code)]

pub mod git;
pub mod registry;

pub use git::TestRepo;
pub use registry::{InMemorySource, create_test_cache, create_test_manager};
