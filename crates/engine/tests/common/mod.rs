pub mod fixtures;
pub mod harness;
pub mod mocks;

#[allow(unused_imports)]
pub use harness::TestEngine;
