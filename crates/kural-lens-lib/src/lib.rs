pub mod config;
pub mod context;
pub mod corpus;
pub mod error;
pub mod index;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod runtime;
pub mod state;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
