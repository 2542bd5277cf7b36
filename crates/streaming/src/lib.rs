pub mod backend;
pub mod cache;
pub mod config;
pub mod protocol;
pub mod render;
pub mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::*;
pub use cache::*;
pub use config::*;
pub use protocol::*;
pub use render::*;
pub use store::*;
