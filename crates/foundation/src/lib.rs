pub mod bounds;
pub mod cache_key;
pub mod cell;
pub mod partition;
pub mod quantize;

// Foundation crate: pure grid geometry, no I/O.
pub use bounds::*;
pub use cache_key::*;
pub use cell::*;
pub use partition::*;
