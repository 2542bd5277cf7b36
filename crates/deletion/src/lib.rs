pub mod account;
pub mod machine;

pub use account::*;
pub use machine::*;
pub use streaming::ClickMode;
