pub mod event;
pub mod plan;
pub mod provider;
pub mod session;
pub mod tool;

pub use event::*;
pub use plan::*;
pub use provider::*;
pub use session::*;
pub use tool::*;
