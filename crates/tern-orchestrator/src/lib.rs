pub mod coordinator;
pub mod model;
pub mod status;

pub use coordinator::Coordinator;
pub use model::{ClassifyOutcome, ManagerState, MessageEntry, Route, StatusSnapshot};
pub use status::{programmer_display_status, resolve_status};
