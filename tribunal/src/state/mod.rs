//! Workflow state: typed records, slot reducers and the run-scoped store

pub mod patch;
pub mod reducers;
pub mod store;
pub mod types;

pub use patch::StatePatch;
pub use reducers::{ReducerKind, Slot, SlotShape, StateSchema};
pub use store::{StateError, StateResult, StateStore};
pub use types::*;
