mod files;
mod state_store;

pub use state_store::{StackSummary, StateStore, StoreOptions};
