//! Observable state shared by every backend service.

pub mod container;
pub mod patch;
pub mod persist;
pub mod projection;

pub use container::{StateContainer, StateUpdate, Transition};
pub use patch::{PatchOp, PatchSet};
pub use persist::PersistentContainer;
pub use projection::{Projection, Subscription};
