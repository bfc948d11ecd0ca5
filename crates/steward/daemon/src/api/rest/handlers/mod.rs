//! API request handlers

mod approvals;
mod events;
mod graphs;
mod health;
mod runs;

pub use approvals::*;
pub use events::*;
pub use graphs::*;
pub use health::*;
pub use runs::*;
