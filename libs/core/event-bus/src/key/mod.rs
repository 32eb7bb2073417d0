//! Key pub/sub delivery to listeners of this instance.

mod handler;
mod registry;

pub use handler::{KeyRegistrationHandler, Registration};
