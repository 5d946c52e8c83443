pub mod annotations;
pub mod event;
pub mod tracked;
pub mod webhook;

pub use event::*;
pub use tracked::*;
pub use webhook::*;
