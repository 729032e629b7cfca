mod manager;
mod worker;

pub use manager::*;
pub(crate) use worker::panic_reason;
