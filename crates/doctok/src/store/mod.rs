mod interface;
mod memory;
mod sync;

pub use interface::*;
pub use memory::*;
pub use sync::*;
