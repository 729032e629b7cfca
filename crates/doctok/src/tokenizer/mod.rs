mod interface;
mod provider;
mod rule_based;
mod segment;

pub use interface::*;
pub use provider::*;
pub use rule_based::*;
pub use segment::*;
