mod bridge;
mod broadcaster;
mod throttle;

pub use bridge::*;
pub use broadcaster::*;
pub use throttle::*;
