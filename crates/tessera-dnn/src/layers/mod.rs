//! Built-in device layers.

mod constant;
mod relu;
mod scale;

pub use constant::ConstLayer;
pub use relu::ReluLayer;
pub use scale::ScaleLayer;
