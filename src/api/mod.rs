//! Control protocol: message vocabulary and frame codec.

pub mod codec;
pub mod model;
