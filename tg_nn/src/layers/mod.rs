//! Layers built from engine variables.

mod linear;

pub use linear::Linear;
