mod build;
mod doctor;
mod rotate;

pub use build::{BuildOverrides, build};
pub use doctor::doctor;
pub use rotate::rotate;
