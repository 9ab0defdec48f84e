pub mod driver;
pub mod magnet;
