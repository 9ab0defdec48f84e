pub mod bt;
pub mod transfer;
