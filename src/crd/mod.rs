mod cluster;
mod database;
mod fencing;
mod role;

pub use cluster::*;
pub use database::*;
pub use fencing::*;
pub use role::*;
