pub mod config;
pub mod data;
pub mod events;
pub mod loss;
pub mod model;
pub mod npy;
pub mod train;
