pub mod config;
pub mod control;
pub mod daemon;
pub mod dest;
pub mod state;
pub mod sync;
