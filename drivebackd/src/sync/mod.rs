pub mod dedup;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod staging;
pub mod transfer;
