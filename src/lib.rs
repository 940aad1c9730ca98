pub mod listener;
pub mod metrics;
pub mod models;
pub mod persister;
pub mod pipeline;
pub mod relay;
pub mod storage;
pub mod utils;
