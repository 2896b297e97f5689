pub mod health;
pub mod items;
pub mod metrics;
pub mod process;
pub mod upload;
