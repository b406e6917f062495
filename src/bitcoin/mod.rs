pub mod history;
pub mod network;
pub mod transaction;
