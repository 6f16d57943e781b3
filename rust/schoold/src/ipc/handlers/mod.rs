pub mod backup;
pub mod classes;
pub mod core;
pub mod pupils;
pub mod setup;
pub mod snapshots;
pub mod years;
