pub mod coords;
pub mod ingest;
pub mod inventory;
pub mod status;
