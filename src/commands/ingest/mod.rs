mod aggregate;
mod checkpoint;
mod client;
#[cfg(test)]
mod fakes;
mod kmz;
mod pdf_text;
mod prompt;
mod report;
mod run;
mod sink;

pub use checkpoint::load_checkpoint;
pub use kmz::locate_coordinates;
pub use run::run;
pub use sink::{OutputPaths, TABLE_NAME};
