pub mod config;
pub mod cursor;
pub mod entry;
pub mod recovery;
pub mod slotted_page;
