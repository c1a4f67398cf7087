pub mod api;
pub mod files;
