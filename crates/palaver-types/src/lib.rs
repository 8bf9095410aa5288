pub mod api;
pub mod events;
pub mod fields;
pub mod ids;
pub mod models;
