pub mod intervals;
pub mod models;
