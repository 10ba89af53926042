pub mod credentials;
pub mod events;
pub mod models;
pub mod variations;
