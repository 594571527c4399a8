pub mod credentials;
pub mod events;
pub mod metadata;
pub mod models;
pub mod settings;
pub mod target;
