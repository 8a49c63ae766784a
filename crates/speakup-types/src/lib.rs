pub mod api;
pub mod cache;
pub mod call;
pub mod events;
pub mod models;
pub mod optimistic;
