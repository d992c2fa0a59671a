//! Client-side data access for Curtain dataset-sharing backends: a request
//! pipeline that routes to the active site and keeps bearer credentials
//! fresh, and a SQLite cache of everything fetched.

pub mod app;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod link;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod sites;

pub use app::App;
pub use error::{AppError, Result};
