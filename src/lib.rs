#![doc = include_str!("../README.md")]

pub mod admin;
pub mod client;
pub mod error;
pub mod store;
pub mod token;
pub mod transport;
pub mod types;
pub mod user;

mod refresh;
mod session;

// Re-exports for convenient access
pub use admin::AdminClient;
pub use client::{Config, IdentityClient};
pub use error::Error;
pub use store::{FileStore, MemoryStore, SessionStore, StoredSession};
pub use token::{Token, decode_expiry};
pub use transport::{CookieChoice, RequestOptions, Transport};
pub use types::{Settings, UserId};
pub use user::{User, UserData};
