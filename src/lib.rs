// feedspace - replicated object spaces over append-only feeds

pub mod codec;
pub mod config;
pub mod credentials;
pub mod event;
pub mod feed;
pub mod identity;
pub mod item;
pub mod keys;
pub mod models;
pub mod ordering;
pub mod pipeline;
pub mod protocol;
pub mod space;

pub use config::Config;
pub use keys::PublicKey;
pub use space::{Space, SpaceManager};
