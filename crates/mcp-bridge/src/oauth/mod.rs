//! OAuth Provider and its supporting pieces: discovery, dynamic client
//! registration, URL sanitization, and the PKCE authorization-code flow.

pub mod dcr;
pub mod metadata;
pub mod provider;
pub mod sanitize;

pub use metadata::discover as discover_metadata;
pub use provider::{OAuthProvider, StaticOAuthConfig};
