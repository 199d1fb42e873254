pub mod config;
pub mod credentials;
pub mod logging;
pub mod session;

// Re-export the session handle at the root level
pub use config::SessionConfig;
pub use credentials::{AccountToken, CredentialSource, FileCredentials, MemoryCredentials};
pub use session::{Session, SessionError};
