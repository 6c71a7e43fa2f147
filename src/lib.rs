//! MCP hub: one aggregated Model Context Protocol endpoint over many
//! upstream tool servers.
//!
//! ## Modules
//!
//! - [`settings`]: the configuration document, persistence, change events
//! - [`groups`]: group selectors and resolution
//! - [`upstream`]: upstream clients (stdio/SSE/streamable-HTTP/OpenAPI) and
//!   the connection supervisor
//! - [`catalog`]: the merged tool view and its filtering pipeline
//! - [`index`]: similarity search over tool descriptions
//! - [`session`]: downstream sessions, the per-session MCP server, smart mode
//! - [`server`]: the axum HTTP surface
//! - [`hub`]: the owner value tying it all together

pub mod catalog;
pub mod error;
pub mod groups;
pub mod hub;
pub mod index;
pub mod server;
pub mod session;
pub mod settings;
pub mod upstream;

pub use catalog::{Catalog, ServerStatus, ToolInfo};
pub use error::{HubError, HubResult};
pub use hub::{Hub, HubStats};
pub use server::build_router;
pub use session::HubService;
pub use settings::{ServerConfig, Settings, SettingsStore};
pub use upstream::Supervisor;
