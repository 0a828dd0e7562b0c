//! Gateway server implementation

pub mod auth;
mod check;
mod dispatcher;
pub mod rewrite;
mod router;
mod server;
mod upgrade;

pub use auth::{ResolvedAuthConfig, UserIdentity, auth_middleware};
pub use check::{BindingCheck, check_bindings};
pub use dispatcher::Dispatcher;
pub use rewrite::{ProxyTarget, RequestRewrites};
pub use router::{AppState, create_router};
pub use server::Gateway;
