pub mod context;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod sse;

pub use context::RequestContext;
pub use handler::{handle_http, McpHttpRequest, McpHttpResponse};
pub use protocol::has_tavily_tools_call;
pub use session::SessionRegistry;
