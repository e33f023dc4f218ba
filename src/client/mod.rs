pub use self::auth::{Auth, Decision, NoAuth};
pub use self::body::Body;
pub use self::http1::{HttpConnection, HttpState};
pub use self::pool::{Pool, PoolBuilder};
pub use self::request::{Request, RequestBuilder, Timeouts};
pub use self::response::Response;
pub use self::ws::{Message, WebSocket, WebSocketBuilder, WebSocketState};

mod auth;
mod body;
pub(crate) mod http1;
mod pool;
pub(crate) mod request;
pub(crate) mod response;
mod ws;
