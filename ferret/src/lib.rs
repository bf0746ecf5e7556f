//! An intercepting HTTP(S) proxy.
//!
//! Every accepted connection is handed to a stack of [layers](layer): the
//! proxy mode decides where the connection goes, TLS is terminated (or
//! relayed) by [`tls`], and [`http`] parses HTTP/1, HTTP/2 and WebSocket
//! traffic into [`Flow`](flow::Flow)s that [`Hooks`](hooks::Hooks) can
//! inspect, change or kill.
//!
//! ```no_run
//! # async fn run() -> Result<(), ferret::Error> {
//! use ferret::{
//!     config::ProxyConfig,
//!     hooks::NoHooks,
//!     proxy::Proxy,
//!     server::Server,
//!     tls::ca::Ca,
//! };
//!
//! let ca = Ca::generate().await?;
//! let proxy = Proxy::new(ProxyConfig::default(), NoHooks, ca).await?;
//! Server::builder(proxy).serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod config;
pub mod connect;
pub mod connection;
pub mod flow;
pub mod hooks;
pub mod http;
pub mod layer;
pub mod proxy;
pub mod replay;
pub mod server;
pub mod tls;
pub mod util;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("tls error")]
    Tls(#[from] self::tls::Error),

    #[error("http error")]
    Http(#[from] self::http::Error),

    #[error("invalid configuration")]
    Config(#[from] self::config::Error),

    #[error("replay error")]
    Replay(#[from] self::replay::ReplayError),

    /// A layer needs to know where the connection is going, but no layer
    /// above it found out.
    #[error("{layer} layer has no destination")]
    NoDestination { layer: &'static str },
}
