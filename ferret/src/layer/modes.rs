//! The outermost layer: how clients reach the proxy.

use async_trait::async_trait;

use super::{
    sniff::run_next,
    tcp::Passthrough,
    Context,
    Layer,
    Scope,
};
use crate::{
    address::TcpAddress,
    config::{
        ProxyMode,
        Scheme,
    },
    http::http1::Http1Layer,
    util::io::BoxedIo,
};

/// Sets up the context for the configured [`ProxyMode`] and starts the first
/// protocol layer.
#[derive(Debug)]
pub struct ModeLayer {
    mode: ProxyMode,
    original_destination: Option<TcpAddress>,
}

impl ModeLayer {
    /// `original_destination` is where a transparently redirected connection
    /// was originally going, if the platform can tell.
    pub fn new(mode: ProxyMode, original_destination: Option<TcpAddress>) -> Self {
        Self {
            mode,
            original_destination,
        }
    }
}

#[async_trait]
impl Layer for ModeLayer {
    fn name(&self) -> &'static str {
        "mode"
    }

    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), crate::Error> {
        match &self.mode {
            ProxyMode::Regular | ProxyMode::Upstream { .. } => {
                Http1Layer::explicit().layer(context, client).await
            }
            ProxyMode::Transparent => {
                let context = context.child(
                    "transparent",
                    Scope {
                        server_address: self.original_destination.clone(),
                        ..Default::default()
                    },
                );
                if let Some(address) = &self.original_destination {
                    if context.proxy().filters().ignores(Some(address), None) {
                        tracing::debug!(%address, "ignored host, relaying");
                        return Passthrough.layer(context, client).await;
                    }
                }
                run_next(context, client).await
            }
            ProxyMode::Reverse { scheme, server } => {
                let context = context.child(
                    "reverse",
                    Scope {
                        server_address: Some(server.clone()),
                        server_tls: Some(*scheme == Scheme::Https),
                        ..Default::default()
                    },
                );
                run_next(context, client).await
            }
        }
    }
}
