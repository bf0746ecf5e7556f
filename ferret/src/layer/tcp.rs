//! Raw byte relay, for traffic we don't (or must not) interpret.

use async_trait::async_trait;
use tracing::Instrument;

use super::{
    Context,
    Layer,
};
use crate::{
    util::io::{
        is_disconnect,
        BoxedIo,
    },
    Error,
};

/// Relays bytes between the client and the server address set by the layers
/// above.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

#[async_trait]
impl Layer for Passthrough {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn layer(&self, context: Context, client: BoxedIo) -> Result<(), Error> {
        let server = match context.take_server() {
            Some(server) => server,
            None => {
                let address = context.server_address().ok_or(Error::NoDestination {
                    layer: self.name(),
                })?;
                context.open_server(&address, None).await?
            }
        };

        let span = tracing::debug_span!("tcp", server = %server.connection.address);
        relay(client, server.io).instrument(span).await?;
        Ok(())
    }
}

/// Copies bytes in both directions until both sides are done. A peer that
/// goes away is not an error.
pub async fn relay(mut client: BoxedIo, mut server: BoxedIo) -> Result<(), std::io::Error> {
    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((sent, received)) => {
            tracing::debug!(sent, received, "relay closed");
            Ok(())
        }
        Err(error) if is_disconnect(&error) => {
            tracing::debug!(%error, "relay closed");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{
        AsyncReadExt,
        AsyncWriteExt,
    };

    use super::relay;

    #[tokio::test]
    async fn it_relays_both_directions() {
        let (mut client, client_side) = tokio::io::duplex(1024);
        let (mut server, server_side) = tokio::io::duplex(1024);
        let task = tokio::spawn(relay(Box::new(client_side), Box::new(server_side)));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client);
        drop(server);
        task.await.unwrap().unwrap();
    }
}
