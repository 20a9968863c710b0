//! Byte-stream transports for multiplexers.
//!
//! Targets are written as URIs:
//! - `tcp://host:port`
//! - `unix:///path/to/socket` (Unix only)
//!
//! [`TransportConnector`] opens client multiplexers (the pool's supplier
//! source), [`serve`] accepts connections and runs a server multiplexer for
//! each one.

mod connection;
mod uri;

pub use connection::{Connection, Listener};
pub use uri::Target;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MultiplexerConfig;
use crate::error::Result;
use crate::multiplexer::Multiplexer;
use crate::stream::{EmptyResponder, Responder};

/// Opens a client multiplexer for a target URI.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Multiplexer>;
}

/// [`Connector`] over TCP and Unix sockets.
#[derive(Clone)]
pub struct TransportConnector {
    config: MultiplexerConfig,
    responder: Arc<dyn Responder>,
}

impl TransportConnector {
    pub fn new(config: MultiplexerConfig) -> Self {
        Self {
            config,
            responder: Arc::new(EmptyResponder),
        }
    }

    /// Serve requests the remote side initiates on each connection.
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }
}

impl Default for TransportConnector {
    fn default() -> Self {
        Self::new(MultiplexerConfig::default())
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, uri: &str) -> Result<Multiplexer> {
        let target = Target::parse(uri)?;
        let connection = Connection::connect(&target).await?;
        tracing::debug!("connected to {}", target);
        Multiplexer::builder()
            .config(self.config.clone())
            .responder(self.responder.clone())
            .client(connection)
    }
}

impl Listener {
    /// Accept connections forever, one server multiplexer per connection.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn serve<F>(self, config: MultiplexerConfig, responder_factory: F) -> Result<()>
    where
        F: Fn() -> Arc<dyn Responder> + Send + Sync + 'static,
    {
        config.validate()?;
        loop {
            let connection = match self.accept().await {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    continue;
                }
            };
            match Multiplexer::builder()
                .config(config.clone())
                .responder(responder_factory())
                .server(connection)
            {
                Ok(multiplexer) => tracing::debug!("accepted {:?}", multiplexer),
                Err(e) => tracing::warn!("server multiplexer not started: {}", e),
            }
        }
    }
}

/// Bind `uri` and serve it. See [`Listener::serve`].
pub async fn serve<F>(uri: &str, config: MultiplexerConfig, responder_factory: F) -> Result<()>
where
    F: Fn() -> Arc<dyn Responder> + Send + Sync + 'static,
{
    let target = Target::parse(uri)?;
    let listener = Listener::bind(&target).await?;
    tracing::debug!("listening on {}", target);
    listener.serve(config, responder_factory).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RSocketError;
    use crate::payload::Payload;
    use crate::stream::ResponderBuilder;

    fn echo() -> Arc<dyn Responder> {
        ResponderBuilder::new()
            .request_response(|p: Payload| async move { Ok(p) })
            .build()
    }

    async fn spawn_server(uri: &str) -> String {
        let listener = Listener::bind(&Target::parse(uri).unwrap()).await.unwrap();
        let local = listener.local_target().unwrap().to_string();
        tokio::spawn(listener.serve(MultiplexerConfig::default(), echo));
        local
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let uri = spawn_server("tcp://127.0.0.1:0").await;
        assert!(uri.starts_with("tcp://127.0.0.1:"));

        let client = TransportConnector::default().connect(&uri).await.unwrap();
        let reply = client
            .request_response(Payload::from("over tcp"))
            .await
            .unwrap();
        assert_eq!(reply.data_utf8(), "over tcp");
        client.close();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_round_trip() {
        let path = std::env::temp_dir().join(format!("rsocket-mux-{}.sock", std::process::id()));
        let uri = spawn_server(&format!("unix://{}", path.display())).await;

        let client = TransportConnector::default().connect(&uri).await.unwrap();
        let reply = client
            .request_response(Payload::from("over unix"))
            .await
            .unwrap();
        assert_eq!(reply.data_utf8(), "over unix");
        client.close();
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_uri() {
        let err = TransportConnector::default()
            .connect("http://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::InvalidUri(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        // bind then drop to find a port nobody listens on
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TransportConnector::default()
            .connect(&format!("tcp://127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RSocketError::Io(_)));
    }
}
