//! Line-delimited transports to a pool.
//!
//! Stratum V1 is newline-delimited JSON over a stream. [`Transport`] moves
//! whole lines; [`Connector`] opens a transport for an endpoint so the
//! session never touches sockets directly.

use async_trait::async_trait;
use futures::{sink::SinkExt, stream::StreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, trace};

use crate::{
    config::{PoolEndpoint, StratumConfig},
    error::{Result, StratumError},
};

/// Message-level I/O for one pool connection
#[async_trait]
pub trait Transport: Send {
    /// Read one line. `None` on clean close.
    async fn read_line(&mut self) -> Result<Option<String>>;

    /// Write one line; the newline is added by the transport.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Flush and close the write side.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Opens transports for endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &PoolEndpoint) -> Result<Box<dyn Transport>>;
}

/// Any byte stream we can frame
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Newline-framed transport over TCP or TLS
pub struct LineTransport {
    framed: Framed<Box<dyn AsyncStream>, LinesCodec>,
}

impl LineTransport {
    pub fn new(stream: Box<dyn AsyncStream>, max_line_length: usize) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(max_line_length)),
        }
    }
}

fn codec_error(e: LinesCodecError) -> StratumError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            StratumError::Protocol("line exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => StratumError::Io(e),
    }
}

#[async_trait]
impl Transport for LineTransport {
    async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            match self.framed.next().await {
                Some(Ok(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    trace!("Received: {}", line);
                    return Ok(Some(line.to_string()));
                }
                Some(Err(e)) => return Err(codec_error(e)),
                None => return Ok(None),
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        trace!("Sending: {}", line);
        self.framed.send(line).await.map_err(codec_error)
    }

    async fn shutdown(&mut self) -> Result<()> {
        SinkExt::<String>::close(&mut self.framed)
            .await
            .map_err(codec_error)
    }
}

/// Plain TCP / TLS connector
pub struct TcpConnector {
    connection_timeout: Duration,
    max_line_length: usize,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    tls_ca_file: PathBuf,
}

impl TcpConnector {
    pub fn new(config: &StratumConfig) -> Self {
        Self {
            connection_timeout: config.connection_timeout(),
            max_line_length: config.max_line_length,
            tls_ca_file: config.tls_ca_file.clone(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &PoolEndpoint) -> Result<Box<dyn Transport>> {
        let address = endpoint.parse_url()?;
        let addr = format!("{}:{}", address.host, address.port);
        debug!(endpoint = %endpoint.name, addr = %addr, tls = address.tls, "Opening transport");

        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| StratumError::Timeout)?
            .map_err(|e| StratumError::Connection(format!("{}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| StratumError::Connection(e.to_string()))?;

        let stream: Box<dyn AsyncStream> = if address.tls {
            self.wrap_tls(stream, &address.host).await?
        } else {
            Box::new(stream)
        };

        Ok(Box::new(LineTransport::new(stream, self.max_line_length)))
    }
}

impl TcpConnector {
    #[cfg(feature = "tls")]
    async fn wrap_tls(&self, stream: TcpStream, host: &str) -> Result<Box<dyn AsyncStream>> {
        use std::sync::Arc;
        use tokio_rustls::{
            rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
            TlsConnector,
        };

        let file = std::fs::File::open(&self.tls_ca_file).map_err(|e| {
            StratumError::Tls(format!("{}: {}", self.tls_ca_file.display(), e))
        })?;
        let mut reader = std::io::BufReader::new(file);

        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| StratumError::Tls(e.to_string()))?;
            roots
                .add(cert)
                .map_err(|e| StratumError::Tls(e.to_string()))?;
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| StratumError::Tls(format!("invalid server name {}: {}", host, e)))?;

        let tls = timeout(
            self.connection_timeout,
            TlsConnector::from(Arc::new(config)).connect(server_name, stream),
        )
        .await
        .map_err(|_| StratumError::Timeout)?
        .map_err(|e| StratumError::Tls(e.to_string()))?;

        Ok(Box::new(tls))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(&self, _stream: TcpStream, host: &str) -> Result<Box<dyn AsyncStream>> {
        Err(StratumError::Tls(format!(
            "{} requires TLS but minewarden was built without the `tls` feature",
            host
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_line_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Echo server
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut conn = LineTransport::new(Box::new(socket), 1024);
            while let Ok(Some(line)) = conn.read_line().await {
                conn.write_line(&line).await.unwrap();
            }
        });

        let config = StratumConfig::default();
        let connector = TcpConnector::new(&config);
        let endpoint = PoolEndpoint::new("local", format!("stratum+tcp://{}", addr), 0);
        let mut conn = connector.connect(&endpoint).await.unwrap();

        conn.write_line(r#"{"id":1,"method":"mining.subscribe","params":[]}"#)
            .await
            .unwrap();
        let echoed = conn.read_line().await.unwrap().unwrap();
        assert_eq!(echoed, r#"{"id":1,"method":"mining.subscribe","params":[]}"#);
    }

    #[tokio::test]
    async fn test_connect_refused_counts_as_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = TcpConnector::new(&StratumConfig::default());
        let endpoint = PoolEndpoint::new("dead", format!("{}", addr), 0);
        let err = connector.connect(&endpoint).await.err().unwrap();
        assert!(matches!(err, StratumError::Connection(_) | StratumError::Io(_)));
        assert_eq!(err.breaker_action(), crate::error::BreakerAction::CountFailure);
    }
}
