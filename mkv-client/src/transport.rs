//! Socket setup: TCP dial with an optional timeout, then optional TLS.

use std::io;

use mkv_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{ConnConfig, TlsConfig};

/// Byte stream a connection runs on, plain or encrypted.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type BoxStream = Box<dyn AsyncStream>;

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_addr(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::InvalidAddress(addr.to_string()));
    }
    Ok((host, port))
}

/// Opens the stream for `addr`.
pub(crate) async fn dial(addr: &str, config: &ConnConfig) -> Result<BoxStream> {
    let (host, _) = split_addr(addr)?;
    let connect = TcpStream::connect(addr);
    let connected = match config.connect_timeout {
        Some(limit) => match tokio::time::timeout(limit, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
        },
        None => connect.await,
    };
    let stream = connected.map_err(|source| Error::Dial {
        addr: addr.to_string(),
        source,
    })?;
    stream.set_nodelay(true)?;

    match &config.tls {
        Some(tls) => wrap_tls(host, stream, tls).await,
        None => Ok(Box::new(stream)),
    }
}

#[cfg(feature = "tls")]
async fn wrap_tls(host: &str, stream: TcpStream, tls: &TlsConfig) -> Result<BoxStream> {
    use tokio_native_tls::native_tls;

    let mut builder = native_tls::TlsConnector::builder();
    if tls.skip_verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    if let Some(path) = &tls.ca_cert {
        let pem = tokio::fs::read(path).await?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|err| Error::Tls(err.to_string()))?;
        builder.add_root_certificate(cert);
    }
    let connector = builder.build().map_err(|err| Error::Tls(err.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);

    let domain = tls.domain.as_deref().unwrap_or(host);
    let stream = connector
        .connect(domain, stream)
        .await
        .map_err(|err| Error::Tls(err.to_string()))?;
    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(_host: &str, _stream: TcpStream, _tls: &TlsConfig) -> Result<BoxStream> {
    Err(Error::Tls("built without the `tls` feature".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_addr("127.0.0.1:6379").unwrap(), ("127.0.0.1", 6379));
        assert_eq!(split_addr("[::1]:7000").unwrap(), ("::1", 7000));
        assert!(matches!(split_addr("localhost"), Err(Error::InvalidAddress(_))));
        assert!(matches!(split_addr(":6379"), Err(Error::InvalidAddress(_))));
        assert!(matches!(split_addr("host:port"), Err(Error::InvalidAddress(_))));
    }
}
