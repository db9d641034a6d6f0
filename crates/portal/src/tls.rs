// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use eyre::{WrapErr, eyre};
use link_common::SessionError;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::server::TlsStream;

/// Clients that stall mid-handshake are dropped after this.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an acceptor from PEM certificate chain and private key files.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, eyre::Report> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path)
            .wrap_err_with(|| format!("Unable to open certificate {}", cert_path.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .wrap_err("Unable to parse certificate chain")?;
    if certs.is_empty() {
        return Err(eyre!("No certificates in {}", cert_path.display()));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path)
            .wrap_err_with(|| format!("Unable to open private key {}", key_path.display()))?,
    ))
    .wrap_err("Unable to parse private key")?
    .ok_or_else(|| eyre!("No private key in {}", key_path.display()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Complete the TLS handshake. No session exists until this succeeds.
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>, SessionError> {
    match tokio::time::timeout(timeout, acceptor.accept(stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(SessionError::TransportHandshake(e.to_string())),
        Err(_) => Err(SessionError::TransportHandshake(format!(
            "no TLS handshake within {timeout:?}"
        ))),
    }
}
