use std::pin::Pin;

use anyhow::Context;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HyperAcceptor;
use hyper_util::service::TowerToHyperService;
use openssl::ssl::{Ssl, SslAcceptor, SslFiletype, SslMethod, SslVerifyMode};
use tokio::net::TcpListener;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::server::TlsPaths;

/// Acceptor that terminates TLS and requires a client certificate signed by
/// the configured CA. Requests that reach a handler are therefore already
/// authenticated.
pub fn build_acceptor(paths: &TlsPaths) -> anyhow::Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .context("initialize TLS acceptor")?;
    builder
        .set_private_key_file(&paths.key, SslFiletype::PEM)
        .with_context(|| format!("load server key {}", paths.key.display()))?;
    builder
        .set_certificate_chain_file(&paths.cert)
        .with_context(|| format!("load server certificate {}", paths.cert.display()))?;
    builder
        .set_ca_file(&paths.ca)
        .with_context(|| format!("load client CA {}", paths.ca.display()))?;
    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    Ok(builder.build())
}

pub async fn serve_tls(
    listener: TcpListener,
    acceptor: SslAcceptor,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };

        let ssl = match Ssl::new(acceptor.context()) {
            Ok(ssl) => ssl,
            Err(err) => {
                warn!("failed to prepare TLS session: {err}");
                continue;
            }
        };
        let app = app.clone();

        tokio::spawn(async move {
            let mut tls_stream = match SslStream::new(ssl, stream) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("failed to wrap connection from {remote_addr}: {err}");
                    return;
                }
            };
            if let Err(err) = Pin::new(&mut tls_stream).accept().await {
                warn!("TLS handshake failed from {remote_addr}: {err}");
                return;
            }

            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(app);
            if let Err(err) = HyperAcceptor::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                let benign = err
                    .downcast_ref::<hyper::Error>()
                    .map(|e| e.is_closed() || e.is_incomplete_message())
                    .unwrap_or(false);
                if !benign {
                    warn!("error serving connection from {remote_addr}: {err}");
                }
            }
        });
    }
}
