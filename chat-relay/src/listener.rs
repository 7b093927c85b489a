//! Accept loop plus the per-connection handshake and receive loop.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::oneshot,
};
use tracing::{debug, warn};

use crate::{
    frame::{ChannelError, read_frame, read_string},
    relay::{RelayEvent, RelayShared},
    session::Session,
};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no username received within {0:?}")]
    TimedOut(Duration),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub(crate) async fn run_accept_loop(
    listener: TcpListener,
    shared: Arc<RelayShared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        select! {
            _ = &mut shutdown => {
                debug!("accept loop shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => spawn_connection_handler(stream, peer, &shared),
                    Err(err) if !shared.is_running() => {
                        debug!(error = ?err, "accept interrupted by shutdown");
                        break;
                    }
                    Err(err) => {
                        warn!(error = ?err, "failed to accept connection");
                        shared.notify(RelayEvent::Fault(format!("accept failed: {err}")));
                    }
                }
            }
        }
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, shared: &Arc<RelayShared>) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        handle_connection(stream, peer, shared).await;
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<RelayShared>) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let username = match perform_handshake(&mut reader, shared.config.handshake_timeout).await {
        Ok(username) => username,
        Err(error) => {
            debug!(%peer, %error, "dropping connection without a handshake");
            return;
        }
    };

    let session = Arc::new(Session::new(shared.next_id(), username, Some(peer), writer));
    if !shared.register(&session).await {
        return;
    }

    run_receive_loop(&shared, &session, &mut reader).await;
    shared.disconnect(&session).await;
}

/// Reads the bare username string every client sends first.
pub async fn perform_handshake<R>(
    reader: &mut R,
    limit: Option<Duration>,
) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let username = match limit {
        Some(limit) => tokio::time::timeout(limit, read_string(reader))
            .await
            .map_err(|_| HandshakeError::TimedOut(limit))??,
        None => read_string(reader).await?,
    };
    Ok(username)
}

async fn run_receive_loop<R>(shared: &RelayShared, session: &Arc<Session>, reader: &mut R)
where
    R: AsyncRead + Unpin,
{
    let max_image_bytes = shared.config.max_image_bytes;
    loop {
        select! {
            _ = session.closed() => break,
            frame = read_frame(reader, max_image_bytes) => {
                match frame {
                    Ok(frame) => shared.relay_from(session, frame).await,
                    Err(error) => {
                        debug!(username = %session.username(), %error, "receive loop ending");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::write_string;

    #[tokio::test]
    async fn handshake_reads_the_username() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_string(&mut client, "alice").await.expect("write");

        let username = perform_handshake(&mut server, Some(Duration::from_secs(1)))
            .await
            .expect("handshake");
        assert_eq!(username, "alice");
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let limit = Duration::from_millis(50);

        let err = perform_handshake(&mut server, Some(limit))
            .await
            .expect_err("should time out");
        assert!(matches!(err, HandshakeError::TimedOut(waited) if waited == limit));
    }

    #[tokio::test]
    async fn client_hanging_up_fails_the_handshake() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = perform_handshake(&mut server, None).await.expect_err("should fail");
        assert!(matches!(err, HandshakeError::Channel(ChannelError::Closed)));
    }
}
