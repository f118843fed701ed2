//! TCP port forwarding in both directions.

use russh::server::{Handle, Msg};
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};

/// Map a client-supplied bind address to one we can listen on.
pub(crate) fn bind_address(address: &str) -> &str {
    match address {
        "" | "*" => "0.0.0.0",
        "localhost" => "127.0.0.1",
        other => other,
    }
}

/// Relay a `direct-tcpip` channel to `host:port`.
pub(crate) async fn relay_direct(channel: Channel<Msg>, host: String, port: u32) {
    let target = format!("{host}:{port}");
    let mut socket = match TcpStream::connect(&target).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("Failed to connect forward to {}: {}", target, e);
            let _ = channel.close().await;
            return;
        }
    };

    let mut stream = Box::pin(channel.into_stream());
    match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
        Ok((sent, received)) => tracing::debug!(
            "Forward to {} closed ({} bytes out, {} in)",
            target,
            sent,
            received
        ),
        Err(e) => tracing::debug!("Forward to {} ended: {}", target, e),
    }
}

/// Accept connections on a remote-forward listener and tunnel each one back
/// to the client as a `forwarded-tcpip` channel.
pub(crate) async fn accept_remote(listener: TcpListener, handle: Handle, address: String, port: u32) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Remote forward on {}:{} stopped: {}", address, port, e);
                return;
            }
        };

        let handle = handle.clone();
        let address = address.clone();
        tokio::spawn(async move {
            let channel = match handle
                .channel_open_forwarded_tcpip(
                    address.clone(),
                    port,
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::debug!("Client refused forwarded connection from {}: {}", peer, e);
                    return;
                }
            };

            let mut stream = Box::pin(channel.into_stream());
            if let Err(e) = tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                tracing::debug!("Forwarded connection from {} ended: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("", "0.0.0.0" ; "empty")]
    #[test_case("*", "0.0.0.0" ; "wildcard")]
    #[test_case("localhost", "127.0.0.1" ; "localhost")]
    #[test_case("10.1.2.3", "10.1.2.3" ; "literal")]
    fn maps_bind_addresses(input: &str, expected: &str) {
        assert_eq!(bind_address(input), expected);
    }
}
