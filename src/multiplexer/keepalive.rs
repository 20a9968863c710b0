use std::sync::Weak;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::MissedTickBehavior;

use super::Shared;
use crate::frame::Frame;

/// Send KEEPALIVE every `interval` and close once the peer has been silent
/// for longer than `max_lifetime`.
pub(super) async fn keepalive_loop(shared: Weak<Shared>, interval: Duration, max_lifetime: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.is_closed() {
            return;
        }

        let silent = shared.last_received.lock().elapsed();
        if silent > max_lifetime {
            tracing::error!("No frames received for {:?}, closing connection", silent);
            shared.terminate();
            return;
        }

        if let Err(e) = shared.writer.send_now(&Frame::keepalive(true, 0, Bytes::new())) {
            tracing::debug!("KEEPALIVE not sent: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Multiplexer, RSocketError};
    use crate::frame::{Frame, FrameBuffer};
    use crate::payload::Payload;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_closes_connection() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let client = Multiplexer::builder()
            .keepalive(Duration::from_millis(100), Duration::from_millis(350))
            .client(a)
            .unwrap();
        let pending = client.request_response(Payload::from("never answered"));

        // the peer reads but never writes
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut frames = FrameBuffer::new();
            let mut keepalives = 0;
            while let Ok(n) = b.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                for frame in frames.push(&buf[..n]).unwrap() {
                    if let Frame::Keepalive(k) = frame {
                        assert!(k.respond());
                        keepalives += 1;
                    }
                }
            }
            keepalives
        });

        client.closed().await;
        assert!(matches!(pending.await, Err(RSocketError::ConnectionClosed)));
        assert!(drain.await.unwrap() >= 2);
    }
}
