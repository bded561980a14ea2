//! Message-Bus Subscriber
//!
//! Subscribes to the alert subject on a NATS-wire-protocol broker and
//! feeds raw alert documents into the ingress queue. Only the subscriber
//! side of the protocol is spoken: `CONNECT`, `SUB`, `PING`/`PONG` and
//! `MSG` framing. Connection loss triggers reconnects with exponential
//! backoff; exhausting the reconnect policy is fatal to the process.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::config::BusConfig;
use crate::ingress::AlertQueue;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("TLS bus connections are not supported")]
    TlsUnsupported,

    #[error("bus connection lost after {0} reconnect attempts")]
    ReconnectsExhausted(u32),

    #[error("bus protocol error: {0}")]
    Protocol(String),

    #[error("bus IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct BusSubscriber {
    config: BusConfig,
    queue: AlertQueue,
}

impl BusSubscriber {
    pub fn new(config: BusConfig, queue: AlertQueue) -> Self {
        Self { config, queue }
    }

    /// Subscribe and pump messages until the reconnect policy is
    /// exhausted. Only returns on fatal conditions.
    pub async fn run(self) -> Result<(), BusError> {
        if self.config.tls {
            return Err(BusError::TlsUnsupported);
        }
        let address = format!("{}:{}", self.config.host, self.config.port);
        let mut attempts: u32 = 0;

        loop {
            match self.session(&address).await {
                Ok(()) => {
                    // Clean EOF from the broker; treat like a drop.
                    attempts = 0;
                }
                Err(BusError::Io(e)) => {
                    tracing::warn!(error = %e, attempts, "bus connection failed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempts, "bus session error");
                }
            }
            attempts += 1;
            if attempts > self.config.max_reconnects {
                return Err(BusError::ReconnectsExhausted(self.config.max_reconnects));
            }
            let backoff = Duration::from_millis(500u64.saturating_mul(1 << attempts.min(6)));
            tracing::info!(attempts, backoff_ms = backoff.as_millis() as u64, "reconnecting to bus");
            tokio::time::sleep(backoff).await;
        }
    }

    /// One connected session: handshake, subscribe, pump until EOF.
    async fn session(&self, address: &str) -> Result<(), BusError> {
        let stream = TcpStream::connect(address).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The broker greets with INFO before anything else
        let greeting = read_line(&mut reader).await?;
        if !greeting.starts_with("INFO ") {
            return Err(BusError::Protocol(format!(
                "expected INFO greeting, got '{greeting}'"
            )));
        }
        write_half
            .write_all(b"CONNECT {\"verbose\":false,\"pedantic\":false,\"name\":\"mitigator\"}\r\n")
            .await?;
        write_half
            .write_all(format!("SUB {} 1\r\n", self.config.topic).as_bytes())
            .await?;
        tracing::info!(topic = %self.config.topic, address, "subscribed to alert bus");

        loop {
            let line = read_line(&mut reader).await?;
            if line.is_empty() {
                return Ok(());
            }
            self.dispatch_line(&line, &mut reader, &mut write_half).await?;
        }
    }

    async fn dispatch_line(
        &self,
        line: &str,
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), BusError> {
        if line == "PING" {
            writer.write_all(b"PONG\r\n").await?;
            return Ok(());
        }
        if line == "PONG" || line == "+OK" {
            return Ok(());
        }
        if let Some(error) = line.strip_prefix("-ERR") {
            tracing::warn!(error = error.trim(), "bus reported an error");
            return Ok(());
        }
        if let Some(header) = line.strip_prefix("MSG ") {
            // MSG <subject> <sid> [reply-to] <#bytes>
            let fields: Vec<&str> = header.split_whitespace().collect();
            let size: usize = fields
                .last()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| BusError::Protocol(format!("bad MSG header '{line}'")))?;
            let mut payload = vec![0u8; size + 2];
            reader.read_exact(&mut payload).await?;
            payload.truncate(size);

            match serde_json::from_slice::<Value>(&payload) {
                Ok(doc) => {
                    tracing::info!("new incoming alert from bus");
                    if !self.queue.push(doc).await {
                        return Err(BusError::Protocol("alert queue is gone".into()));
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping non-JSON bus payload");
                }
            }
            return Ok(());
        }
        tracing::debug!(line, "ignoring unhandled bus line");
        Ok(())
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> Result<String, BusError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(String::new());
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake broker: greets, expects CONNECT+SUB, delivers canned messages.
    async fn fake_broker(messages: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"INFO {\"server_id\":\"fake\"}\r\n")
                .await
                .unwrap();
            // Consume CONNECT and SUB lines
            let mut buf = [0u8; 1024];
            let mut seen = String::new();
            while !seen.contains("SUB ") {
                let n = socket.read(&mut buf).await.unwrap();
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            for (subject, payload) in messages {
                let frame = format!("MSG {subject} 1 {}\r\n{payload}\r\n", payload.len());
                socket.write_all(frame.as_bytes()).await.unwrap();
            }
            socket.write_all(b"PING\r\n").await.unwrap();
            // Wait for the PONG, then hang up
            let _ = socket.read(&mut buf).await;
            socket.shutdown().await.ok();
        });
        format!("{}", addr)
    }

    #[tokio::test]
    async fn test_messages_reach_the_queue() {
        let addr = fake_broker(vec![
            ("alerts", r#"{"rule": {"id": "100002"}}"#),
            ("alerts", "not json at all"),
            ("alerts", r#"{"rule": {"id": "100003"}}"#),
        ])
        .await;
        let (host, port) = addr.rsplit_once(':').unwrap();

        let (queue, mut rx) = AlertQueue::new(16);
        let subscriber = BusSubscriber::new(
            BusConfig {
                enabled: true,
                host: host.to_string(),
                port: port.parse().unwrap(),
                tls: false,
                topic: "alerts".into(),
                max_reconnects: 0,
            },
            queue,
        );
        let handle = tokio::spawn(subscriber.run());

        // The two JSON payloads arrive in order; the garbage one is dropped
        let first = rx.recv().await.unwrap();
        assert_eq!(first["rule"]["id"], "100002");
        let second = rx.recv().await.unwrap();
        assert_eq!(second["rule"]["id"], "100003");

        // With max_reconnects 0 the hangup is fatal
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BusError::ReconnectsExhausted(0))));
    }

    #[tokio::test]
    async fn test_tls_is_rejected() {
        let (queue, _rx) = AlertQueue::new(1);
        let subscriber = BusSubscriber::new(
            BusConfig {
                tls: true,
                ..BusConfig::default()
            },
            queue,
        );
        assert!(matches!(
            subscriber.run().await,
            Err(BusError::TlsUnsupported)
        ));
    }
}
