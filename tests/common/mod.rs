//! In-process Socket.IO coordinator shared by the integration tests.
//!
//! Speaks just enough Engine.IO v4 to drive the client: it sends the open
//! packet, answers the namespace connect, then plays a script of frames once
//! the join event arrives. Every text frame the client sends is recorded.

#![allow(dead_code, reason = "each test binary uses a subset")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

const OPEN: &str = r#"0{"sid":"fake","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;

/// How the coordinator answers the namespace connect.
#[derive(Clone, Copy)]
pub enum Ack {
    Accept,
    Refuse,
    Silent,
}

/// What the coordinator does after the join event.
#[derive(Clone)]
pub struct Script {
    pub ack: Ack,
    pub delay: Duration,
    pub frames: Vec<String>,
    pub hang_up: bool,
}

impl Script {
    pub fn grant(frames: &[&str]) -> Self {
        Self {
            ack: Ack::Accept,
            delay: Duration::ZERO,
            frames: frames.iter().map(ToString::to_string).collect(),
            hang_up: false,
        }
    }

    pub fn idle() -> Self {
        Self::grant(&[])
    }
}

pub struct FakeFarm {
    pub endpoint: String,
    received: Arc<Mutex<Vec<String>>>,
}

impl FakeFarm {
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&received);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(OPEN.into())).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else {
                    continue;
                };
                log.lock().unwrap().push(text.clone());

                if text == "40" {
                    match script.ack {
                        Ack::Accept => {
                            ws.send(Message::Text(r#"40{"sid":"ns"}"#.into())).await.unwrap();
                        }
                        Ack::Refuse => {
                            let _ = ws
                                .send(Message::Text(r#"44{"message":"tag unknown"}"#.into()))
                                .await;
                        }
                        Ack::Silent => {}
                    }
                } else if text.starts_with(r#"42["jen_device""#) {
                    tokio::time::sleep(script.delay).await;
                    for frame in &script.frames {
                        ws.send(Message::Text(frame.clone())).await.unwrap();
                    }
                    if script.hang_up {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            }
        });

        Self { endpoint, received }
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub async fn wait_for_frame(&self, frame: &str) -> bool {
        for _ in 0..100 {
            if self.received().iter().any(|f| f == frame) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}
