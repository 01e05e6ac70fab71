use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use super::{ClientMessage, RelayMessage, RelayTransport, TransportFactory};
use crate::error::{CoreError, Result};
use crate::event::NostrEvent;

/// 送信フレームごとに返す応答を決める関数
pub type Responder = Arc<dyn Fn(&str, &ClientMessage) -> Vec<RelayMessage> + Send + Sync>;

#[derive(Default)]
struct MockState {
    sent: Vec<(String, ClientMessage)>,
    opened: Vec<String>,
    unreachable: HashSet<String>,
}

/// テスト用のモックRelay
///
/// 応答が尽きると recv は永久に待機する（応答しない Relay の再現）。
#[derive(Clone)]
pub struct MockRelayFactory {
    state: Arc<Mutex<MockState>>,
    responder: Responder,
}

impl MockRelayFactory {
    /// EVENT に OK:true を返す Relay
    pub fn new() -> Self {
        Self::with_responder(|_, msg| match msg {
            ClientMessage::Event(event) => vec![RelayMessage::Ok {
                event_id: event.id.to_hex(),
                accepted: true,
                message: String::new(),
            }],
            _ => Vec::new(),
        })
    }

    /// 何も返さない Relay
    pub fn silent() -> Self {
        Self::with_responder(|_, _| Vec::new())
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &ClientMessage) -> Vec<RelayMessage> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            responder: Arc::new(responder),
        }
    }

    /// この URL への接続を失敗させる
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(url.to_string());
        } else {
            state.unreachable.remove(url);
        }
    }

    /// このモックがフレームに返す応答（別のモックに組み込む用）
    pub fn respond(&self, url: &str, msg: &ClientMessage) -> Vec<RelayMessage> {
        (self.responder)(url, msg)
    }

    /// 送信されたフレーム (url, message)
    pub fn sent(&self) -> Vec<(String, ClientMessage)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// 送信された EVENT のみ
    pub fn sent_events(&self) -> Vec<NostrEvent> {
        self.sent()
            .into_iter()
            .filter_map(|(_, msg)| match msg {
                ClientMessage::Event(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    /// 開かれた接続の URL
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }
}

impl Default for MockRelayFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MockRelayFactory {
    async fn open(&self, url: &str) -> Result<Box<dyn RelayTransport>> {
        let mut state = self.state.lock().unwrap();
        if state.unreachable.contains(url) {
            return Err(CoreError::RelayTransportError(format!("connection refused: {}", url)));
        }
        state.opened.push(url.to_string());
        Ok(Box::new(MockTransport {
            url: url.to_string(),
            state: self.state.clone(),
            responder: self.responder.clone(),
            inbox: VecDeque::new(),
            closed: false,
        }))
    }
}

struct MockTransport {
    url: String,
    state: Arc<Mutex<MockState>>,
    responder: Responder,
    inbox: VecDeque<RelayMessage>,
    closed: bool,
}

#[async_trait]
impl RelayTransport for MockTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        if self.closed {
            return Err(CoreError::RelayTransportError(format!("{} is closed", self.url)));
        }
        self.state.lock().unwrap().sent.push((self.url.clone(), msg.clone()));
        self.inbox.extend((self.responder)(&self.url, msg));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>> {
        if let Some(msg) = self.inbox.pop_front() {
            return Ok(Some(msg));
        }
        if self.closed {
            return Ok(None);
        }
        std::future::pending::<()>().await;
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
