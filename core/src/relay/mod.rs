pub mod mock;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{CoreError, Result};
use crate::event::NostrEvent;
use crate::keys::{EventId, PublicKey};

/// 購読フィルター
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    #[serde(rename = "#p", skip_serializing_if = "Option::is_none")]
    pub p_tags: Option<Vec<PublicKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// イベントがフィルター条件を満たすか
    pub fn matches(&self, event: &NostrEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(p_tags) = &self.p_tags {
            let tagged = event.tags.iter().any(|t| {
                t.first().map(String::as_str) == Some("p")
                    && t.get(1).map_or(false, |v| p_tags.iter().any(|p| p.to_hex() == *v))
            });
            if !tagged {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }
}

/// クライアント → Relay
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Event(Box<NostrEvent>),
    Req { sub_id: String, filter: Filter },
    Close { sub_id: String },
    Auth(Box<NostrEvent>),
}

impl ClientMessage {
    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            ClientMessage::Event(event) => json!(["EVENT", event.to_value()?]),
            ClientMessage::Req { sub_id, filter } => json!(["REQ", sub_id, filter]),
            ClientMessage::Close { sub_id } => json!(["CLOSE", sub_id]),
            ClientMessage::Auth(event) => json!(["AUTH", event.to_value()?]),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(self.to_value()?.to_string())
    }
}

/// Relay → クライアント
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Box<NostrEvent> },
    Ok { event_id: String, accepted: bool, message: String },
    Notice { message: String },
    Eose { sub_id: String },
    Closed { sub_id: String, message: String },
    Auth { challenge: String },
}

fn field_str<'a>(arr: &'a [Value], idx: usize, what: &str) -> Result<&'a str> {
    arr.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::ParseError(format!("{} not a string", what)))
}

impl RelayMessage {
    /// JSONからパース
    pub fn parse(json: &str) -> Result<Self> {
        let arr: Vec<Value> = serde_json::from_str(json)?;

        if arr.is_empty() {
            return Err(CoreError::ParseError("Empty message array".to_string()));
        }

        let msg_type = field_str(&arr, 0, "Message type")?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(CoreError::ParseError("Invalid EVENT message".to_string()));
                }
                let sub_id = field_str(&arr, 1, "sub_id")?.to_string();
                let event = NostrEvent::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event { sub_id, event: Box::new(event) })
            }
            "OK" => {
                if arr.len() < 3 {
                    return Err(CoreError::ParseError("Invalid OK message".to_string()));
                }
                let event_id = field_str(&arr, 1, "event_id")?.to_string();
                let accepted = arr[2]
                    .as_bool()
                    .ok_or_else(|| CoreError::ParseError("accepted not a bool".to_string()))?;
                let message = arr.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Ok { event_id, accepted, message })
            }
            "NOTICE" => {
                let message = field_str(&arr, 1, "message")?.to_string();
                Ok(RelayMessage::Notice { message })
            }
            "EOSE" => {
                let sub_id = field_str(&arr, 1, "sub_id")?.to_string();
                Ok(RelayMessage::Eose { sub_id })
            }
            "CLOSED" => {
                let sub_id = field_str(&arr, 1, "sub_id")?.to_string();
                let message = arr.get(2).and_then(Value::as_str).unwrap_or("").to_string();
                Ok(RelayMessage::Closed { sub_id, message })
            }
            "AUTH" => {
                let challenge = field_str(&arr, 1, "challenge")?.to_string();
                Ok(RelayMessage::Auth { challenge })
            }
            _ => Err(CoreError::ParseError(format!("Unknown message type: {}", msg_type))),
        }
    }
}

/// Relay との双方向チャネル
#[async_trait]
pub trait RelayTransport: Send {
    fn url(&self) -> &str;

    async fn send(&mut self, msg: &ClientMessage) -> Result<()>;

    /// 次の受信フレーム。接続が閉じていれば None
    async fn recv(&mut self) -> Result<Option<RelayMessage>>;

    async fn close(&mut self) -> Result<()>;
}

/// URL から接続済みトランスポートを開く
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn RelayTransport>>;
}

/// 1回の publish の結果
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// フレームを受け付けた Relay
    pub sent_to: Vec<String>,
    /// OK:false を返した Relay と理由（sent_to にも含まれる）
    pub rejected: Vec<(String, String)>,
    /// 接続/送信に失敗した Relay
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    /// 1つ以上の Relay が通信エラーなしで受け取ったか
    pub fn is_success(&self) -> bool {
        !self.sent_to.is_empty()
    }
}

/// 設定された Relay 群への publish
pub struct RelayPool {
    factory: Arc<dyn TransportFactory>,
    relays: Vec<String>,
    ack_wait: Duration,
}

impl RelayPool {
    pub fn new(factory: Arc<dyn TransportFactory>, relays: Vec<String>) -> Self {
        Self {
            factory,
            relays,
            ack_wait: Duration::from_secs(3),
        }
    }

    /// OK を待つ上限（ログ用、成否判定には使わない）
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        self.factory.clone()
    }

    /// 全Relayに順番に送信
    pub async fn publish(&self, event: &NostrEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let frame = ClientMessage::Event(Box::new(event.clone()));

        for url in &self.relays {
            let mut transport = match self.factory.open(url).await {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Failed to connect to {}: {}", url, e);
                    report.failed.push((url.clone(), e.to_string()));
                    continue;
                }
            };

            if let Err(e) = transport.send(&frame).await {
                log::warn!("Failed to send to {}: {}", url, e);
                report.failed.push((url.clone(), e.to_string()));
                let _ = transport.close().await;
                continue;
            }
            report.sent_to.push(url.clone());

            match wait_for_ok(&mut *transport, &event.id, self.ack_wait).await {
                Some((true, _)) => log::info!("Event {} accepted by {}", event.id, url),
                Some((false, message)) => {
                    // OK:false でも送信自体は成功扱い
                    log::warn!("Event {} rejected by {}: {}", event.id, url, message);
                    report.rejected.push((url.clone(), message));
                }
                None => log::debug!("No OK from {} for {}", url, event.id),
            }

            if let Err(e) = transport.close().await {
                log::debug!("Close failed for {}: {}", url, e);
            }
        }

        report
    }
}

async fn wait_for_ok(
    transport: &mut dyn RelayTransport,
    event_id: &EventId,
    wait: Duration,
) -> Option<(bool, String)> {
    let expected = event_id.to_hex();
    let read = async {
        loop {
            match transport.recv().await {
                Ok(Some(RelayMessage::Ok { event_id, accepted, message })) if event_id == expected => {
                    return Some((accepted, message));
                }
                Ok(Some(RelayMessage::Notice { message })) => {
                    log::info!("Relay notice: {}", message);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    };
    tokio::time::timeout(wait, read).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::client_auth;
    use crate::keys::Keys;

    fn sample_event() -> NostrEvent {
        let keys = Keys::parse(&"05".repeat(32)).unwrap();
        client_auth(&keys, "wss://r", "c").unwrap()
    }

    #[test]
    fn test_relay_message_parse() {
        let ev = sample_event();
        let json = json!(["EVENT", "sub1", ev]).to_string();
        match RelayMessage::parse(&json).unwrap() {
            RelayMessage::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub1");
                assert_eq!(*event, ev);
            }
            other => panic!("Expected EVENT message, got {:?}", other),
        }

        let msg = RelayMessage::parse(r#"["OK","event123",false,"blocked: spam"]"#).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Ok {
                event_id: "event123".to_string(),
                accepted: false,
                message: "blocked: spam".to_string()
            }
        );

        let msg = RelayMessage::parse(r#"["NOTICE","slow down"]"#).unwrap();
        assert_eq!(msg, RelayMessage::Notice { message: "slow down".to_string() });

        let msg = RelayMessage::parse(r#"["AUTH","challenge-1"]"#).unwrap();
        assert_eq!(msg, RelayMessage::Auth { challenge: "challenge-1".to_string() });

        let msg = RelayMessage::parse(r#"["CLOSED","s","auth-required: x"]"#).unwrap();
        assert!(matches!(msg, RelayMessage::Closed { .. }));
    }

    #[test]
    fn test_relay_message_parse_errors() {
        assert!(RelayMessage::parse("[]").is_err());
        assert!(RelayMessage::parse(r#"["EVENT","s"]"#).is_err());
        assert!(RelayMessage::parse(r#"["EVENT","s",{"id":"nope"}]"#).is_err());
        assert!(RelayMessage::parse(r#"["WHAT"]"#).is_err());
        assert!(RelayMessage::parse("not json").is_err());
    }

    #[test]
    fn test_client_message_serialization() {
        let pk = PublicKey::from_hex(&"ab".repeat(32)).unwrap();
        let req = ClientMessage::Req {
            sub_id: "nwc1".to_string(),
            filter: Filter {
                kinds: Some(vec![23195]),
                authors: Some(vec![pk]),
                p_tags: Some(vec![pk]),
                since: Some(100),
                limit: None,
            },
        };
        let v = req.to_value().unwrap();
        assert_eq!(v[0], "REQ");
        assert_eq!(v[1], "nwc1");
        assert_eq!(v[2]["kinds"][0], 23195);
        assert_eq!(v[2]["#p"][0], "ab".repeat(32));
        assert_eq!(v[2]["since"], 100);
        assert!(v[2].get("limit").is_none());

        let close = ClientMessage::Close { sub_id: "nwc1".to_string() };
        assert_eq!(close.to_json().unwrap(), r#"["CLOSE","nwc1"]"#);

        let ev = sample_event();
        let v = ClientMessage::Event(Box::new(ev.clone())).to_value().unwrap();
        assert_eq!(v[0], "EVENT");
        assert_eq!(v[1]["id"], ev.id.to_hex());
    }

    #[tokio::test]
    async fn test_publish_partial_failure_is_success() {
        let factory = mock::MockRelayFactory::new();
        factory.set_unreachable("wss://down", true);
        let pool = RelayPool::new(
            Arc::new(factory.clone()),
            vec!["wss://down".to_string(), "wss://up".to_string()],
        );

        let report = pool.publish(&sample_event()).await;
        assert!(report.is_success());
        assert_eq!(report.sent_to, vec!["wss://up".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(factory.sent_events().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_all_unreachable_fails() {
        let factory = mock::MockRelayFactory::new();
        factory.set_unreachable("wss://a", true);
        factory.set_unreachable("wss://b", true);
        let pool = RelayPool::new(Arc::new(factory), vec!["wss://a".to_string(), "wss://b".to_string()]);

        let report = pool.publish(&sample_event()).await;
        assert!(!report.is_success());
        assert_eq!(report.failed.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_rejected_still_counts_as_sent() {
        let factory = mock::MockRelayFactory::with_responder(|_, msg| match msg {
            ClientMessage::Event(event) => vec![RelayMessage::Ok {
                event_id: event.id.to_hex(),
                accepted: false,
                message: "blocked".to_string(),
            }],
            _ => Vec::new(),
        });
        let pool = RelayPool::new(Arc::new(factory), vec!["wss://strict".to_string()]);

        let report = pool.publish(&sample_event()).await;
        assert!(report.is_success());
        assert_eq!(report.rejected, vec![("wss://strict".to_string(), "blocked".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_silent_relay_waits_only_for_ack_window() {
        let factory = mock::MockRelayFactory::silent();
        let pool = RelayPool::new(Arc::new(factory), vec!["wss://quiet".to_string()])
            .with_ack_wait(Duration::from_secs(2));

        let started = tokio::time::Instant::now();
        let report = pool.publish(&sample_event()).await;
        assert!(report.is_success());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_filter_matches() {
        let ev = sample_event();
        let mut filter = Filter { kinds: Some(vec![ev.kind]), ..Default::default() };
        assert!(filter.matches(&ev));
        filter.since = Some(ev.created_at + 10);
        assert!(!filter.matches(&ev));
        let other = PublicKey::from_hex(&"cd".repeat(32)).unwrap();
        let filter = Filter { p_tags: Some(vec![other]), ..Default::default() };
        assert!(!filter.matches(&ev));
    }
}
