//! Nostr Wallet Connect (NIP-47) クライアント

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::form_urlencoded;

use crate::crypto;
use crate::error::{CoreError, Result};
use crate::event::{self, current_timestamp, NostrEvent, KIND_NWC_RESPONSE};
use crate::keys::{Keys, PublicKey, SecretKey};
use crate::relay::ws::validate_relay_url;
use crate::relay::{ClientMessage, Filter, RelayMessage, RelayTransport, TransportFactory};
use crate::types::generate_id;

pub const URI_SCHEME: &str = "nostr+walletconnect";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// 購読の since を現在時刻からどれだけ戻すか（時計のずれ対策）
const SINCE_SKEW_SECS: u64 = 5;

/// NWC 接続情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NwcConnection {
    pub wallet_pubkey: PublicKey,
    pub relay_url: String,
    pub client_secret: SecretKey,
    pub lud16: Option<String>,
}

fn is_hex64(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

impl NwcConnection {
    /// `nostr+walletconnect://<pubkey>?relay=<url>&secret=<hex>[&lud16=<addr>]` をパース
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |msg: &str| CoreError::InvalidConnectionUri(msg.to_string());

        let rest = uri
            .trim()
            .strip_prefix(URI_SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("scheme must be nostr+walletconnect"))?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (pubkey, query) = rest
            .split_once('?')
            .ok_or_else(|| invalid("missing query parameters"))?;

        let pubkey = pubkey.trim_end_matches('/');
        if !is_hex64(pubkey) {
            return Err(invalid("wallet pubkey must be 64 hex chars"));
        }
        let wallet_pubkey = PublicKey::from_hex(&pubkey.to_ascii_lowercase())
            .map_err(|e| CoreError::InvalidConnectionUri(e.to_string()))?;

        let mut relay = None;
        let mut secret = None;
        let mut lud16 = None;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                // 複数指定されていれば先頭を使う
                "relay" if relay.is_none() => relay = Some(value.into_owned()),
                "secret" => secret = Some(value.into_owned()),
                "lud16" if !value.is_empty() => lud16 = Some(value.into_owned()),
                _ => {}
            }
        }

        let relay_url = relay.ok_or_else(|| invalid("missing relay parameter"))?;
        validate_relay_url(&relay_url).map_err(|e| CoreError::InvalidConnectionUri(e.to_string()))?;

        let secret = secret.ok_or_else(|| invalid("missing secret parameter"))?;
        if !is_hex64(&secret) {
            return Err(invalid("secret must be 64 hex chars"));
        }
        let client_secret = SecretKey::from_hex(&secret.to_ascii_lowercase())
            .map_err(|e| CoreError::InvalidConnectionUri(e.to_string()))?;

        Ok(Self {
            wallet_pubkey,
            relay_url,
            client_secret,
            lud16,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("relay", &self.relay_url);
        query.append_pair("secret", &self.client_secret.to_hex());
        if let Some(lud16) = &self.lud16 {
            query.append_pair("lud16", lud16);
        }
        format!("{}://{}?{}", URI_SCHEME, self.wallet_pubkey.to_hex(), query.finish())
    }
}

/// 1リクエストの進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    RequestBuilt,
    Subscribed,
    Published,
    AwaitingResponse,
    Completed,
    TimedOut,
    Errored,
}

fn transition(state: &mut RequestState, next: RequestState) {
    log::debug!("NWC request {:?} -> {:?}", state, next);
    *state = next;
}

/// ウォレットの情報 (get_info)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WalletInfo {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub block_height: u64,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// 請求書/支払い (make_invoice / lookup_invoice)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(rename = "type", default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payment_hash: Option<String>,
    #[serde(default)]
    pub preimage: Option<String>,
    /// msats
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub fees_paid: Option<u64>,
    #[serde(default)]
    pub created_at: Option<u64>,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub settled_at: Option<u64>,
}

impl Transaction {
    pub fn is_settled(&self) -> bool {
        self.settled_at.is_some() || self.state.as_deref() == Some("settled")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PayInvoiceResponse {
    pub preimage: String,
    #[serde(default)]
    pub fees_paid: Option<u64>,
}

/// lookup_invoice の検索キー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceLookup {
    PaymentHash(String),
    Invoice(String),
}

#[derive(Deserialize)]
struct ResponseBody {
    #[serde(default)]
    result_type: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    result: Option<Value>,
}

/// `{code, message}` のほか、文字列だけを返すウォレットもある
#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
    Message(String),
}

/// NWC クライアント
///
/// 同じ接続へのリクエストは1つずつ実行される。
pub struct NwcClient {
    connection: NwcConnection,
    keys: Keys,
    factory: Arc<dyn TransportFactory>,
    timeout: Duration,
    state: Mutex<RequestState>,
}

impl NwcClient {
    pub fn new(connection: NwcConnection, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        let keys = Keys::new(connection.client_secret.clone())?;
        Ok(Self {
            connection,
            keys,
            factory,
            timeout: DEFAULT_TIMEOUT,
            state: Mutex::new(RequestState::Idle),
        })
    }

    /// 応答待ちの上限（購読開始から計測）
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connection(&self) -> &NwcConnection {
        &self.connection
    }

    pub fn client_public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// 直近のリクエストの状態（実行中なら終わるまで待つ）
    pub async fn last_state(&self) -> RequestState {
        *self.state.lock().await
    }

    /// リクエストを送り、`result` を返す
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut state = self.state.lock().await;
        *state = RequestState::Idle;

        let result = match self.exchange(&mut state, method, params).await {
            Ok(response) => self.parse_response(method, &response),
            Err(e) => Err(e),
        };

        match &result {
            Ok(_) => transition(&mut state, RequestState::Completed),
            Err(CoreError::Timeout(after)) => {
                log::warn!("NWC {} timed out after {:?}", method, after);
                transition(&mut state, RequestState::TimedOut);
            }
            Err(e) => {
                log::warn!("NWC {} failed: {}", method, e);
                transition(&mut state, RequestState::Errored);
            }
        }
        result
    }

    /// 購読 → 送信 → 応答待ち。購読は結果に関わらず閉じる
    async fn exchange(&self, state: &mut RequestState, method: &str, params: Value) -> Result<NostrEvent> {
        let wallet = self.connection.wallet_pubkey;
        let payload = json!({ "method": method, "params": params }).to_string();
        let request = event::nwc_request(&self.keys, &wallet, &payload)?;
        transition(state, RequestState::RequestBuilt);

        let mut transport = self.factory.open(&self.connection.relay_url).await?;
        let sub_id = generate_id("nwc")?;
        let filter = Filter {
            kinds: Some(vec![KIND_NWC_RESPONSE]),
            authors: Some(vec![wallet]),
            p_tags: Some(vec![self.keys.public_key()]),
            since: Some(current_timestamp().saturating_sub(SINCE_SKEW_SECS)),
            limit: None,
        };

        let deadline = Instant::now() + self.timeout;
        let outcome: Result<NostrEvent> = async {
            transport
                .send(&ClientMessage::Req { sub_id: sub_id.clone(), filter: filter.clone() })
                .await?;
            transition(state, RequestState::Subscribed);

            transport.send(&ClientMessage::Event(Box::new(request.clone()))).await?;
            transition(state, RequestState::Published);
            transition(state, RequestState::AwaitingResponse);

            tokio::time::timeout_at(deadline, self.await_response(&mut *transport, &sub_id, &filter, &request))
                .await
                .map_err(|_| CoreError::Timeout(self.timeout))?
        }
        .await;

        if let Err(e) = transport.send(&ClientMessage::Close { sub_id: sub_id.clone() }).await {
            log::debug!("Failed to close NWC subscription {}: {}", sub_id, e);
        }
        if let Err(e) = transport.close().await {
            log::debug!("Failed to close NWC relay connection: {}", e);
        }
        outcome
    }

    /// 自分の購読宛ての応答イベントが来るまで読む
    async fn await_response(
        &self,
        transport: &mut dyn RelayTransport,
        sub_id: &str,
        filter: &Filter,
        request: &NostrEvent,
    ) -> Result<NostrEvent> {
        let request_id = request.id.to_hex();
        let mut authenticated = false;

        loop {
            let message = transport.recv().await?.ok_or_else(|| {
                CoreError::RelayTransportError("relay closed the connection before the wallet responded".to_string())
            })?;

            match message {
                RelayMessage::Event { sub_id: got, event } if got == sub_id => {
                    if !filter.matches(&event) {
                        log::debug!("Ignoring non-matching event {} on {}", event.id, sub_id);
                        continue;
                    }
                    if let Some(target) = event.tag_value("e") {
                        if target != request_id {
                            log::debug!("Ignoring response to another request ({})", target);
                            continue;
                        }
                    }
                    if let Err(e) = event.verify() {
                        log::warn!("Ignoring wallet response with bad signature: {}", e);
                        continue;
                    }
                    return Ok(*event);
                }
                RelayMessage::Event { sub_id: other, .. } => {
                    log::debug!("Ignoring event for subscription {}", other);
                }
                RelayMessage::Ok { event_id, accepted, message } if event_id == request_id => {
                    if accepted {
                        log::debug!("NWC request {} accepted by relay", event_id);
                    } else if message.starts_with("auth-required") && authenticated {
                        log::info!("Republishing NWC request after AUTH");
                        transport.send(&ClientMessage::Event(Box::new(request.clone()))).await?;
                    } else {
                        log::warn!("NWC request {} rejected by relay: {}", event_id, message);
                    }
                }
                RelayMessage::Ok { .. } | RelayMessage::Eose { .. } => {}
                RelayMessage::Notice { message } => log::info!("Relay notice: {}", message),
                RelayMessage::Closed { sub_id: got, message } if got == sub_id => {
                    if message.starts_with("auth-required") && authenticated {
                        log::info!("Resubscribing {} after AUTH", sub_id);
                        transport
                            .send(&ClientMessage::Req { sub_id: sub_id.to_string(), filter: filter.clone() })
                            .await?;
                    } else {
                        return Err(CoreError::RelayTransportError(format!(
                            "subscription closed by relay: {}",
                            message
                        )));
                    }
                }
                RelayMessage::Closed { .. } => {}
                RelayMessage::Auth { challenge } => {
                    let auth = event::client_auth(&self.keys, transport.url(), &challenge)?;
                    transport.send(&ClientMessage::Auth(Box::new(auth))).await?;
                    authenticated = true;
                }
            }
        }
    }

    fn parse_response(&self, method: &str, response: &NostrEvent) -> Result<Value> {
        let plaintext = crypto::nip04_decrypt(&response.content, &self.connection.wallet_pubkey, self.keys.secret_key())?;
        let body: ResponseBody = serde_json::from_str(&plaintext)
            .map_err(|e| CoreError::ParseError(format!("invalid wallet response: {}", e)))?;

        match body.error {
            Some(ErrorBody::Detailed { code, message }) => return Err(CoreError::NwcError { code, message }),
            Some(ErrorBody::Message(message)) => {
                return Err(CoreError::NwcError {
                    code: String::new(),
                    message,
                })
            }
            None => {}
        }
        if let Some(result_type) = &body.result_type {
            if result_type != method {
                return Err(CoreError::ParseError(format!(
                    "expected result_type {}, got {}",
                    method, result_type
                )));
            }
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn typed<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.request(method, params).await?;
        serde_json::from_value(result).map_err(|e| CoreError::ParseError(format!("{} result: {}", method, e)))
    }

    pub async fn get_info(&self) -> Result<WalletInfo> {
        self.typed("get_info", json!({})).await
    }

    /// 残高 (msats)
    pub async fn get_balance(&self) -> Result<u64> {
        let result = self.request("get_balance", json!({})).await?;
        result
            .get("balance")
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::ParseError("get_balance result has no balance".to_string()))
    }

    pub async fn make_invoice(&self, amount_msat: u64, description: &str, expiry: Option<u64>) -> Result<Transaction> {
        let mut params = json!({ "amount": amount_msat, "description": description });
        if let Some(expiry) = expiry {
            params["expiry"] = json!(expiry);
        }
        self.typed("make_invoice", params).await
    }

    pub async fn lookup_invoice(&self, lookup: &InvoiceLookup) -> Result<Transaction> {
        let params = match lookup {
            InvoiceLookup::PaymentHash(hash) => json!({ "payment_hash": hash }),
            InvoiceLookup::Invoice(invoice) => json!({ "invoice": invoice }),
        };
        self.typed("lookup_invoice", params).await
    }

    pub async fn pay_invoice(&self, invoice: &str) -> Result<PayInvoiceResponse> {
        self.typed("pay_invoice", json!({ "invoice": invoice })).await
    }
}
