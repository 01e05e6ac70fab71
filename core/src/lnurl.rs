//! Lightning アドレス / LNURL-pay と支払い確認

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{CoreError, Result};
use crate::nwc::{InvoiceLookup, NwcClient};

/// JSON を返す HTTP GET
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;
}

/// `name@domain`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightningAddress {
    pub name: String,
    pub domain: String,
}

impl LightningAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || CoreError::ParseError(format!("invalid lightning address: {}", address));

        let (name, domain) = address.trim().split_once('@').ok_or_else(invalid)?;
        let name_ok = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'+'));
        if !name_ok || domain.is_empty() || domain.contains('@') || domain.contains('/') {
            return Err(invalid());
        }
        // ホスト名として解釈できること
        Url::parse(&format!("https://{}/", domain)).map_err(|_| invalid())?;

        Ok(Self {
            name: name.to_ascii_lowercase(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    pub fn well_known_url(&self) -> String {
        format!("https://{}/.well-known/lnurlp/{}", self.domain, self.name)
    }
}

impl std::fmt::Display for LightningAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)
    }
}

/// LNURL-pay のエンドポイント情報
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub callback: String,
    /// msats
    pub min_sendable: u64,
    /// msats
    pub max_sendable: u64,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub comment_allowed: Option<u64>,
}

/// callback が返す請求書
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LnurlInvoice {
    pub pr: String,
    /// LUD-21 の確認用 URL
    #[serde(default)]
    pub verify: Option<String>,
}

/// `{"status":"ERROR","reason":...}` を HttpError にする
fn check_status(body: &Value) -> Result<()> {
    if body.get("status").and_then(Value::as_str) == Some("ERROR") {
        let reason = body.get("reason").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(CoreError::HttpError(format!("LNURL service error: {}", reason)));
    }
    Ok(())
}

/// Lightning アドレスから LNURL-pay 情報を取得
pub async fn resolve(http: &dyn HttpClient, address: &LightningAddress) -> Result<PayRequest> {
    let body = http.get_json(&address.well_known_url()).await?;
    check_status(&body)?;

    if let Some(tag) = body.get("tag").and_then(Value::as_str) {
        if tag != "payRequest" {
            return Err(CoreError::ParseError(format!("unexpected LNURL tag: {}", tag)));
        }
    }
    let pay: PayRequest = serde_json::from_value(body)
        .map_err(|e| CoreError::ParseError(format!("invalid LNURL pay request: {}", e)))?;
    if pay.min_sendable > pay.max_sendable {
        return Err(CoreError::ParseError(format!(
            "minSendable {} exceeds maxSendable {}",
            pay.min_sendable, pay.max_sendable
        )));
    }
    log::debug!("Resolved {} -> {}", address, pay.callback);
    Ok(pay)
}

/// callback に金額を渡して請求書を取得
pub async fn request_invoice(http: &dyn HttpClient, pay: &PayRequest, amount_msat: u64) -> Result<LnurlInvoice> {
    if amount_msat < pay.min_sendable || amount_msat > pay.max_sendable {
        return Err(CoreError::Other(format!(
            "amount {} msat outside {}..={}",
            amount_msat, pay.min_sendable, pay.max_sendable
        )));
    }

    let mut url = Url::parse(&pay.callback)
        .map_err(|e| CoreError::ParseError(format!("invalid callback url: {}", e)))?;
    url.query_pairs_mut().append_pair("amount", &amount_msat.to_string());

    let body = http.get_json(url.as_str()).await?;
    check_status(&body)?;
    serde_json::from_value(body).map_err(|e| CoreError::ParseError(format!("invalid LNURL invoice: {}", e)))
}

/// LUD-21 verify URL で支払い済みか確認
pub async fn check_settled(http: &dyn HttpClient, verify_url: &str) -> Result<bool> {
    let body = http.get_json(verify_url).await?;
    check_status(&body)?;
    Ok(body.get("settled").and_then(Value::as_bool).unwrap_or(false))
}

/// 確認待ちの請求書
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInvoice {
    pub bolt11: String,
    pub payment_hash: Option<String>,
    pub verify_url: Option<String>,
}

/// 支払い確認の手段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationMethod {
    Nwc,
    LnurlVerify(String),
    NotConfigured,
}

impl VerificationMethod {
    pub fn select(nwc_configured: bool, invoice: &PendingInvoice) -> Self {
        if nwc_configured {
            VerificationMethod::Nwc
        } else if let Some(url) = invoice.verify_url.as_ref().filter(|u| !u.is_empty()) {
            VerificationMethod::LnurlVerify(url.clone())
        } else {
            VerificationMethod::NotConfigured
        }
    }
}

/// 請求書の支払い確認
#[derive(Clone, Default)]
pub struct PaymentVerifier {
    nwc: Option<Arc<NwcClient>>,
    http: Option<Arc<dyn HttpClient>>,
}

impl PaymentVerifier {
    pub fn new(nwc: Option<Arc<NwcClient>>, http: Option<Arc<dyn HttpClient>>) -> Self {
        Self { nwc, http }
    }

    pub fn method_for(&self, invoice: &PendingInvoice) -> VerificationMethod {
        let method = VerificationMethod::select(self.nwc.is_some(), invoice);
        match method {
            VerificationMethod::LnurlVerify(_) if self.http.is_none() => VerificationMethod::NotConfigured,
            other => other,
        }
    }

    /// 確認手段が無ければ `NoVerificationMethod`
    pub async fn is_paid(&self, invoice: &PendingInvoice) -> Result<bool> {
        match (self.method_for(invoice), &self.nwc, &self.http) {
            (VerificationMethod::Nwc, Some(nwc), _) => {
                let lookup = match &invoice.payment_hash {
                    Some(hash) => InvoiceLookup::PaymentHash(hash.clone()),
                    None => InvoiceLookup::Invoice(invoice.bolt11.clone()),
                };
                Ok(nwc.lookup_invoice(&lookup).await?.is_settled())
            }
            (VerificationMethod::LnurlVerify(url), _, Some(http)) => check_settled(http.as_ref(), &url).await,
            _ => Err(CoreError::NoVerificationMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// URL ごとに固定の JSON を返す
    #[derive(Default)]
    struct StubHttp {
        responses: HashMap<String, Value>,
        requested: Mutex<Vec<String>>,
    }

    impl StubHttp {
        fn with(mut self, url: &str, body: Value) -> Self {
            self.responses.insert(url.to_string(), body);
            self
        }
    }

    #[async_trait]
    impl HttpClient for StubHttp {
        async fn get_json(&self, url: &str) -> Result<Value> {
            self.requested.lock().unwrap().push(url.to_string());
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| CoreError::HttpError(format!("404 {}", url)))
        }
    }

    fn pay_request_body() -> Value {
        json!({
            "tag": "payRequest",
            "callback": "https://getalby.com/lnurlp/shop/callback",
            "minSendable": 1000,
            "maxSendable": 100000000,
            "metadata": "[[\"text/plain\",\"Sats for shop\"]]"
        })
    }

    #[test]
    fn test_lightning_address_parse() {
        let addr = LightningAddress::parse("Shop@GetAlby.com").unwrap();
        assert_eq!(addr.name, "shop");
        assert_eq!(addr.well_known_url(), "https://getalby.com/.well-known/lnurlp/shop");
        assert_eq!(addr.to_string(), "shop@getalby.com");

        for bad in ["shop", "@getalby.com", "shop@", "a@b@c", "sh op@x.com", "shop@x.com/evil"] {
            assert!(LightningAddress::parse(bad).is_err(), "accepted {}", bad);
        }
    }

    #[tokio::test]
    async fn test_resolve_and_request_invoice() {
        let http = StubHttp::default()
            .with("https://getalby.com/.well-known/lnurlp/shop", pay_request_body())
            .with(
                "https://getalby.com/lnurlp/shop/callback?amount=21000",
                json!({ "pr": "lnbc210n1...", "routes": [], "verify": "https://getalby.com/lnurlp/shop/verify/abc" }),
            );
        let addr = LightningAddress::parse("shop@getalby.com").unwrap();

        let pay = resolve(&http, &addr).await.unwrap();
        assert_eq!(pay.min_sendable, 1000);
        assert_eq!(pay.max_sendable, 100_000_000);

        let invoice = request_invoice(&http, &pay, 21000).await.unwrap();
        assert_eq!(invoice.pr, "lnbc210n1...");
        assert_eq!(invoice.verify.as_deref(), Some("https://getalby.com/lnurlp/shop/verify/abc"));

        assert!(request_invoice(&http, &pay, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_service_error_status() {
        let http = StubHttp::default().with(
            "https://x.com/.well-known/lnurlp/nobody",
            json!({ "status": "ERROR", "reason": "user not found" }),
        );
        let addr = LightningAddress::parse("nobody@x.com").unwrap();
        match resolve(&http, &addr).await {
            Err(CoreError::HttpError(msg)) => assert!(msg.contains("user not found")),
            other => panic!("expected HttpError, got {:?}", other),
        }
    }

    #[test]
    fn test_select_verification_method() {
        let with_verify = PendingInvoice {
            bolt11: "lnbc1".to_string(),
            payment_hash: None,
            verify_url: Some("https://v".to_string()),
        };
        let bare = PendingInvoice { bolt11: "lnbc1".to_string(), ..Default::default() };

        assert_eq!(VerificationMethod::select(true, &bare), VerificationMethod::Nwc);
        assert_eq!(
            VerificationMethod::select(false, &with_verify),
            VerificationMethod::LnurlVerify("https://v".to_string())
        );
        assert_eq!(VerificationMethod::select(false, &bare), VerificationMethod::NotConfigured);
    }

    #[tokio::test]
    async fn test_is_paid_via_verify_url() {
        let http = StubHttp::default().with("https://v/1", json!({ "status": "OK", "settled": true, "preimage": "00" }));
        let verifier = PaymentVerifier::new(None, Some(Arc::new(http)));
        let invoice = PendingInvoice {
            bolt11: "lnbc1".to_string(),
            payment_hash: None,
            verify_url: Some("https://v/1".to_string()),
        };
        assert!(verifier.is_paid(&invoice).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_paid_without_method() {
        let invoice = PendingInvoice {
            bolt11: "lnbc1".to_string(),
            payment_hash: None,
            verify_url: Some("https://v/1".to_string()),
        };
        // HTTP クライアントが無ければ verify URL も使えない
        let verifier = PaymentVerifier::new(None, None);
        assert!(matches!(verifier.is_paid(&invoice).await, Err(CoreError::NoVerificationMethod)));

        let http: Arc<dyn HttpClient> = Arc::new(StubHttp::default());
        let verifier = PaymentVerifier::new(None, Some(http));
        let bare = PendingInvoice { bolt11: "lnbc1".to_string(), ..Default::default() };
        assert!(matches!(verifier.is_paid(&bare).await, Err(CoreError::NoVerificationMethod)));
    }
}
