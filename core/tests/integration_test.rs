// 統合テスト
// Engine をメモリストアとモックRelayで動かし、nostr クレートとの相互運用も確認する

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostrpress_core::crypto;
use nostrpress_core::event::{UnsignedEvent, KIND_NWC_REQUEST, KIND_NWC_RESPONSE};
use nostrpress_core::lnurl::{PendingInvoice, VerificationMethod};
use nostrpress_core::nwc::{InvoiceLookup, NwcConnection};
use nostrpress_core::relay::mock::MockRelayFactory;
use nostrpress_core::relay::{ClientMessage, RelayMessage};
use nostrpress_core::storage::file::FileStore;
use nostrpress_core::storage::memory::MemoryStore;
use nostrpress_core::storage::KeyValueStore;
use nostrpress_core::{CoreError, Engine, EngineConfig, Keys, PublicKey};
use serde_json::{json, Value};

const SITE_SECRET: &str = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";

fn config() -> EngineConfig {
    EngineConfig {
        relays: vec!["wss://relay.one".to_string(), "wss://relay.two".to_string()],
        site_secret_key: Some(SITE_SECRET.to_string()),
        ..Default::default()
    }
}

fn engine_with(config: EngineConfig, factory: &MockRelayFactory) -> Engine {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    Engine::new(config, store, Arc::new(factory.clone()), None).unwrap()
}

#[tokio::test]
async fn test_order_notification_is_delivered() {
    let factory = MockRelayFactory::new();
    let engine = engine_with(config(), &factory);

    let recipient = "ab".repeat(32);
    engine.queue_dm(&recipient, "Order #9", "hello", "").await.unwrap();

    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.sent, 1);
    assert!(engine.queue().is_empty().await.unwrap());

    let log = engine.sent_log().await.unwrap();
    assert_eq!(log[0].subject, "Order #9");
    assert_eq!(log[0].recipient_pubkey.to_hex(), recipient);

    // 両方の Relay に同じイベントが送られる
    let events = factory.sent_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, events[1].id);
    assert_eq!(events[0].id, log[0].event_id);
}

#[tokio::test]
async fn test_one_relay_down_still_delivers() {
    let factory = MockRelayFactory::new();
    factory.set_unreachable("wss://relay.one", true);
    let engine = engine_with(config(), &factory);

    engine
        .queue_dm("npub10elfcs4fr0l0r8af98jlmgdh9c8tcxjvz9qkw038js35mp4dma8qzvjptg", "s", "m", "")
        .await
        .unwrap();
    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(factory.opened(), vec!["wss://relay.two".to_string()]);
}

#[tokio::test]
async fn test_queue_dm_rejects_bad_recipient() {
    let factory = MockRelayFactory::new();
    let engine = engine_with(config(), &factory);
    assert!(matches!(
        engine.queue_dm("not-a-key", "s", "m", "").await,
        Err(CoreError::InvalidKeyFormat(_))
    ));
    assert!(engine.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_engine_requires_site_key() {
    let factory = MockRelayFactory::new();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let result = Engine::new(EngineConfig::default(), store, Arc::new(factory), None);
    assert!(matches!(result, Err(CoreError::InvalidKeyFormat(_))));
}

#[tokio::test]
async fn test_queue_survives_restart_with_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let factory = MockRelayFactory::new();
    factory.set_unreachable("wss://relay.one", true);
    factory.set_unreachable("wss://relay.two", true);

    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&path));
        let engine = Engine::new(config(), store, Arc::new(factory.clone()), None).unwrap();
        engine.queue_dm(&"ab".repeat(32), "Order #1", "hi", "Alice").await.unwrap();
        let report = engine.process_queue().await.unwrap();
        assert_eq!(report.failed, 1);
    }

    factory.set_unreachable("wss://relay.one", false);
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&path));
    let engine = Engine::new(config(), store, Arc::new(factory.clone()), None).unwrap();
    assert_eq!(engine.queue().len().await.unwrap(), 1);

    let report = engine.process_queue().await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(engine.sent_log().await.unwrap()[0].display_name, "Alice");
}

#[tokio::test]
async fn test_dm_interoperates_with_nostr_crate() {
    let factory = MockRelayFactory::new();
    let engine = engine_with(config(), &factory);
    let recipient = nostr::Keys::parse(&"22".repeat(32)).unwrap();

    engine
        .queue_dm(&recipient.public_key().to_hex(), "s", "héllo / 世界 \"quoted\"", "")
        .await
        .unwrap();
    engine.process_queue().await.unwrap();

    let ours = factory.sent_events().remove(0);
    let theirs: nostr::Event = serde_json::from_str(&ours.to_json().unwrap()).unwrap();
    theirs.verify().unwrap();
    assert_eq!(theirs.id.to_hex(), ours.id.to_hex());

    let site = nostr::PublicKey::from_hex(&engine.site_public_key().to_hex()).unwrap();
    let plain = nostr::nips::nip04::decrypt(recipient.secret_key(), &site, &ours.content).unwrap();
    assert_eq!(plain, "héllo / 世界 \"quoted\"");
}

#[test]
fn test_nostr_crate_payload_decrypts() {
    let sender = nostr::Keys::parse(&"33".repeat(32)).unwrap();
    let recipient = Keys::parse(&"44".repeat(32)).unwrap();
    let recipient_pk = nostr::PublicKey::from_hex(&recipient.public_key().to_hex()).unwrap();

    let payload = nostr::nips::nip04::encrypt(sender.secret_key(), &recipient_pk, "from nostr").unwrap();
    let sender_pk = PublicKey::from_hex(&sender.public_key().to_hex()).unwrap();
    let plain = crypto::nip04_decrypt(&payload, &sender_pk, recipient.secret_key()).unwrap();
    assert_eq!(plain, "from nostr");
}

#[test]
fn test_public_key_matches_nostr_crate() {
    let ours = Keys::parse(SITE_SECRET).unwrap();
    let theirs = nostr::Keys::parse(SITE_SECRET).unwrap();
    assert_eq!(ours.public_key().to_hex(), theirs.public_key().to_hex());
}

/// lookup_invoice に settled で答えるウォレット
fn settled_wallet(wallet: Keys) -> MockRelayFactory {
    let sub_id = Arc::new(Mutex::new(String::new()));
    MockRelayFactory::with_responder(move |_, msg| match msg {
        ClientMessage::Req { sub_id: id, .. } => {
            *sub_id.lock().unwrap() = id.clone();
            Vec::new()
        }
        ClientMessage::Event(request) if request.kind == KIND_NWC_REQUEST => {
            let plain = crypto::nip04_decrypt(&request.content, &request.pubkey, wallet.secret_key()).unwrap();
            let body: Value = serde_json::from_str(&plain).unwrap();
            assert_eq!(body["method"], "lookup_invoice");
            let reply = json!({
                "result_type": "lookup_invoice",
                "result": { "invoice": body["params"]["invoice"], "amount": 1000, "settled_at": 1700000000 }
            });
            let content = crypto::nip04_encrypt(&reply.to_string(), &request.pubkey, wallet.secret_key()).unwrap();
            let response = UnsignedEvent::new(
                wallet.public_key(),
                KIND_NWC_RESPONSE,
                vec![
                    vec!["p".to_string(), request.pubkey.to_hex()],
                    vec!["e".to_string(), request.id.to_hex()],
                ],
                content,
            )
            .sign(&wallet)
            .unwrap();
            vec![RelayMessage::Event { sub_id: sub_id.lock().unwrap().clone(), event: Box::new(response) }]
        }
        _ => Vec::new(),
    })
}

#[tokio::test]
async fn test_payment_verified_over_nwc() {
    let wallet = Keys::parse(&"55".repeat(32)).unwrap();
    let connection = NwcConnection {
        wallet_pubkey: wallet.public_key(),
        relay_url: "wss://relay.wallet".to_string(),
        client_secret: nostrpress_core::SecretKey::from_hex(&"66".repeat(32)).unwrap(),
        lud16: None,
    };
    let config = EngineConfig { nwc_uri: Some(connection.to_uri()), ..config() };
    let factory = settled_wallet(wallet);
    let engine = engine_with(config, &factory);

    let invoice = PendingInvoice { bolt11: "lnbc10n1...".to_string(), ..Default::default() };
    assert_eq!(engine.verification_method(&invoice), VerificationMethod::Nwc);
    assert!(engine.payment_verifier().is_paid(&invoice).await.unwrap());

    let tx = engine
        .nwc_client()
        .unwrap()
        .lookup_invoice(&InvoiceLookup::Invoice("lnbc10n1...".to_string()))
        .await
        .unwrap();
    assert_eq!(tx.invoice.as_deref(), Some("lnbc10n1..."));
}

#[tokio::test]
async fn test_no_verification_method_is_distinct() {
    let factory = MockRelayFactory::new();
    let engine = engine_with(config(), &factory);

    let invoice = PendingInvoice { bolt11: "lnbc1".to_string(), ..Default::default() };
    assert_eq!(engine.verification_method(&invoice), VerificationMethod::NotConfigured);
    assert!(matches!(
        engine.payment_verifier().is_paid(&invoice).await,
        Err(CoreError::NoVerificationMethod)
    ));
    assert!(engine.nwc_client().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_nwc_response_for_other_subscription_times_out() {
    let wallet = Keys::parse(&"55".repeat(32)).unwrap();
    let connection = NwcConnection {
        wallet_pubkey: wallet.public_key(),
        relay_url: "wss://relay.wallet".to_string(),
        client_secret: nostrpress_core::SecretKey::from_hex(&"66".repeat(32)).unwrap(),
        lud16: None,
    };
    let responder_wallet = wallet.clone();
    let factory = MockRelayFactory::with_responder(move |_, msg| match msg {
        ClientMessage::Event(request) => {
            let content = crypto::nip04_encrypt(
                r#"{"result_type":"get_balance","result":{"balance":1}}"#,
                &request.pubkey,
                responder_wallet.secret_key(),
            )
            .unwrap();
            let response = UnsignedEvent::new(
                responder_wallet.public_key(),
                KIND_NWC_RESPONSE,
                vec![vec!["p".to_string(), request.pubkey.to_hex()]],
                content,
            )
            .sign(&responder_wallet)
            .unwrap();
            vec![RelayMessage::Event { sub_id: "stale-subscription".to_string(), event: Box::new(response) }]
        }
        _ => Vec::new(),
    });
    let config = EngineConfig { nwc_uri: Some(connection.to_uri()), ..config() };
    let engine = engine_with(config, &factory);

    let started = tokio::time::Instant::now();
    let result = engine.nwc_client().unwrap().get_balance().await;
    assert!(matches!(result, Err(CoreError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(matches!(factory.sent().last(), Some((_, ClientMessage::Close { .. }))));
}
