//! secp256k1 鍵導出、イベントID、BIP-340 署名、NIP-04 暗号化

use aes::Aes256;
use base64::engine::{general_purpose, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use k256::schnorr::{Signature as SchnorrSignature, SigningKey, VerifyingKey};
use serde_json::json;
use sha2::{Digest, Sha256};
use signature::hazmat::{PrehashSigner, PrehashVerifier};

use crate::error::{CoreError, Result};
use crate::event::{NostrEvent, UnsignedEvent};
use crate::keys::{EventId, Keys, PublicKey, SecretKey, Signature};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

fn signing_key(secret_key: &SecretKey) -> Result<SigningKey> {
    SigningKey::from_bytes(secret_key.as_bytes())
        .map_err(|e| CoreError::InvalidKeyFormat(format!("invalid secret key: {}", e)))
}

/// 秘密鍵から x-only 公開鍵を導出 (y のパリティに依存しない)
pub fn get_public_key(secret_key: &SecretKey) -> Result<PublicKey> {
    let signing = signing_key(secret_key)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&signing.verifying_key().to_bytes());
    Ok(PublicKey::from_bytes(out))
}

/// NIP-01 の正規シリアライズ `[0, pubkey, created_at, kind, tags, content]`
///
/// serde_json は `/` も非 ASCII もエスケープしないので、そのまま ID 計算に使える。
pub fn canonical_json(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    Ok(serde_json::to_string(&json!([
        0,
        pubkey.to_hex(),
        created_at,
        kind,
        tags,
        content
    ]))?)
}

/// イベントIDを計算
pub fn event_id(event: &UnsignedEvent) -> Result<EventId> {
    let serialized = canonical_json(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    let digest = Sha256::digest(serialized.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(EventId::from_bytes(out))
}

/// ID を確定させてから BIP-340 Schnorr で署名
pub fn sign_event(event: UnsignedEvent, keys: &Keys) -> Result<NostrEvent> {
    if event.pubkey != keys.public_key() {
        return Err(CoreError::SignatureError(format!(
            "event pubkey {} does not match signing key {}",
            event.pubkey,
            keys.public_key()
        )));
    }

    let id = event_id(&event)?;
    let signing = signing_key(keys.secret_key())?;
    let sig: SchnorrSignature = signing
        .sign_prehash(id.as_bytes())
        .map_err(|e| CoreError::SignatureError(format!("schnorr sign failed: {}", e)))?;

    Ok(NostrEvent {
        id,
        pubkey: event.pubkey,
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags,
        content: event.content,
        sig: Signature::from_bytes(sig.to_bytes()),
    })
}

/// ID の再計算と署名検証
pub fn verify_event(event: &NostrEvent) -> Result<()> {
    let expected = event_id(&event.unsigned())?;
    if expected != event.id {
        return Err(CoreError::SignatureError(format!(
            "event id mismatch: expected {}, got {}",
            expected, event.id
        )));
    }

    let verifying = VerifyingKey::from_bytes(event.pubkey.as_bytes())
        .map_err(|e| CoreError::InvalidKeyFormat(format!("invalid public key: {}", e)))?;
    let sig = SchnorrSignature::try_from(&event.sig.as_bytes()[..])
        .map_err(|e| CoreError::SignatureError(format!("malformed signature: {}", e)))?;

    verifying
        .verify_prehash(event.id.as_bytes(), &sig)
        .map_err(|e| CoreError::SignatureError(format!("signature verification failed: {}", e)))
}

/// ECDH 共有秘密 (共有点の x 座標、ハッシュなし)
///
/// 相手は x-only 鍵しか分からないので、偶数 (02) → 奇数 (03) の順に点を復元する。
pub fn derive_shared_secret(our_secret: &SecretKey, their_public: &PublicKey) -> Result<[u8; 32]> {
    let secret = k256::SecretKey::from_slice(our_secret.as_bytes())
        .map_err(|e| CoreError::InvalidKeyFormat(format!("invalid secret key: {}", e)))?;

    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(their_public.as_bytes());
    let point = k256::PublicKey::from_sec1_bytes(&sec1)
        .or_else(|_| {
            sec1[0] = 0x03;
            k256::PublicKey::from_sec1_bytes(&sec1)
        })
        .map_err(|_| {
            CoreError::InvalidKeyFormat(format!("{} is not a point on secp256k1", their_public))
        })?;

    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), point.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// NIP-04 暗号化 `base64(ciphertext)?iv=base64(iv)`
pub fn nip04_encrypt(
    plaintext: &str,
    recipient: &PublicKey,
    sender_secret: &SecretKey,
) -> Result<String> {
    let mut iv = [0u8; IV_LEN];
    getrandom::getrandom(&mut iv)
        .map_err(|e| CoreError::EncryptionFailure(format!("random IV unavailable: {}", e)))?;
    nip04_encrypt_with_iv(plaintext, recipient, sender_secret, iv)
}

pub(crate) fn nip04_encrypt_with_iv(
    plaintext: &str,
    recipient: &PublicKey,
    sender_secret: &SecretKey,
    iv: [u8; IV_LEN],
) -> Result<String> {
    let key = derive_shared_secret(sender_secret, recipient)
        .map_err(|e| CoreError::EncryptionFailure(e.to_string()))?;

    let cipher = Aes256CbcEnc::new_from_slices(&key, &iv)
        .map_err(|e| CoreError::EncryptionFailure(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(ciphertext),
        general_purpose::STANDARD.encode(iv)
    ))
}

/// NIP-04 復号
///
/// `?` がちょうど1つであること。IV 側の `iv=` 接頭辞は省略可。
pub fn nip04_decrypt(
    payload: &str,
    sender: &PublicKey,
    recipient_secret: &SecretKey,
) -> Result<String> {
    let mut parts = payload.split('?');
    let (ciphertext_b64, iv_part) = match (parts.next(), parts.next(), parts.next()) {
        (Some(c), Some(i), None) => (c, i),
        _ => {
            return Err(CoreError::DecryptionFailure(
                "payload must contain exactly one '?'".to_string(),
            ))
        }
    };
    let iv_b64 = iv_part.strip_prefix("iv=").unwrap_or(iv_part);

    let ciphertext = general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|e| CoreError::DecryptionFailure(format!("ciphertext base64: {}", e)))?;
    let iv = general_purpose::STANDARD
        .decode(iv_b64)
        .map_err(|e| CoreError::DecryptionFailure(format!("iv base64: {}", e)))?;
    if iv.len() != IV_LEN {
        return Err(CoreError::DecryptionFailure(format!(
            "iv must be {} bytes, got {}",
            IV_LEN,
            iv.len()
        )));
    }

    let key = derive_shared_secret(recipient_secret, sender)
        .map_err(|e| CoreError::DecryptionFailure(e.to_string()))?;
    let cipher = Aes256CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| CoreError::DecryptionFailure(e.to_string()))?;
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CoreError::DecryptionFailure("invalid padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|_| CoreError::DecryptionFailure("plaintext is not UTF-8".to_string()))
}
