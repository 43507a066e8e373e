//! Nostr Wallet Connect RPC shape (NIP-47).
//!
//! Requests are kind-23194 events, NIP-04-encrypted to the wallet service
//! pubkey and signed with the secret carried in the wallet URI; responses
//! are kind 23195. Only the request/response plumbing lives here — wallet
//! business flows are external collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::session::NwcWallet;
use super::SignerError;
use crate::crypto::nip04;
use crate::relays::{RelayPool, SubscriptionUpdate};
use crate::types::{Keys, Template, NWC_REQUEST, NWC_RESPONSE};

const NWC_BUDGET: Duration = Duration::from_secs(5);

/// Build one signed NWC request event.
pub fn build_request(
    wallet: &NwcWallet,
    method: &str,
    params: Value,
) -> Result<(Keys, crate::types::Event), SignerError> {
    let keys = Keys::parse(&wallet.secret)?;
    let body = serde_json::json!({ "method": method, "params": params });
    let ciphertext = nip04::encrypt(&keys.secret_key, &wallet.wallet_pubkey, &body.to_string())?;
    let event = Template::new(
        NWC_REQUEST,
        ciphertext,
        vec![vec!["p".to_string(), wallet.wallet_pubkey.to_hex()]],
    )
    .to_event(&keys)?;
    Ok((keys, event))
}

/// One NWC round trip over the relay pool: subscribe for the response,
/// publish the request, decrypt the first matching answer.
pub async fn request(
    pool: &Arc<RelayPool>,
    wallet: &NwcWallet,
    method: &str,
    params: Value,
) -> Result<Value, SignerError> {
    let (keys, event) = build_request(wallet, method, params)?;
    let request_id = event.id.to_hex();

    let mut filter = crate::types::Filter::new()
        .kind(NWC_RESPONSE)
        .pubkey_ref(keys.public_key().to_hex())
        .since(crate::utils::now() - 10);
    filter.e_tags = Some(vec![request_id.clone()]);

    let relays = vec![wallet.relay.clone()];
    let (sub_id, mut rx, attached) = pool.subscribe(&relays, vec![filter]).await;
    if attached == 0 {
        return Err(SignerError::NotConnected);
    }

    let ok_rx = pool.publish_relay(&wallet.relay, &event).await?;
    drop(ok_rx); // The response event, not the OK, is the answer.

    let result = tokio::time::timeout(NWC_BUDGET, async {
        while let Some(update) = rx.recv().await {
            let SubscriptionUpdate::Event(response) = update else {
                continue;
            };
            if response.kind != NWC_RESPONSE {
                continue;
            }
            let plaintext =
                nip04::decrypt(&keys.secret_key, &wallet.wallet_pubkey, &response.content)?;
            let body: Value = serde_json::from_str(&plaintext)
                .map_err(|e| SignerError::UnexpectedResponse(e.to_string()))?;
            if let Some(error) = body.get("error").and_then(|e| e.get("message")) {
                return Err(SignerError::Rejected(
                    error.as_str().unwrap_or("wallet error").to_string(),
                ));
            }
            return Ok(body.get("result").cloned().unwrap_or(Value::Null));
        }
        Err(SignerError::Timeout)
    })
    .await;

    {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.unsubscribe(&relays, &sub_id).await;
        });
    }

    result.unwrap_or(Err(SignerError::Timeout))
}

/// `get_balance`: millisatoshi balance, per the NIP-47 result shape.
pub async fn get_balance(pool: &Arc<RelayPool>, wallet: &NwcWallet) -> Result<u64, SignerError> {
    let result = request(pool, wallet, "get_balance", Value::Null).await?;
    result
        .get("balance")
        .and_then(Value::as_u64)
        .ok_or_else(|| SignerError::UnexpectedResponse("balance missing".into()))
}
