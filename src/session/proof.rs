//! `ton_proof` framing
//!
//! ```text
//! message = "ton-proof-item-v2/" | wc (i32 BE) | hash (32) | len(domain) (u32 LE) | domain | ts (u64 LE) | payload
//! input   = 0xffff | "ton-connect" | sha256(message)
//! sig     = ed25519(sha256(input))
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::ledger::RawAddress;
use super::types::{ConnectItemReply, ProofChallenge, ProofDomain, TonProof};
use crate::crypto::{verify_with_pubkey_hex, MessageSigner};

const PROOF_ITEM_PREFIX: &[u8] = b"ton-proof-item-v2/";
const CONNECT_PREFIX: &[u8] = b"ton-connect";

pub fn proof_message(address: &RawAddress, challenge: &ProofChallenge) -> Vec<u8> {
    let domain = challenge.domain.as_bytes();
    let payload = challenge.payload.as_bytes();

    let mut message = Vec::with_capacity(PROOF_ITEM_PREFIX.len() + 4 + 32 + 4 + domain.len() + 8 + payload.len());
    message.extend_from_slice(PROOF_ITEM_PREFIX);
    message.extend_from_slice(&address.workchain.to_be_bytes());
    message.extend_from_slice(&address.hash);
    message.extend_from_slice(&(domain.len() as u32).to_le_bytes());
    message.extend_from_slice(domain);
    message.extend_from_slice(&challenge.timestamp.to_le_bytes());
    message.extend_from_slice(payload);
    message
}

/// Pre-hash buffer shared by every signing path.
pub fn signing_input(address: &RawAddress, challenge: &ProofChallenge) -> Vec<u8> {
    let message_hash = Sha256::digest(proof_message(address, challenge));
    let mut input = Vec::with_capacity(2 + CONNECT_PREFIX.len() + 32);
    input.extend_from_slice(&[0xff, 0xff]);
    input.extend_from_slice(CONNECT_PREFIX);
    input.extend_from_slice(&message_hash);
    input
}

pub fn signing_digest(address: &RawAddress, challenge: &ProofChallenge) -> [u8; 32] {
    Sha256::digest(signing_input(address, challenge)).into()
}

/// Interactive path: sign with a key unlocked in the privileged context.
pub fn sign_proof(signer: &dyn MessageSigner, address: &RawAddress, challenge: &ProofChallenge) -> ConnectItemReply {
    let signature = signer.sign_message(&signing_digest(address, challenge));
    build_proof_reply(challenge, BASE64.encode(signature))
}

/// Pre-signed path: wrap a signature produced elsewhere (hardware device).
pub fn build_proof_reply(challenge: &ProofChallenge, signature: String) -> ConnectItemReply {
    ConnectItemReply::TonProof {
        proof: TonProof {
            timestamp: challenge.timestamp,
            domain: ProofDomain {
                length_bytes: challenge.domain.len() as u32,
                value: challenge.domain.clone(),
            },
            signature,
            payload: challenge.payload.clone(),
        },
    }
}

pub fn verify_proof_signature(
    public_key_hex: &str,
    address: &RawAddress,
    challenge: &ProofChallenge,
    signature_base64: &str,
) -> bool {
    match BASE64.decode(signature_base64) {
        Ok(signature) => verify_with_pubkey_hex(&signing_digest(address, challenge), &signature, public_key_hex),
        Err(_) => false,
    }
}
