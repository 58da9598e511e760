//! # Connect Tokens
//!
//! A connect token is the credential a game backend hands to a client so it may
//! join one of a list of servers. The backend and its servers share an Ed25519
//! signing key; servers never authenticate players themselves.
//!
//! ## Layout
//!
//! ```text
//! +--------------------+  client section (96 bytes, readable by the client)
//! | version, app id    |    version marker, application id, creation time,
//! | session keys       |    client->server key, server->client key
//! +====================+  connect token packet (sent to the server)
//! | public section     |    768 bytes: version, app id, creation, expiration,
//! |                    |    handshake timeout, endpoint list
//! | nonce              |    24 bytes
//! | secret section     |    352 bytes sealed with XChaCha20-Poly1305 (+16 tag),
//! |                    |    public section as associated data: client id,
//! |                    |    session keys, 256 bytes of user data
//! | signature          |    64 bytes, Ed25519 over everything above it
//! +--------------------+
//! ```
//!
//! Sections are bincode-encoded and zero-padded to their fixed sizes. The client
//! keeps the session keys from its own section and forwards only the packet part;
//! the server recovers the same keys from the sealed secret section.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::crypto::{
    self, SigningKey, SymmetricKey, VerifyingKey, KEY_BYTES, MAC_BYTES, SIGNATURE_BYTES,
    XNONCE_BYTES,
};
use crate::error::TokenError;
use crate::wire;
use crate::{PROTOCOL_VERSION, VERSION_INFO_BYTES};

pub const CONNECT_TOKEN_ENDPOINT_MAX: usize = 32;
pub const USER_DATA_BYTES: usize = 256;

pub const CLIENT_SECTION_BYTES: usize = 96;
pub const PUBLIC_SECTION_BYTES: usize = 768;
pub const SECRET_SECTION_BYTES: usize = 352;
pub const CONNECT_TOKEN_PACKET_BYTES: usize =
    PUBLIC_SECTION_BYTES + XNONCE_BYTES + SECRET_SECTION_BYTES + MAC_BYTES + SIGNATURE_BYTES;
pub const CONNECT_TOKEN_BYTES: usize = CLIENT_SECTION_BYTES + CONNECT_TOKEN_PACKET_BYTES;

#[derive(Serialize, Deserialize)]
struct ClientSection {
    version_info: [u8; VERSION_INFO_BYTES],
    application_id: u64,
    creation_time: u64,
    client_to_server_key: [u8; KEY_BYTES],
    server_to_client_key: [u8; KEY_BYTES],
}

#[derive(Serialize, Deserialize)]
struct PublicSection {
    version_info: [u8; VERSION_INFO_BYTES],
    application_id: u64,
    creation_time: u64,
    expiration_time: u64,
    handshake_timeout: u32,
    endpoints: Vec<SocketAddr>,
}

#[derive(Serialize, Deserialize)]
struct SecretSection {
    client_id: u64,
    client_to_server_key: [u8; KEY_BYTES],
    server_to_client_key: [u8; KEY_BYTES],
    user_data: Vec<u8>,
}

/// Everything needed to mint one connect token.
#[derive(Debug, Clone)]
pub struct ConnectTokenParams<'a> {
    pub application_id: u64,
    /// Unix seconds.
    pub creation_time: u64,
    /// Unix seconds. The token is accepted while `current_time <= expiration_time`.
    pub expiration_time: u64,
    /// Seconds a handshake step may wait for a reply.
    pub handshake_timeout: u32,
    pub endpoints: &'a [SocketAddr],
    pub client_id: u64,
    pub client_to_server_key: &'a SymmetricKey,
    pub server_to_client_key: &'a SymmetricKey,
    /// Opaque application data delivered to the server. Zeroed when `None`.
    pub user_data: Option<&'a [u8]>,
}

/// A token as seen by the client that will use it.
#[derive(Debug, Clone)]
pub struct ConnectToken {
    pub application_id: u64,
    pub creation_time: u64,
    pub expiration_time: u64,
    pub handshake_timeout: u32,
    pub endpoints: Vec<SocketAddr>,
    pub client_to_server_key: SymmetricKey,
    pub server_to_client_key: SymmetricKey,
    /// The connect token packet, forwarded verbatim in `ConnectionRequest`.
    pub packet: Vec<u8>,
}

/// A token as recovered by a server from a `ConnectionRequest`.
#[derive(Debug, Clone)]
pub struct PrivateConnectToken {
    pub application_id: u64,
    pub creation_time: u64,
    pub expiration_time: u64,
    pub handshake_timeout: u32,
    pub endpoints: Vec<SocketAddr>,
    pub client_id: u64,
    pub client_to_server_key: SymmetricKey,
    pub server_to_client_key: SymmetricKey,
    pub user_data: Vec<u8>,
    /// Identifies this token in the server's replay cache.
    pub signature: [u8; SIGNATURE_BYTES],
}

fn write_padded<T: Serialize>(value: &T, size: usize, out: &mut Vec<u8>) -> Result<(), TokenError> {
    let bytes = wire::serialize(value).map_err(|e| TokenError::Encode(e.to_string()))?;
    if bytes.len() > size {
        return Err(TokenError::Encode(format!(
            "section needs {} bytes, only {} available",
            bytes.len(),
            size
        )));
    }
    let start = out.len();
    out.extend_from_slice(&bytes);
    out.resize(start + size, 0);
    Ok(())
}

fn read_public_section(packet: &[u8], application_id: u64) -> Result<PublicSection, TokenError> {
    let public: PublicSection =
        wire::deserialize(&packet[..PUBLIC_SECTION_BYTES]).map_err(|_| TokenError::InvalidFormat)?;

    if public.version_info != PROTOCOL_VERSION || public.application_id != application_id {
        return Err(TokenError::InvalidFormat);
    }
    if public.endpoints.is_empty() || public.endpoints.len() > CONNECT_TOKEN_ENDPOINT_MAX {
        return Err(TokenError::InvalidFormat);
    }
    Ok(public)
}

/// Mints a connect token, signed and sealed with `signing_key`.
pub fn create(params: &ConnectTokenParams<'_>, signing_key: &SigningKey) -> Result<Vec<u8>, TokenError> {
    if params.endpoints.is_empty() {
        return Err(TokenError::NoEndpoints);
    }
    if params.endpoints.len() > CONNECT_TOKEN_ENDPOINT_MAX {
        return Err(TokenError::TooManyEndpoints(params.endpoints.len()));
    }
    let user_data = match params.user_data {
        Some(data) if data.len() != USER_DATA_BYTES => {
            return Err(TokenError::InvalidUserData(data.len()))
        }
        Some(data) => data.to_vec(),
        None => vec![0u8; USER_DATA_BYTES],
    };

    let mut token = Vec::with_capacity(CONNECT_TOKEN_BYTES);
    write_padded(
        &ClientSection {
            version_info: PROTOCOL_VERSION,
            application_id: params.application_id,
            creation_time: params.creation_time,
            client_to_server_key: *params.client_to_server_key.as_bytes(),
            server_to_client_key: *params.server_to_client_key.as_bytes(),
        },
        CLIENT_SECTION_BYTES,
        &mut token,
    )?;

    let packet_start = token.len();
    write_padded(
        &PublicSection {
            version_info: PROTOCOL_VERSION,
            application_id: params.application_id,
            creation_time: params.creation_time,
            expiration_time: params.expiration_time,
            handshake_timeout: params.handshake_timeout,
            endpoints: params.endpoints.to_vec(),
        },
        PUBLIC_SECTION_BYTES,
        &mut token,
    )?;

    let mut nonce = [0u8; XNONCE_BYTES];
    crypto::random_bytes(&mut nonce);
    token.extend_from_slice(&nonce);

    let mut secret = Vec::with_capacity(SECRET_SECTION_BYTES);
    write_padded(
        &SecretSection {
            client_id: params.client_id,
            client_to_server_key: *params.client_to_server_key.as_bytes(),
            server_to_client_key: *params.server_to_client_key.as_bytes(),
            user_data,
        },
        SECRET_SECTION_BYTES,
        &mut secret,
    )?;

    let token_key = crypto::derive_token_key(signing_key)?;
    let sealed = {
        let public = &token[packet_start..packet_start + PUBLIC_SECTION_BYTES];
        crypto::encrypt_bignonce(&token_key, &nonce, public, &secret)?
    };
    token.extend_from_slice(&sealed);

    let signature = crypto::sign(signing_key, &token[packet_start..]);
    token.extend_from_slice(&signature);

    debug_assert_eq!(token.len(), CONNECT_TOKEN_BYTES);
    Ok(token)
}

/// Reads a token on the client.
///
/// Only the format, application id and expiration are checked; the signature is
/// the server's business.
pub fn open_as_client(
    token: &[u8],
    application_id: u64,
    current_time: u64,
) -> Result<ConnectToken, TokenError> {
    if token.len() != CONNECT_TOKEN_BYTES {
        return Err(TokenError::InvalidFormat);
    }

    let client: ClientSection =
        wire::deserialize(&token[..CLIENT_SECTION_BYTES]).map_err(|_| TokenError::InvalidFormat)?;
    if client.version_info != PROTOCOL_VERSION || client.application_id != application_id {
        return Err(TokenError::InvalidFormat);
    }

    let packet = &token[CLIENT_SECTION_BYTES..];
    let public = read_public_section(packet, application_id)?;
    if current_time > public.expiration_time {
        return Err(TokenError::TokenExpired);
    }

    Ok(ConnectToken {
        application_id,
        creation_time: public.creation_time,
        expiration_time: public.expiration_time,
        handshake_timeout: public.handshake_timeout,
        endpoints: public.endpoints,
        client_to_server_key: SymmetricKey::from_bytes(client.client_to_server_key),
        server_to_client_key: SymmetricKey::from_bytes(client.server_to_client_key),
        packet: packet.to_vec(),
    })
}

/// Verifies and opens a connect token packet on the server.
///
/// `secret_key` is the backend signing key the sealing key is derived from.
pub fn open_as_server(
    packet: &[u8],
    public_key: &VerifyingKey,
    secret_key: &SigningKey,
    application_id: u64,
    current_time: u64,
) -> Result<PrivateConnectToken, TokenError> {
    if packet.len() != CONNECT_TOKEN_PACKET_BYTES {
        return Err(TokenError::InvalidFormat);
    }

    let public = read_public_section(packet, application_id)?;

    let (signed, signature) = packet.split_at(CONNECT_TOKEN_PACKET_BYTES - SIGNATURE_BYTES);
    let signature: [u8; SIGNATURE_BYTES] =
        signature.try_into().map_err(|_| TokenError::InvalidFormat)?;
    if !crypto::verify(public_key, signed, &signature) {
        return Err(TokenError::SignatureInvalid);
    }

    let (public_bytes, rest) = signed.split_at(PUBLIC_SECTION_BYTES);
    let (nonce, sealed) = rest.split_at(XNONCE_BYTES);
    let nonce: [u8; XNONCE_BYTES] = nonce.try_into().map_err(|_| TokenError::InvalidFormat)?;

    let token_key = crypto::derive_token_key(secret_key)?;
    let plaintext = crypto::decrypt_bignonce(&token_key, &nonce, public_bytes, sealed)
        .map_err(|_| TokenError::SignatureInvalid)?;
    let secret: SecretSection =
        wire::deserialize(&plaintext).map_err(|_| TokenError::InvalidFormat)?;
    if secret.user_data.len() != USER_DATA_BYTES {
        return Err(TokenError::InvalidFormat);
    }

    if current_time > public.expiration_time {
        return Err(TokenError::TokenExpired);
    }

    Ok(PrivateConnectToken {
        application_id,
        creation_time: public.creation_time,
        expiration_time: public.expiration_time,
        handshake_timeout: public.handshake_timeout,
        endpoints: public.endpoints,
        client_id: secret.client_id,
        client_to_server_key: SymmetricKey::from_bytes(secret.client_to_server_key),
        server_to_client_key: SymmetricKey::from_bytes(secret.server_to_client_key),
        user_data: secret.user_data,
        signature,
    })
}
