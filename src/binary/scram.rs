//! SCRAM-SHA-256 authentication.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) as used by the
//! SASL exchange during connection startup.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::Error;

type HmacSha256 = Hmac<Sha256>;

/// The only SASL mechanism this client speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Client side of one SCRAM exchange.
///
/// Holds only the client nonce and the bare first message; the password is
/// supplied when the final message is built and never stored.
pub struct ScramClient {
    client_nonce: String,
    client_first_bare: String,
}

/// Client-final-message plus the server signature it commits us to expect.
#[derive(Debug, Clone)]
pub struct ScramFinal {
    pub message: Vec<u8>,
    pub expected_signature: [u8; 32],
}

impl ScramFinal {
    /// Byte-compare the signature in a server-final-message with the one
    /// computed locally.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), ScramError> {
        let signature = parse_server_final(server_final)?;
        if signature.as_slice() != self.expected_signature.as_slice() {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }
        Ok(())
    }
}

impl ScramClient {
    /// Create a client with a fresh random nonce.
    pub fn new(username: &str) -> Self {
        // 18 random bytes, 24 base64 chars
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; 18] = rng.gen();
        Self::with_nonce(username, &BASE64.encode(nonce_bytes))
    }

    pub(crate) fn with_nonce(username: &str, client_nonce: &str) -> Self {
        Self {
            client_nonce: client_nonce.to_string(),
            client_first_bare: format!("n={},r={}", sasl_name(username), client_nonce),
        }
    }

    /// Client-first-message for `mechanism`.
    ///
    /// Format: `n,,n=<username>,r=<client-nonce>`
    pub fn initial_message(&self, mechanism: &str) -> Result<Vec<u8>, ScramError> {
        if mechanism != SCRAM_SHA_256 {
            return Err(ScramError::UnsupportedMechanism(mechanism.to_string()));
        }
        // GS2 header: no channel binding, no authzid
        Ok(format!("n,,{}", self.client_first_bare).into_bytes())
    }

    /// Process the server-first-message and build the client-final-message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn final_message(
        &self,
        server_first: &[u8],
        password: &str,
    ) -> Result<ScramFinal, ScramError> {
        let server_str =
            std::str::from_utf8(server_first).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_str.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .ok()
                        .filter(|i| *i > 0)
                        .ok_or(ScramError::InvalidIterations)?,
                );
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        // Server nonce must extend ours
        if !combined_nonce.starts_with(&self.client_nonce)
            || combined_nonce.len() == self.client_nonce.len()
        {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_str, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof = xor_bytes(&client_key, &client_signature);

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        Ok(ScramFinal {
            message: format!(
                "{},p={}",
                client_final_without_proof,
                BASE64.encode(client_proof)
            )
            .into_bytes(),
            expected_signature,
        })
    }
}

/// Extract the server signature from a server-final-message (`v=<base64>`).
pub fn parse_server_final(server_final: &[u8]) -> Result<Vec<u8>, ScramError> {
    let server_str =
        std::str::from_utf8(server_final).map_err(|_| ScramError::InvalidServerMessage)?;

    if let Some(reason) = server_str.strip_prefix("e=") {
        return Err(ScramError::ServerError(reason.to_string()));
    }

    let verifier = server_str
        .split(',')
        .find_map(|part| part.strip_prefix("v="))
        .ok_or(ScramError::InvalidServerSignature)?;

    BASE64
        .decode(verifier)
        .map_err(|_| ScramError::InvalidServerSignature)
}

/// SCRAM authentication errors.
#[derive(Debug, Clone)]
pub enum ScramError {
    UnsupportedMechanism(String),
    InvalidServerMessage,
    InvalidSalt,
    InvalidIterations,
    MissingNonce,
    MissingSalt,
    MissingIterations,
    NonceVerificationFailed,
    InvalidServerSignature,
    ServerSignatureVerificationFailed,
    ServerError(String),
}

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedMechanism(m) => write!(f, "Unsupported SASL mechanism: {}", m),
            Self::InvalidServerMessage => write!(f, "Invalid server message"),
            Self::InvalidSalt => write!(f, "Invalid salt encoding"),
            Self::InvalidIterations => write!(f, "Invalid iteration count"),
            Self::MissingNonce => write!(f, "Missing nonce in server message"),
            Self::MissingSalt => write!(f, "Missing salt in server message"),
            Self::MissingIterations => write!(f, "Missing iterations in server message"),
            Self::NonceVerificationFailed => write!(f, "Server nonce verification failed"),
            Self::InvalidServerSignature => write!(f, "Invalid server signature"),
            Self::ServerSignatureVerificationFailed => {
                write!(f, "Server signature verification failed")
            }
            Self::ServerError(reason) => write!(f, "Server rejected authentication: {}", reason),
        }
    }
}

impl std::error::Error for ScramError {}

impl From<ScramError> for Error {
    fn from(e: ScramError) -> Self {
        Error::Authentication(e.to_string())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
pub(crate) fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub(crate) fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = a[i] ^ b[i];
    }
    result
}

/// Escape `=` and `,` in a username (RFC 5802 `saslname`).
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_vector() {
        let client = ScramClient::with_nonce("user", NONCE);

        let first = client.initial_message(SCRAM_SHA_256).unwrap();
        assert_eq!(first, b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let fin = client
            .final_message(SERVER_FIRST.as_bytes(), "pencil")
            .unwrap();
        assert_eq!(String::from_utf8(fin.message.clone()).unwrap(), CLIENT_FINAL);
        fin.verify(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_forged_signature_rejected() {
        let client = ScramClient::with_nonce("user", NONCE);
        let fin = client
            .final_message(SERVER_FIRST.as_bytes(), "pencil")
            .unwrap();
        let forged = format!("v={}", BASE64.encode([0u8; 32]));
        assert!(matches!(
            fin.verify(forged.as_bytes()),
            Err(ScramError::ServerSignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_unsupported_mechanism() {
        let client = ScramClient::new("user");
        assert!(matches!(
            client.initial_message("SCRAM-SHA-1"),
            Err(ScramError::UnsupportedMechanism(_))
        ));
        assert!(client.initial_message("scram-sha-256").is_err());
    }

    #[test]
    fn test_random_nonce_shape() {
        let first = ScramClient::new("edgedb")
            .initial_message(SCRAM_SHA_256)
            .unwrap();
        let first = String::from_utf8(first).unwrap();
        let nonce = first.strip_prefix("n,,n=edgedb,r=").unwrap();
        assert_eq!(nonce.len(), 24);
        assert!(BASE64.decode(nonce).is_ok());
    }

    #[test]
    fn test_server_nonce_must_extend_client_nonce() {
        let client = ScramClient::with_nonce("user", NONCE);
        let server_first = format!("r=other,s={},i=4096", BASE64.encode(b"salt"));
        assert!(matches!(
            client.final_message(server_first.as_bytes(), "pencil"),
            Err(ScramError::NonceVerificationFailed)
        ));
    }

    #[test]
    fn test_bad_iterations() {
        let client = ScramClient::with_nonce("user", NONCE);
        let server_first = format!("r={}xyz,s={},i=0", NONCE, BASE64.encode(b"salt"));
        assert!(matches!(
            client.final_message(server_first.as_bytes(), "pencil"),
            Err(ScramError::InvalidIterations)
        ));
    }

    #[test]
    fn test_username_escaping() {
        let client = ScramClient::with_nonce("a=b,c", "n");
        let first = client.initial_message(SCRAM_SHA_256).unwrap();
        assert_eq!(first, b"n,,n=a=3Db=2Cc,r=n");
    }

    #[test]
    fn test_server_error_attribute() {
        assert!(matches!(
            parse_server_final(b"e=invalid-proof"),
            Err(ScramError::ServerError(_))
        ));
    }
}
