//! Wire messages of a session, CBOR-encoded

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TransportError;
use crate::codec;
use crate::credentials::Credential;
use crate::feed::{FeedMessage, Seq};
use crate::keys::PublicKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuthMessage {
    Challenge { request_id: Uuid, challenge: Vec<u8> },
    Response { request_id: Uuid, credential: Option<Credential> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicatorMessage {
    /// The sender holds `length` entries of `feed_key`.
    Announce { feed_key: PublicKey, length: u64 },
    Block { feed_key: PublicKey, seq: Seq, message: FeedMessage },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Auth(AuthMessage),
    Replicator(ReplicatorMessage),
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        Ok(codec::encode(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        Ok(codec::decode(data)?)
    }
}

impl From<AuthMessage> for WireMessage {
    fn from(message: AuthMessage) -> Self {
        WireMessage::Auth(message)
    }
}

impl From<ReplicatorMessage> for WireMessage {
    fn from(message: ReplicatorMessage) -> Self {
        WireMessage::Replicator(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Assertion;
    use crate::identity::KeyPair;

    #[test]
    fn test_challenge_response_survive_the_wire() {
        let device = KeyPair::generate();
        let credential = Credential::issue_with_nonce(
            &device,
            device.public_key(),
            Assertion::Auth {
                space_key: PublicKey::random(),
            },
            vec![9; 32],
        )
        .unwrap();
        let request_id = Uuid::new_v4();
        let message = WireMessage::from(AuthMessage::Response {
            request_id,
            credential: Some(credential),
        });

        let decoded = WireMessage::decode(&message.encode().unwrap()).unwrap();
        match decoded {
            WireMessage::Auth(AuthMessage::Response {
                request_id: id,
                credential: Some(credential),
            }) => {
                assert_eq!(id, request_id);
                assert!(credential.verify().is_ok());
                assert_eq!(credential.proof.nonce, Some(vec![9; 32]));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_an_encoding_error() {
        assert!(matches!(
            WireMessage::decode(&[0xff, 0x00, 0x13]),
            Err(TransportError::EncodingError(_))
        ));
    }
}
