//! Signed credentials

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CredentialError;
use crate::identity::KeyPair;
use crate::keys::PublicKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberRole {
    Owner,
    Admin,
    Editor,
    Reader,
}

impl MemberRole {
    /// Whether members with this role may admit other members.
    pub fn can_admit_members(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }
}

/// What a feed carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Designation {
    Control,
    Data,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Assertion {
    /// Creates a space. Subject and issuer are the space key.
    SpaceGenesis { space_key: PublicKey },
    /// Admits the subject as a member.
    SpaceMember {
        space_key: PublicKey,
        role: MemberRole,
        genesis_feed_key: PublicKey,
    },
    /// Admits the subject feed, written by `device_key` on behalf of member
    /// `identity_key`.
    AdmittedFeed {
        space_key: PublicKey,
        identity_key: PublicKey,
        device_key: PublicKey,
        designation: Designation,
    },
    /// Answer to an auth challenge. Never written to a feed.
    Auth { space_key: PublicKey },
}

impl Assertion {
    pub fn space_key(&self) -> &PublicKey {
        match self {
            Assertion::SpaceGenesis { space_key }
            | Assertion::SpaceMember { space_key, .. }
            | Assertion::AdmittedFeed { space_key, .. }
            | Assertion::Auth { space_key } => space_key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Assertion::SpaceGenesis { .. } => "SpaceGenesis",
            Assertion::SpaceMember { .. } => "SpaceMember",
            Assertion::AdmittedFeed { .. } => "AdmittedFeed",
            Assertion::Auth { .. } => "Auth",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub signer: PublicKey,
    pub signature: Vec<u8>,
    #[serde(default)]
    pub nonce: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub issuer: PublicKey,
    pub subject: PublicKey,
    pub issuance_date: DateTime<Utc>,
    pub assertion: Assertion,
    pub proof: Proof,
}

/// The signed part of a credential.
#[derive(Serialize)]
struct SigningPayload<'a> {
    id: &'a Uuid,
    issuer: &'a PublicKey,
    subject: &'a PublicKey,
    issuance_date: &'a DateTime<Utc>,
    assertion: &'a Assertion,
    signer: &'a PublicKey,
    nonce: &'a Option<Vec<u8>>,
}

impl Credential {
    /// Issue a credential signed by `signer`, who is also the issuer.
    pub fn issue(signer: &KeyPair, subject: PublicKey, assertion: Assertion) -> Result<Self, CredentialError> {
        Self::sign(signer, subject, assertion, None)
    }

    /// Issue a credential bound to a challenge.
    pub fn issue_with_nonce(
        signer: &KeyPair,
        subject: PublicKey,
        assertion: Assertion,
        nonce: Vec<u8>,
    ) -> Result<Self, CredentialError> {
        Self::sign(signer, subject, assertion, Some(nonce))
    }

    fn sign(
        signer: &KeyPair,
        subject: PublicKey,
        assertion: Assertion,
        nonce: Option<Vec<u8>>,
    ) -> Result<Self, CredentialError> {
        let mut credential = Credential {
            id: Uuid::new_v4(),
            issuer: signer.public_key(),
            subject,
            issuance_date: Utc::now(),
            assertion,
            proof: Proof {
                signer: signer.public_key(),
                signature: Vec::new(),
                nonce,
            },
        };
        credential.proof.signature = signer
            .sign_json(&credential.signing_payload())
            .map_err(|e| CredentialError::SerializationError(e.to_string()))?;
        Ok(credential)
    }

    fn signing_payload(&self) -> SigningPayload<'_> {
        SigningPayload {
            id: &self.id,
            issuer: &self.issuer,
            subject: &self.subject,
            issuance_date: &self.issuance_date,
            assertion: &self.assertion,
            signer: &self.proof.signer,
            nonce: &self.proof.nonce,
        }
    }

    /// Check the signature. Only self-issued credentials are accepted.
    pub fn verify(&self) -> Result<(), CredentialError> {
        if self.proof.signer != self.issuer {
            return Err(CredentialError::InvalidSignature(format!(
                "credential {} signed by {} but issued by {}",
                self.id,
                self.proof.signer.truncate(),
                self.issuer.truncate()
            )));
        }
        if !KeyPair::verify_json(&self.proof.signer, &self.signing_payload(), &self.proof.signature) {
            return Err(CredentialError::InvalidSignature(format!(
                "bad signature on credential {}",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis(space: &KeyPair) -> Credential {
        Credential::issue(
            space,
            space.public_key(),
            Assertion::SpaceGenesis {
                space_key: space.public_key(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_issued_credential_verifies() {
        let space = KeyPair::generate();
        let credential = genesis(&space);
        assert!(credential.verify().is_ok());
        assert_eq!(credential.assertion.space_key(), &space.public_key());
    }

    #[test]
    fn test_tampered_credential_fails() {
        let space = KeyPair::generate();
        let mut credential = genesis(&space);
        credential.subject = PublicKey::random();
        assert!(matches!(
            credential.verify(),
            Err(CredentialError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_nonce_is_signed() {
        let device = KeyPair::generate();
        let mut credential = Credential::issue_with_nonce(
            &device,
            device.public_key(),
            Assertion::Auth {
                space_key: PublicKey::random(),
            },
            vec![1, 2, 3],
        )
        .unwrap();
        assert!(credential.verify().is_ok());
        credential.proof.nonce = Some(vec![1, 2, 4]);
        assert!(credential.verify().is_err());
    }

    #[test]
    fn test_foreign_issuer_fails() {
        let space = KeyPair::generate();
        let mut credential = genesis(&space);
        credential.issuer = PublicKey::random();
        assert!(credential.verify().is_err());
    }

    #[test]
    fn test_survives_json_and_cbor() {
        let space = KeyPair::generate();
        let credential = genesis(&space);

        let json = serde_json::to_string(&credential).unwrap();
        let from_json: Credential = serde_json::from_str(&json).unwrap();
        assert!(from_json.verify().is_ok());

        let cbor = crate::codec::encode(&credential).unwrap();
        let from_cbor: Credential = crate::codec::decode(&cbor).unwrap();
        assert_eq!(from_cbor, credential);
        assert!(from_cbor.verify().is_ok());
    }
}
