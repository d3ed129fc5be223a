//! Feed entry payloads

use serde::{Deserialize, Serialize};

use super::{Seq, Timeframe};
use crate::credentials::Credential;
use crate::item::ItemMutation;
use crate::keys::PublicKey;

/// One entry of a feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    /// What the writer had observed across all feeds when writing.
    pub timeframe: Timeframe,
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Control feeds carry signed credentials.
    Credential(Credential),
    /// Data feeds carry object mutations.
    Data(DataMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub mutation: ItemMutation,
    /// Set by the authoring peer to match the optimistic write it confirms.
    #[serde(default)]
    pub client_tag: Option<String>,
}

impl FeedMessage {
    pub fn credential(timeframe: Timeframe, credential: Credential) -> Self {
        Self {
            timeframe,
            payload: Payload::Credential(credential),
        }
    }

    pub fn data(timeframe: Timeframe, mutation: ItemMutation, client_tag: Option<String>) -> Self {
        Self {
            timeframe,
            payload: Payload::Data(DataMessage {
                mutation,
                client_tag,
            }),
        }
    }
}

/// A feed entry together with its address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedBlock {
    pub feed_key: PublicKey,
    pub seq: Seq,
    pub message: FeedMessage,
}
