//! Persistent client state: identity, friends and progress marks

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use dp5_core::{Epoch, KeyPair, PublicKey, Track};

use crate::error::Result;

/// Long-term key pairs, one per track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub standard: KeyPair,
    pub combined: KeyPair,
}

impl Identity {
    pub fn key(&self, track: Track) -> &KeyPair {
        match track {
            Track::Standard => &self.standard,
            Track::Combined => &self.combined,
        }
    }
}

/// What the client knows about one friend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRecord {
    pub key: PublicKey,
    #[serde(default)]
    pub nick: Option<String>,
    /// Combined-track identifier learned from the last standard lookup
    #[serde(default)]
    pub combined_id: Option<PublicKey>,
    #[serde(default)]
    pub combined_id_epoch: Option<Epoch>,
    /// Last combined epoch the friend was seen online
    #[serde(default)]
    pub last_online: Option<Epoch>,
    /// Presence payload from that epoch
    #[serde(default, with = "opt_hex")]
    pub data: Option<Vec<u8>>,
}

impl FriendRecord {
    pub fn new(key: PublicKey, nick: Option<String>) -> Self {
        Self {
            key,
            nick,
            combined_id: None,
            combined_id_epoch: None,
            last_online: None,
            data: None,
        }
    }

    /// Online in combined epoch `epoch`
    pub fn is_online_at(&self, epoch: Epoch) -> bool {
        self.last_online == Some(epoch)
    }
}

/// Friends plus the last epoch each sub-protocol completed for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(with = "friend_list")]
    friends: BTreeMap<PublicKey, FriendRecord>,
    /// Payload published on the combined track
    #[serde(with = "hex")]
    pub data: Vec<u8>,
    pub last_register_epoch: Option<Epoch>,
    pub last_combined_register_epoch: Option<Epoch>,
    pub last_metadata_epoch: Option<Epoch>,
    pub last_lookup_epoch: Option<Epoch>,
    pub last_combined_metadata_epoch: Option<Epoch>,
    pub last_combined_lookup_epoch: Option<Epoch>,
}

impl ClientState {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn friend(&self, key: &PublicKey) -> Option<&FriendRecord> {
        self.friends.get(key)
    }

    pub(crate) fn friend_mut(&mut self, key: &PublicKey) -> Option<&mut FriendRecord> {
        self.friends.get_mut(key)
    }

    pub fn friends(&self) -> impl Iterator<Item = &FriendRecord> {
        self.friends.values()
    }

    pub fn num_friends(&self) -> usize {
        self.friends.len()
    }

    /// Add a friend, or remove one with `nick == None`. Returns whether
    /// the friend list changed.
    pub fn set_friend(&mut self, key: PublicKey, nick: Option<String>) -> bool {
        match nick {
            Some(nick) => match self.friends.get_mut(&key) {
                Some(existing) => {
                    let changed = existing.nick.as_deref() != Some(nick.as_str());
                    existing.nick = Some(nick);
                    changed
                }
                None => {
                    self.friends
                        .insert(key.clone(), FriendRecord::new(key, Some(nick)));
                    true
                }
            },
            None => self.friends.remove(&key).is_some(),
        }
    }

    /// Friends seen online in combined epoch `epoch`
    pub fn online_friends(&self, epoch: Epoch) -> impl Iterator<Item = &FriendRecord> {
        self.friends.values().filter(move |f| f.is_online_at(epoch))
    }

    pub(crate) fn last_metadata_mut(&mut self, track: Track) -> &mut Option<Epoch> {
        match track {
            Track::Standard => &mut self.last_metadata_epoch,
            Track::Combined => &mut self.last_combined_metadata_epoch,
        }
    }

    pub(crate) fn last_lookup_mut(&mut self, track: Track) -> &mut Option<Epoch> {
        match track {
            Track::Standard => &mut self.last_lookup_epoch,
            Track::Combined => &mut self.last_combined_lookup_epoch,
        }
    }

    pub(crate) fn last_register_mut(&mut self, track: Track) -> &mut Option<Epoch> {
        match track {
            Track::Standard => &mut self.last_register_epoch,
            Track::Combined => &mut self.last_combined_register_epoch,
        }
    }
}

/// Everything needed to resume a client after restart
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub identity: Identity,
    pub state: ClientState,
}

impl ClientSnapshot {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically through a temp file in the same directory
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

mod friend_list {
    use super::FriendRecord;
    use dp5_core::PublicKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        friends: &BTreeMap<PublicKey, FriendRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&FriendRecord> = friends.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PublicKey, FriendRecord>, D::Error> {
        let list = Vec::<FriendRecord>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|f| (f.key.clone(), f)).collect())
    }
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(byte: u8) -> PublicKey {
        PublicKey::from_bytes(vec![byte; 4])
    }

    #[test]
    fn test_set_friend_add_rename_remove() {
        let mut state = ClientState::default();
        assert!(state.set_friend(key(1), Some("alice".into())));
        assert!(!state.set_friend(key(1), Some("alice".into())));
        assert!(state.set_friend(key(1), Some("al".into())));
        assert_eq!(state.num_friends(), 1);
        assert_eq!(state.friend(&key(1)).unwrap().nick.as_deref(), Some("al"));

        assert!(state.set_friend(key(1), None));
        assert!(!state.set_friend(key(1), None));
        assert_eq!(state.num_friends(), 0);
    }

    #[test]
    fn test_rename_keeps_learned_fields() {
        let mut state = ClientState::default();
        state.set_friend(key(1), Some("alice".into()));
        state.friend_mut(&key(1)).unwrap().combined_id = Some(key(9));
        state.set_friend(key(1), Some("alice2".into()));
        assert_eq!(state.friend(&key(1)).unwrap().combined_id, Some(key(9)));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("client.json");

        let mut state = ClientState::new(vec![7; 16]);
        state.set_friend(key(1), Some("alice".into()));
        {
            let friend = state.friend_mut(&key(1)).unwrap();
            friend.last_online = Some(12);
            friend.data = Some(vec![0xaa, 0xbb]);
        }
        state.last_lookup_epoch = Some(3);

        let snapshot = ClientSnapshot {
            identity: Identity {
                standard: KeyPair::new(vec![1; 4], key(2)),
                combined: KeyPair::new(vec![3; 4], key(4)),
            },
            state: state.clone(),
        };
        snapshot.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"aabb\""));

        let loaded = ClientSnapshot::load(&path).unwrap();
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.identity.combined.public(), &key(4));
        assert_eq!(loaded.identity.standard.secret_bytes(), &[1; 4]);
    }

    #[test]
    fn test_online_friends() {
        let mut state = ClientState::default();
        state.set_friend(key(1), Some("a".into()));
        state.set_friend(key(2), Some("b".into()));
        state.friend_mut(&key(2)).unwrap().last_online = Some(5);

        let online: Vec<_> = state.online_friends(5).map(|f| f.key.clone()).collect();
        assert_eq!(online, vec![key(2)]);
        assert_eq!(state.online_friends(6).count(), 0);
    }
}
