//! TTL-bound group-chat announcement storage.
//!
//! Announcements advertise the existence of a group chat at a numeric group
//! id. They are stored per-id (newest wins), expire locally after their TTL,
//! and travel in a fixed big-endian layout:
//!
//! `group_id(u32 BE) | name_len(u32 BE) | chat_type(u8) | privacy(u8) |
//!  timestamp_unix(u64 BE) | name_bytes[name_len]`
//!
//! TTL is never serialized; receivers apply their configured default.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::dht::error::DhtError;
use crate::dht::types::MAX_GROUP_NAME_LEN;
use crate::time::Clock;

/// Fixed-size prefix of a serialized announcement.
pub const ANNOUNCEMENT_HEADER_SIZE: usize = 18;

/// One advertised group chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAnnouncement {
    pub group_id: u32,
    pub name: String,
    pub chat_type: u8,
    pub privacy: u8,
    /// Creation time, epoch seconds.
    pub timestamp: u64,
    /// Local lifetime; not part of the wire format.
    pub ttl_secs: u64,
}

impl GroupAnnouncement {
    /// Live iff less than `ttl_secs` has passed since `timestamp`.
    pub fn is_live(&self, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.timestamp) < self.ttl_secs
    }

    pub fn serialize(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(ANNOUNCEMENT_HEADER_SIZE + name_bytes.len());
        out.extend_from_slice(&self.group_id.to_be_bytes());
        out.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
        out.push(self.chat_type);
        out.push(self.privacy);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(name_bytes);
        out
    }

    /// Parse wire bytes, applying `default_ttl_secs` as the local lifetime.
    pub fn deserialize(buf: &[u8], default_ttl_secs: u64) -> Result<Self, DhtError> {
        if buf.len() < ANNOUNCEMENT_HEADER_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: buf.len(),
                need: ANNOUNCEMENT_HEADER_SIZE,
            });
        }
        let group_id = u32::from_be_bytes(buf[0..4].try_into().expect("4-byte slice"));
        let name_len = u32::from_be_bytes(buf[4..8].try_into().expect("4-byte slice")) as usize;
        if name_len > MAX_GROUP_NAME_LEN {
            return Err(DhtError::InvalidAnnouncement(format!(
                "name length {name_len} exceeds {MAX_GROUP_NAME_LEN}"
            )));
        }
        if buf.len() < ANNOUNCEMENT_HEADER_SIZE + name_len {
            return Err(DhtError::TruncatedPacket {
                got: buf.len(),
                need: ANNOUNCEMENT_HEADER_SIZE + name_len,
            });
        }
        let chat_type = buf[8];
        let privacy = buf[9];
        let timestamp = u64::from_be_bytes(buf[10..18].try_into().expect("8-byte slice"));
        let name = std::str::from_utf8(&buf[18..18 + name_len])
            .map_err(|e| DhtError::InvalidAnnouncement(format!("name not UTF-8: {e}")))?
            .to_string();

        Ok(Self { group_id, name, chat_type, privacy, timestamp, ttl_secs: default_ttl_secs })
    }
}

/// Callback invoked with announcements learned from query responses.
pub type ResponseCallback = Box<dyn Fn(&GroupAnnouncement) + Send + Sync>;

/// Announcement cache plus the response-notification seam.
///
/// Both locks are leaves: nothing else is locked while they are held, and
/// the registered callback runs outside the map lock.
pub struct GroupStorage {
    map: Mutex<HashMap<u32, GroupAnnouncement>>,
    callback: Mutex<Option<ResponseCallback>>,
    clock: Clock,
    default_ttl_secs: u64,
}

impl GroupStorage {
    pub fn new(clock: Clock, default_ttl_secs: u64) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            clock,
            default_ttl_secs,
        }
    }

    pub fn default_ttl_secs(&self) -> u64 {
        self.default_ttl_secs
    }

    /// Upsert by group id.
    pub fn store(&self, announcement: GroupAnnouncement) {
        self.map
            .lock()
            .expect("group map lock poisoned")
            .insert(announcement.group_id, announcement);
    }

    /// Live announcement for this id, if any. Expired entries read as absent
    /// (removal is `clean_expired`'s job).
    pub fn get(&self, group_id: u32) -> Option<GroupAnnouncement> {
        let now = self.clock.now_secs();
        self.map
            .lock()
            .expect("group map lock poisoned")
            .get(&group_id)
            .filter(|a| a.is_live(now))
            .cloned()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn clean_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let mut map = self.map.lock().expect("group map lock poisoned");
        let before = map.len();
        map.retain(|_, a| a.is_live(now));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("group map lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register the single response callback, replacing any previous one.
    pub fn set_response_callback(&self, cb: ResponseCallback) {
        *self.callback.lock().expect("group callback lock poisoned") = Some(cb);
    }

    /// Invoke the registered callback with an announcement learned from a
    /// query response. No-op when none is registered.
    pub fn notify_response(&self, announcement: &GroupAnnouncement) {
        let cb = self.callback.lock().expect("group callback lock poisoned");
        if let Some(cb) = cb.as_ref() {
            cb(announcement);
        }
    }
}
