//! Transaction origin tagging.
//!
//! The spec requires every applied update to carry "the socket as the
//! transaction origin" so the update observer can exclude it from the
//! re-broadcast. `yrs::Origin` is an opaque byte string; `ConnOrigin` is our
//! thin wrapper around the numeric tag each connection is assigned on
//! attach (see `websocket::handler::ConnectionId::as_origin_tag`).

use yrs::Origin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnOrigin(u64);

/// Reserved tag for mutations the server itself makes outside any socket's
/// context (persistence gateway loads, REST-triggered doc edits). No live
/// connection is ever assigned tag 0 — `ConnectionId` tags start at 1.
pub const SYSTEM_ORIGIN: ConnOrigin = ConnOrigin::new(0);

impl ConnOrigin {
    pub const fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn tag(self) -> u64 {
        self.0
    }

    pub fn from_origin_ref(origin: &Origin) -> Option<Self> {
        let bytes = origin.as_ref();
        if bytes.len() == 8 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(bytes);
            Some(Self(u64::from_le_bytes(buf)))
        } else {
            None
        }
    }
}

impl From<ConnOrigin> for Origin {
    fn from(value: ConnOrigin) -> Self {
        Origin::from(value.0.to_le_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_yrs_origin() {
        let tagged = ConnOrigin::new(7);
        let origin: Origin = tagged.into();
        assert_eq!(ConnOrigin::from_origin_ref(&origin), Some(tagged));
    }
}
