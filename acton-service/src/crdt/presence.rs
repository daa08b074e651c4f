//! Presence/awareness registry and its wire encoding.
//!
//! The AWARENESS payload format is pinned precisely: `[varuint count,
//! (varuint clientId, varuint clock, varstring state)*]`. That's the
//! y-protocols awareness wire format, encoded here directly with a small
//! LEB128 varint codec rather than through CRDT-library internals, since
//! presence is its own update encode/apply contract, separate from
//! document sync, and the exact bytes matter, not just the behaviour.

use std::collections::HashMap;

/// One client's last-known presence state.
#[derive(Debug, Clone)]
struct PresenceEntry {
    clock: u64,
    state: Vec<u8>,
}

/// Registry of opaque client-id -> opaque state, with an update feed
/// produced by every apply.
#[derive(Debug, Default)]
pub struct Presence {
    clients: HashMap<u32, PresenceEntry>,
}

/// One decoded `(clientId, clock, state)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub client_id: u32,
    pub clock: u64,
    pub state: Vec<u8>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Apply a decoded update, keeping the newer clock per client-id
    /// (monotonic, matching CRDT last-writer-wins semantics). Returns the
    /// changes actually applied (clock advanced), to re-encode for
    /// broadcast.
    pub fn apply(&mut self, changes: &[PresenceChange]) -> Vec<PresenceChange> {
        let mut applied = Vec::with_capacity(changes.len());
        for change in changes {
            let should_apply = match self.clients.get(&change.client_id) {
                Some(existing) => change.clock >= existing.clock,
                None => true,
            };
            if should_apply {
                self.clients.insert(
                    change.client_id,
                    PresenceEntry {
                        clock: change.clock,
                        state: change.state.clone(),
                    },
                );
                applied.push(change.clone());
            }
        }
        applied
    }

    /// Remove a set of client-ids (used on socket disconnect), bumping
    /// their clock so the removal encodes as a change with an empty state
    /// (the y-protocols convention for "client gone").
    pub fn remove(&mut self, client_ids: &[u32]) -> Vec<PresenceChange> {
        let mut removed = Vec::with_capacity(client_ids.len());
        for &id in client_ids {
            let clock = self
                .clients
                .remove(&id)
                .map(|e| e.clock + 1)
                .unwrap_or(1);
            removed.push(PresenceChange {
                client_id: id,
                clock,
                state: Vec::new(),
            });
        }
        removed
    }

    /// Encode the full current state of every present client (sent to a
    /// newly attached socket).
    pub fn encode_full(&self) -> Vec<u8> {
        let changes: Vec<PresenceChange> = self
            .clients
            .iter()
            .map(|(&client_id, entry)| PresenceChange {
                client_id,
                clock: entry.clock,
                state: entry.state.clone(),
            })
            .collect();
        encode(&changes)
    }
}

pub fn encode(changes: &[PresenceChange]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_varuint(&mut buf, changes.len() as u64);
    for change in changes {
        write_varuint(&mut buf, change.client_id as u64);
        write_varuint(&mut buf, change.clock);
        write_varstring(&mut buf, &change.state);
    }
    buf
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated awareness frame")]
    Truncated,
    #[error("client id out of range")]
    ClientIdOutOfRange,
    #[error("state is not valid utf-8")]
    InvalidUtf8,
}

pub fn decode(bytes: &[u8]) -> Result<Vec<PresenceChange>, DecodeError> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_varuint()?;
    let mut changes = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        let client_id = cursor.read_varuint()?;
        let client_id: u32 = client_id
            .try_into()
            .map_err(|_| DecodeError::ClientIdOutOfRange)?;
        let clock = cursor.read_varuint()?;
        let state = cursor.read_varstring()?;
        changes.push(PresenceChange {
            client_id,
            clock,
            state,
        });
    }
    Ok(changes)
}

fn write_varuint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        } else {
            buf.push(byte | 0x80);
        }
    }
}

fn write_varstring(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varuint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_varuint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            if shift >= 64 {
                return Err(DecodeError::Truncated);
            }
            let byte = *self.bytes.get(self.pos).ok_or(DecodeError::Truncated)?;
            self.pos += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_varstring(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varuint()? as usize;
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(slice.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let changes = vec![
            PresenceChange {
                client_id: 7,
                clock: 3,
                state: b"cursor:42".to_vec(),
            },
            PresenceChange {
                client_id: 900000,
                clock: 1,
                state: Vec::new(),
            },
        ];
        let bytes = encode(&changes);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, changes);
    }

    #[test]
    fn apply_keeps_monotonic_clock() {
        let mut presence = Presence::new();
        presence.apply(&[PresenceChange {
            client_id: 1,
            clock: 5,
            state: b"a".to_vec(),
        }]);
        let applied = presence.apply(&[PresenceChange {
            client_id: 1,
            clock: 4,
            state: b"stale".to_vec(),
        }]);
        assert!(applied.is_empty());
        assert!(!presence.is_empty());
    }

    #[test]
    fn remove_clears_claimed_clients() {
        let mut presence = Presence::new();
        presence.apply(&[PresenceChange {
            client_id: 7,
            clock: 1,
            state: b"x".to_vec(),
        }]);
        let removed = presence.remove(&[7]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].state, Vec::<u8>::new());
        assert!(presence.is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(decode(&[2]).is_err());
    }

    #[test]
    fn overlong_varuint_is_rejected_instead_of_panicking() {
        let bytes = [0x80u8; 11];
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated)));
    }

    #[test]
    fn varstring_length_overflow_is_rejected_instead_of_panicking() {
        let mut bytes = vec![1u8, 0]; // count=1, clientId=0
        bytes.push(0); // clock=0
        bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f]); // varstring len = u64::MAX
        assert!(matches!(decode(&bytes), Err(DecodeError::Truncated)));
    }
}
