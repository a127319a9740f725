//! The `UndoRecordSet` itself: a handle, its type/persistence, and a small
//! tagged-enum state machine instead of the boolean flags the spec's prose
//! describes, so an illegal transition (inserting into a set that's
//! already closed, closing one twice) is a `panic!` at the call site that
//! tried it rather than silently-wrong bytes on disk.

use crate::chunk_table::UrsHandle;
use crate::types::{Persistence, UndoRecordSetType, Urp};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UrsState {
    /// Created in memory; no insert has happened yet, so there is no
    /// chunk to lose. `destroy` on a `Clean` set is legal.
    Clean,
    /// At least one insert has landed (the set's first chunk header has
    /// been written). `destroy` on a `Dirty` set is fatal: it would drop
    /// undo data no one closed out.
    Dirty,
    /// Its chunk has been closed; no further inserts are possible.
    Closed,
}

pub struct Urs {
    pub handle: UrsHandle,
    pub r#type: UndoRecordSetType,
    pub persistence: Persistence,
    pub nesting_level: u32,
    pub type_header: Vec<u8>,
    pub chunk_start: Urp,
    state: UrsState,
}

impl Urs {
    pub fn new(
        handle: UrsHandle,
        r#type: UndoRecordSetType,
        persistence: Persistence,
        nesting_level: u32,
        type_header: Vec<u8>,
        chunk_start: Urp,
    ) -> Self {
        Urs {
            handle,
            r#type,
            persistence,
            nesting_level,
            type_header,
            chunk_start,
            state: UrsState::Clean,
        }
    }

    pub fn state(&self) -> UrsState {
        self.state
    }

    /// The set's first insert just landed (its chunk now exists, at least
    /// in memory). Called once, the first time `commit_insert` opens this
    /// set's chunk.
    pub fn mark_dirty(&mut self) {
        assert_eq!(
            self.state,
            UrsState::Clean,
            "mark_dirty called on a set that isn't Clean (handle {})",
            self.handle
        );
        self.state = UrsState::Dirty;
    }

    pub fn mark_closed(&mut self) {
        assert!(
            self.state == UrsState::Dirty || self.state == UrsState::Clean,
            "mark_closed called twice on set {}",
            self.handle
        );
        self.state = UrsState::Closed;
    }

    pub fn can_insert(&self) -> bool {
        matches!(self.state, UrsState::Dirty | UrsState::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut urs = Urs::new(1, UndoRecordSetType::Transaction, Persistence::Permanent, 0, vec![0; 8], Urp::new(0, 0));
        assert_eq!(urs.state(), UrsState::Clean);
        assert!(urs.can_insert());
        urs.mark_dirty();
        assert_eq!(urs.state(), UrsState::Dirty);
        urs.mark_closed();
        assert_eq!(urs.state(), UrsState::Closed);
        assert!(!urs.can_insert());
    }

    #[test]
    #[should_panic(expected = "mark_dirty called")]
    fn mark_dirty_twice_panics() {
        let mut urs = Urs::new(1, UndoRecordSetType::Transaction, Persistence::Permanent, 0, vec![0; 8], Urp::new(0, 0));
        urs.mark_dirty();
        urs.mark_dirty();
    }

    #[test]
    #[should_panic(expected = "mark_closed called twice")]
    fn mark_closed_twice_panics() {
        let mut urs = Urs::new(1, UndoRecordSetType::Transaction, Persistence::Permanent, 0, vec![0; 8], Urp::new(0, 0));
        urs.mark_closed();
        urs.mark_closed();
    }
}
