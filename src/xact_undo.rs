//! Callback interface invoked once a transaction-owned record set's last
//! chunk close becomes durable (both straddling-page overwrites applied),
//! so the transaction manager can drop its reference to the set. Grounded
//! in the teacher's `transaction::manager` style of registering an
//! observer instead of having callers poll state.

use crate::chunk_table::UrsHandle;

pub trait XactUndoSink: Send {
    fn on_set_closed(&mut self, tnx_id: u64, handle: UrsHandle);
}

/// Test double recording every callback invocation in order.
#[derive(Default)]
pub struct RecordingXactUndoSink {
    pub calls: Vec<(u64, UrsHandle)>,
}

impl XactUndoSink for RecordingXactUndoSink {
    fn on_set_closed(&mut self, tnx_id: u64, handle: UrsHandle) {
        self.calls.push((tnx_id, handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let mut sink = RecordingXactUndoSink::default();
        sink.on_set_closed(1, 10);
        sink.on_set_closed(1, 11);
        assert_eq!(sink.calls, vec![(1, 10), (1, 11)]);
    }
}
