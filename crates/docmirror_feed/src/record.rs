//! Source log records and positions.

/// A transaction id. Monotonically increasing; embeds a commit timestamp
/// (see [`crate::tid`]). `-1` means "before everything".
pub type Tid = i64;

/// The tid before the first transaction.
pub const NO_TID: Tid = -1;

/// Upper bound used when a scan has no end tid.
pub const MAX_TID: Tid = 1 << 62;

/// One object revision read from the source log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Transaction that wrote this revision.
    pub tid: Tid,
    /// Object id.
    pub object_id: u64,
    /// Serialized object; empty for a deleted object.
    pub raw: Vec<u8>,
}

impl Record {
    /// Creates a record.
    pub fn new(tid: Tid, object_id: u64, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            tid,
            object_id,
            raw: raw.into(),
        }
    }
}

/// A read position in the source log, ordered by `(tid, object_id)`.
///
/// With `object_id: None` the position lies after every record of `tid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    /// Transaction id.
    pub tid: Tid,
    /// Last object read within `tid`, if the transaction was read partway.
    pub object_id: Option<u64>,
}

impl LogPosition {
    /// The position after all records of `tid`.
    pub fn after_tid(tid: Tid) -> Self {
        Self {
            tid,
            object_id: None,
        }
    }

    /// The position just after `record`.
    pub fn after_record(record: &Record) -> Self {
        Self {
            tid: record.tid,
            object_id: Some(record.object_id),
        }
    }

    /// Returns true if `record` lies after this position.
    pub fn precedes(&self, record: &Record) -> bool {
        record.tid > self.tid
            || (record.tid == self.tid && self.object_id.is_some_and(|oid| record.object_id > oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_tid_then_object() {
        let r = Record::new(5, 10, vec![]);
        assert!(LogPosition::after_tid(4).precedes(&r));
        assert!(!LogPosition::after_tid(5).precedes(&r));
        assert!(LogPosition {
            tid: 5,
            object_id: Some(9)
        }
        .precedes(&r));
        assert!(!LogPosition::after_record(&r).precedes(&r));
    }
}
