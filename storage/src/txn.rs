//! Transaction handle as seen by page level operations.

/// Type representing transaction id, should be used instead of bare `u32`.
pub type TxnId = u32;

/// Handle of an active transaction.
///
/// The transaction manager owns the lifecycle; page operations only read the flags below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    id: TxnId,
    /// Set when the transaction performs transactional bulk loading. Pages it allocates beyond
    /// the file's extension watermark are discarded by truncation on abort.
    bulk_load: bool,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            bulk_load: false,
        }
    }

    /// Creates a transaction performing transactional bulk loading.
    pub fn bulk_load(id: TxnId) -> Self {
        Self {
            id,
            bulk_load: true,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn is_bulk_load(&self) -> bool {
        self.bulk_load
    }
}
