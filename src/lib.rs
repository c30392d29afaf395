// Latchkey - distributed sessions over conditional-write key-value stores
//
// This library provides session handler semantics (open, read, write, close,
// destroy, gc) with null, pessimistic and optimistic locking strategies.

// Re-export session functionality
pub use latchkey_session::*;

// Prelude for common imports
pub mod prelude {
    pub use latchkey_session::prelude::*;
    pub use latchkey_session::{GcReport, Lease, ReadOutcome, StoreError};
}
