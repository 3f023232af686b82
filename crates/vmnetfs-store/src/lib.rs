//! On-disk chunk storage: a read-through pristine cache and a
//! copy-on-write modified overlay.

mod error;
mod modified;
mod pristine;

pub use error::{StoreError, StoreResult};
pub use modified::ModifiedStore;
pub use pristine::PristineStore;
