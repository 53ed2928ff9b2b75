//! Error handling lives in `cairn-types`; this module keeps the
//! crate-local `crate::error::{CairnError, Result}` paths working.

pub use cairn_types::error::{CairnError, Result};
