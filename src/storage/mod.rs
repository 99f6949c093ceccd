pub mod workspace;

pub use workspace::{list_keys, normalize_key, PaperWorkspace};
