mod loader;
mod types;

pub use loader::{load_from_path, parse_positionals};
pub use types::{CipherConfig, Config, Mode, ModeKind, PathSpec};
