//! Spec file handling: YAML with the custom `!Job`/`!JobGroup`/`!JobArray`
//! node tags and the `!Cores`/`!Memory`/`!License` resource tags.

pub mod expand;
pub mod parse;
pub mod write;

pub use expand::expand_vars;
pub use parse::{parse_file, parse_str};
pub use write::to_yaml;
