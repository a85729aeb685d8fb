//! Migration definitions: discovery, raw loading and parsing into steps.

mod loader;
mod parser;
mod types;

pub use loader::{FilesystemLoader, Loader, LoaderError};
pub use parser::{DefinitionParser, JsonDefinitionParser, YamlDefinitionParser};
pub use types::{DefinitionStatus, MigrationDefinition, MigrationStep};
