pub mod descriptor;
pub mod tool;

pub use descriptor::{DescriptorDoc, Section};
pub use tool::{ExternalToolConfig, PathsConfig, TimeoutsConfig, ToolConfig};
