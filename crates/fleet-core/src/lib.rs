//! fleet-core: shared vocabulary for the plugin fleet services.
//!
//! Holds the `project.yaml` manifest schema, the port range grammar,
//! OS/architecture/category enums, and the `fleet.toml` settings file.

pub mod config;
pub mod manifest;
pub mod port_range;
pub mod types;

pub use config::{InstallPaths, ProbeSettings, Settings};
pub use manifest::{
    ControlCommands, MANIFEST_FILE, Manifest, ManifestError, TemplateSpec, is_contained_relative,
    is_single_segment,
};
pub use port_range::{format_port_ranges, parse_port_range, PortRange, PortRangeError};
pub use types::*;
