//! fleet-pack: turning plugin source directories into published packages.
//!
//! Publishing builds a `.tgz` per platform and records it as ready; the
//! release gate flips packages to released only when the caller's
//! checksums match. Released packages can be exported as one bundle, and
//! uploaded bundles can be imported back through [`upload::import_upload`].
//! All archive reads of untrusted input go through [`extract::safe_extract`].

pub mod archive;
pub mod error;
pub mod export;
pub mod extract;
pub mod locks;
pub mod publish;
pub mod release;
pub mod templates;
pub mod upload;

pub use error::{ErrorKind, PackError, PackResult};
pub use export::{create_export_job, download_key, execute_export_job, export_plugins};
pub use extract::{safe_extract, unzip_package};
pub use publish::{PLUGIN_MODULE, PublishOptions, Publisher};
pub use release::release;
pub use templates::{create_config_instance, import_templates};
pub use upload::{ImportOptions, UploadRequest, import_upload, register_upload};
