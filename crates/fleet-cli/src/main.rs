use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleet_core::Settings;
use fleet_pack::Publisher;
use fleet_state::StateStore;

mod commands;

#[derive(Parser)]
#[command(
    name = "fleet",
    about = "Fleet: plugin package pipeline and access point checks",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Settings file (TOML). Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and record a package from a plugin source directory.
    ///
    /// The directory must hold a `project.yaml` at its root.
    Publish {
        /// Plugin source directory
        path: PathBuf,
        #[arg(long, default_value = "linux")]
        os: String,
        #[arg(long, default_value = "x86_64")]
        arch: String,
        /// Package as a third-party plugin (`external_plugins/<project>`)
        #[arg(long)]
        external: bool,
        /// Import config templates declared by the manifest
        #[arg(long)]
        load_templates: bool,
        /// Replace existing templates of the same name and version
        #[arg(long)]
        overwrite: bool,
    },
    /// Register an uploaded bundle and publish every plugin in it.
    Import {
        /// Bundle file (`.tgz`)
        file: PathBuf,
        /// Keep the original file in place
        #[arg(long)]
        copy: bool,
        #[arg(long, default_value = "admin")]
        creator: String,
        #[arg(long)]
        load_templates: bool,
        #[arg(long)]
        overwrite: bool,
    },
    /// Release packages whose checksums match the given set.
    Release {
        /// Expected package checksum (repeat for each package)
        #[arg(long = "checksum", required = true)]
        checksums: Vec<String>,
        /// Package id (repeatable). Takes precedence over the query flags.
        #[arg(long = "id")]
        ids: Vec<u64>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        os: Option<String>,
        #[arg(long)]
        arch: Option<String>,
    },
    /// Bundle every released package of a project version.
    Export {
        #[arg(long)]
        project: String,
        #[arg(long)]
        version: String,
        #[arg(long, default_value = "admin")]
        creator: String,
    },
    /// List recorded packages.
    List {
        #[arg(long)]
        project: Option<String>,
        /// Only released packages
        #[arg(long)]
        released: bool,
    },
    /// Check an access point described by a JSON file.
    ApTest {
        /// Access point definition (JSON)
        file: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    let settings = Arc::new(settings);

    if let Commands::ApTest { file } = &cli.command {
        return commands::access_point::check(&settings, file);
    }

    let store = StateStore::open(&settings.db_path())?;
    let publisher = Publisher::new(store, Arc::clone(&settings));

    match cli.command {
        Commands::Publish {
            path,
            os,
            arch,
            external,
            load_templates,
            overwrite,
        } => commands::package::publish(
            &publisher,
            &path,
            commands::package::Platform::parse(&os, &arch)?,
            external,
            load_templates,
            overwrite,
        ),
        Commands::Import {
            file,
            copy,
            creator,
            load_templates,
            overwrite,
        } => commands::bundle::import(&publisher, &file, copy, &creator, load_templates, overwrite),
        Commands::Release {
            checksums,
            ids,
            project,
            version,
            os,
            arch,
        } => {
            let target = commands::package::release_target(ids, project, version, os, arch)?;
            commands::package::release(publisher.store(), &checksums, &target)
        }
        Commands::Export {
            project,
            version,
            creator,
        } => commands::bundle::export(&publisher, &project, &version, &creator),
        Commands::List { project, released } => {
            commands::package::list(publisher.store(), project.as_deref(), released)
        }
        Commands::ApTest { .. } => Ok(()),
    }
}
