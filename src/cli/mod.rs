//! CLI subcommands — generate, resources, provisioners.

use crate::core::error::Error;
use crate::core::generate::{self, GenerateConfig, OutputTarget};
use crate::core::parser;
use crate::core::resolver::DEFAULT_PARALLELISM;
use crate::core::state::{self, DEFAULT_STATE_DIR};
use crate::core::types::{OutputValue, StateStore};
use crate::provisioners::ProvisionerRegistry;
use clap::{Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve resources and write a compose manifest
    Generate {
        /// Score files to load
        #[arg(default_value = "score.yaml")]
        files: Vec<PathBuf>,

        /// Output manifest (`-` for stdout)
        #[arg(short, long, default_value = "compose.yaml")]
        output: String,

        /// State directory
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,

        /// Additional provisioner file (repeatable, takes precedence)
        #[arg(long = "provisioners", value_name = "FILE")]
        provisioners: Vec<PathBuf>,

        /// Maximum resources provisioned at once
        #[arg(long, default_value_t = DEFAULT_PARALLELISM)]
        parallelism: usize,
    },

    /// Inspect resources recorded in state
    Resources {
        #[command(subcommand)]
        command: ResourcesCommand,
    },

    /// Inspect registered provisioners
    Provisioners {
        #[command(subcommand)]
        command: ProvisionersCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ResourcesCommand {
    /// List resources recorded in state
    List {
        /// State directory
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },

    /// Print the outputs of a resource
    GetOutputs {
        /// Resource id
        id: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,

        /// State directory
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProvisionersCommand {
    /// List provisioners in lookup order
    List {
        /// State directory
        #[arg(long, default_value = DEFAULT_STATE_DIR)]
        state_dir: PathBuf,

        /// Additional provisioner file (repeatable)
        #[arg(long = "provisioners", value_name = "FILE")]
        provisioners: Vec<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Yaml,
    Json,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), Error> {
    match cmd {
        Commands::Generate {
            files,
            output,
            state_dir,
            provisioners,
            parallelism,
        } => cmd_generate(&files, &output, &state_dir, &provisioners, parallelism),
        Commands::Resources { command } => match command {
            ResourcesCommand::List { state_dir } => cmd_resources_list(&state_dir),
            ResourcesCommand::GetOutputs {
                id,
                format,
                state_dir,
            } => cmd_get_outputs(&state_dir, &id, format),
        },
        Commands::Provisioners { command } => match command {
            ProvisionersCommand::List {
                state_dir,
                provisioners,
            } => cmd_provisioners_list(&state_dir, &provisioners),
        },
    }
}

/// Registry lookup order: `--provisioners` files, then the state directory's
/// `*.provisioners.yaml`, then the embedded defaults.
pub fn build_registry(state_dir: &Path, extra: &[PathBuf]) -> Result<ProvisionerRegistry, Error> {
    let mut registry = ProvisionerRegistry::new();
    for file in extra {
        registry.load_file(file)?;
    }
    registry.load_dir(state_dir)?;
    registry.register_defaults()?;
    Ok(registry)
}

fn cmd_generate(
    files: &[PathBuf],
    output: &str,
    state_dir: &Path,
    provisioners: &[PathBuf],
    parallelism: usize,
) -> Result<(), Error> {
    if parallelism == 0 {
        return Err(Error::Usage("--parallelism must be at least 1".to_string()));
    }
    let workloads = parser::load_workloads(files)?;
    let registry = build_registry(state_dir, provisioners)?;
    let target = OutputTarget::parse(output);

    let cfg = GenerateConfig {
        workloads: &workloads,
        registry: &registry,
        state_dir,
        output: target.clone(),
        parallelism,
        event_log: true,
    };
    let rt = tokio::runtime::Runtime::new().map_err(Error::Runtime)?;
    let report = rt.block_on(generate::generate(&cfg))?;

    // stdout may carry the manifest itself; the summary goes to stderr
    let destination = match &target {
        OutputTarget::File(path) => path.display().to_string(),
        OutputTarget::Stdout => "stdout".to_string(),
    };
    eprintln!(
        "Wrote {} with {} service(s): {} provisioned, {} reused ({:.2}s).",
        destination, report.services, report.provisioned, report.reused, report.duration_seconds
    );
    for id in &report.dropped {
        eprintln!("  Removed state for {}", id);
    }
    Ok(())
}

/// One line per resource: id, type, class, provisioner.
pub fn format_resource_list(state: &StateStore) -> String {
    let mut out = String::new();
    for (id, record) in &state.resources {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\n",
            id, record.resource_type, record.class, record.provisioner
        ));
    }
    out
}

fn cmd_resources_list(state_dir: &Path) -> Result<(), Error> {
    let state = state::load_state(state_dir)?;
    if state.is_empty() {
        println!("No resources in state. Run `score-ecs generate` first.");
        return Ok(());
    }
    print!("{}", format_resource_list(&state));
    Ok(())
}

/// Render a resource's outputs. Secrets render as `{secret: <ref>}`.
pub fn format_outputs(state: &StateStore, id: &str, format: OutputFormat) -> Result<String, Error> {
    let record = state
        .get(id)
        .ok_or_else(|| Error::Usage(format!("resource '{}' not found in state", id)))?;
    let outputs: indexmap::IndexMap<&str, serde_yaml_ng::Value> = record
        .outputs
        .iter()
        .map(|(k, v)| (k.as_str(), OutputValue::into_value(v.clone())))
        .collect();
    match format {
        OutputFormat::Yaml => {
            serde_yaml_ng::to_string(&outputs).map_err(|e| Error::Usage(e.to_string()))
        }
        OutputFormat::Json => serde_json::to_string_pretty(&outputs)
            .map(|s| s + "\n")
            .map_err(|e| Error::Usage(e.to_string())),
    }
}

fn cmd_get_outputs(state_dir: &Path, id: &str, format: OutputFormat) -> Result<(), Error> {
    let state = state::load_state(state_dir)?;
    print!("{}", format_outputs(&state, id, format)?);
    Ok(())
}

/// One line per provisioner in lookup order: uri, type, class (`*` = any)
/// and description when there is one.
pub fn format_provisioner_list(registry: &ProvisionerRegistry) -> String {
    let mut out = String::new();
    for p in registry.iter() {
        out.push_str(&format!(
            "{}\t{}\t{}",
            p.uri(),
            p.resource_type(),
            p.class().unwrap_or("*")
        ));
        if let Some(d) = p.description() {
            out.push('\t');
            out.push_str(d);
        }
        out.push('\n');
    }
    out
}

fn cmd_provisioners_list(state_dir: &Path, extra: &[PathBuf]) -> Result<(), Error> {
    let registry = build_registry(state_dir, extra)?;
    print!("{}", format_provisioner_list(&registry));
    Ok(())
}
