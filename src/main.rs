use std::path::PathBuf;

use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;
use pulsec::{
    AssertMode, CompileOptions,
    backend::layout,
    frontend::{SourceFile, SourceFileOrigin},
    project::ProjectDescriptor,
};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Project descriptor (JSON) naming the title, sources, and per-mode
    /// archetype lists
    project: PathBuf,

    /// Directory for the generated artifacts
    #[arg(long, short, default_value = "build")]
    output: PathBuf,

    /// How source-level assertions lower into the graph
    #[arg(long, value_enum, default_value = "halt")]
    asserts: AssertMode,

    /// A previously published stream manifest to check layout compatibility
    /// against
    #[arg(long)]
    published_streams: Option<PathBuf>,

    /// Pretty-print the emitted JSON artifacts
    #[arg(long)]
    pretty: bool,
}

fn main() {
    let args = Args::parse();

    if !args.project.is_file() {
        Args::command()
            .error(
                ErrorKind::InvalidValue,
                format!("Project file '{}' does not exist!", args.project.display()),
            )
            .exit()
    }

    let project_text = std::fs::read_to_string(&args.project)
        .expect("Failed to read project file (or invalid UTF-8)");

    let project = match ProjectDescriptor::parse(&project_text) {
        Ok(project) => project,
        Err(diagnostic) => {
            eprintln!("{}", diagnostic.message.red().bold());
            std::process::exit(1);
        }
    };

    let plans = match project.mode_plans() {
        Ok(plans) => plans,
        Err(diagnostic) => {
            eprintln!("{}", diagnostic.message.red().bold());
            std::process::exit(1);
        }
    };

    let project_dir = args
        .project
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    /* Read in source files */

    let source_files = project
        .sources
        .iter()
        .map(|path| {
            let path = project_dir.join(path);
            let contents = std::fs::read_to_string(&path)
                .expect("Failed to read input file (or invalid UTF-8)");

            SourceFile {
                contents,
                origin: SourceFileOrigin::File(path),
            }
        })
        .collect::<Vec<_>>();

    let options = CompileOptions {
        asserts: args.asserts,
    };

    let compilation = pulsec::compile(source_files, &plans, &options, &project.level);

    for diagnostic in compilation.diagnostics.iter() {
        eprintln!("{}", diagnostic.render(&compilation.sources));
    }

    /* Stream compatibility against the published manifest */

    let mut stream_error = false;

    if let (Some(path), Some(current)) = (&args.published_streams, &compilation.stream_manifest) {
        let published = std::fs::read_to_string(path)
            .expect("Failed to read published stream manifest");

        match serde_json::from_str::<layout::StreamManifest>(&published) {
            Ok(published) => {
                if let Err(diagnostic) = layout::check_stream_compatibility(&published, current) {
                    eprintln!("{}", diagnostic.render(&compilation.sources));
                    stream_error = true;
                }
            }
            Err(error) => {
                eprintln!(
                    "{}: published stream manifest is not valid JSON: {error}",
                    "error".red().bold()
                );
                stream_error = true;
            }
        }
    }

    if !compilation.succeeded() || stream_error {
        let count = compilation.diagnostics.error_count() + stream_error as usize;
        eprintln!(
            "{} `{}` with {count} error(s)",
            "failed to compile".red().bold(),
            project.title
        );
        std::process::exit(1);
    }

    /* Write artifacts */

    std::fs::create_dir_all(&args.output).expect("Failed to create output directory");

    for unit in &compilation.units {
        let artifact = serde_json::json!({
            "mode": unit.mode.to_string(),
            "entries": unit.entries,
            "layout": unit.layout,
            "nodes": unit.nodes,
        });

        write_json(
            &args.output.join(format!("{}.json", unit.mode)),
            &artifact,
            args.pretty,
        );
    }

    if let Some(schema) = &compilation.schema {
        write_json(&args.output.join("schema.json"), schema, args.pretty);
    }

    if let Some(manifest) = &compilation.stream_manifest {
        let value = serde_json::to_value(manifest).expect("manifest serializes");
        write_json(&args.output.join("streams.json"), &value, args.pretty);
    }

    println!(
        "{} `{}`: {} mode(s), {} node table entries",
        "compiled".green().bold(),
        project.title,
        compilation.units.len(),
        compilation
            .units
            .iter()
            .map(|u| u.nodes.len())
            .sum::<usize>()
    );
}

fn write_json(path: &PathBuf, value: &serde_json::Value, pretty: bool) {
    let text = if pretty {
        serde_json::to_string_pretty(value).expect("artifact serializes")
    } else {
        serde_json::to_string(value).expect("artifact serializes")
    };

    std::fs::write(path, text).expect("Failed to write artifact");
}
