//! Binary entry point for the `sparrow` query CLI.
#![forbid(unsafe_code)]

#[path = "cli/config.rs"]
mod config;
#[path = "cli/ui.rs"]
mod ui;

use std::error::Error;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use sparrow::query::PlannerOutput;
use sparrow::{
    EngineConfig, Quad, QueryContext, QueryEngine, QueryError, QueryKind, ResultHandle,
    SourceDescriptor, Term,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::CliConfig;
use ui::{format_duration, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "sparrow",
    version,
    about = "Query RDF files and SPARQL endpoints as one dataset",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "SPARROW_CONFIG",
        value_name = "FILE",
        help = "CLI config file (defaults to <config dir>/sparrow/cli.toml)"
    )]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Log engine activity to stderr (repeat for more detail)"
    )]
    verbose: u8,

    #[arg(long, global = true, help = "Suppress decorations and summaries")]
    quiet: bool,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto)]
    theme: Theme,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(
        value_name = "QUERY",
        help = "Query text, @FILE to read it from a file, or - for stdin"
    )]
    query: String,

    #[arg(
        short,
        long = "source",
        value_name = "SOURCE",
        help = "File path, mem:PATH, or http(s) endpoint URL (repeatable)"
    )]
    sources: Vec<String>,

    #[arg(long, value_name = "NAME", help = "Named source set from the config file")]
    source_set: Option<String>,

    #[arg(long, value_name = "MS", help = "Execution timeout in milliseconds")]
    timeout_ms: Option<u64>,

    #[arg(long, help = "Override the query's LIMIT")]
    limit: Option<usize>,

    #[arg(long, help = "Override the query's OFFSET")]
    offset: Option<usize>,

    #[arg(long, value_name = "ROWS", help = "Largest estimated hash join build side")]
    hash_join_budget: Option<usize>,

    #[arg(long, help = "Skip logical rewrites")]
    no_optimize: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Run a query and print its results")]
    Query {
        #[command(flatten)]
        args: QueryArgs,

        #[arg(long, value_enum, help = "Output format")]
        format: Option<OutputFormat>,
    },
    #[command(about = "Print the physical plan without executing it")]
    Explain {
        #[command(flatten)]
        args: QueryArgs,

        #[arg(long, help = "Replace constants in the plan with ?")]
        redact: bool,
    },
    #[command(about = "Inspect the CLI configuration")]
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    #[command(about = "Show the effective configuration and source sets")]
    Show,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Tsv,
    Json,
    Ntriples,
}

fn main() {
    if let Err(err) = run() {
        match err.downcast_ref::<QueryError>() {
            Some(query_err) => eprintln!("error[{}]: {query_err}", query_err.code()),
            None => eprintln!("error: {err}"),
        }
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = CliConfig::load(cli.config.clone())?;
    let ui = Ui::new(cli.theme, cli.quiet);

    match cli.command {
        Command::Query { args, format } => {
            let format = match format {
                Some(format) => format,
                None => config.format()?.unwrap_or(OutputFormat::Table),
            };
            let (engine, context) = prepare(&args, &config)?;
            let text = read_query(&args.query)?;
            let task = ui.task("planning query");
            let handle = engine.query(&text, &context)?;
            let elapsed = task.finish();
            debug!(elapsed = %format_duration(elapsed), "cli.query.planned");
            if cli.verbose > 0 {
                ui.info(&format!("plan ready in {}", format_duration(elapsed)));
            }
            write_results(handle, format, &ui)?;
        }
        Command::Explain { args, redact } => {
            let (engine, context) = prepare(&args, &config)?;
            let text = read_query(&args.query)?;
            let output = engine.explain(&text, &context)?;
            print_explain(&output, redact);
        }
        Command::Config {
            action: ConfigCommand::Show,
        } => show_config(&config, &ui)?,
        Command::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "sparrow", &mut io::stdout());
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "sparrow=debug",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn prepare(
    args: &QueryArgs,
    config: &CliConfig,
) -> Result<(QueryEngine, QueryContext), Box<dyn Error>> {
    let mut engine_config = EngineConfig::default();
    if let Some(budget) = args.hash_join_budget.or(config.hash_join_budget()) {
        engine_config.planner.hash_join_budget = budget;
    }
    if args.no_optimize {
        engine_config.optimizer.enabled = false;
    }

    let mut sources: Vec<String> = args.sources.clone();
    let set_name = args
        .source_set
        .as_deref()
        .or_else(|| sources.is_empty().then(|| config.default_source_set()).flatten());
    if let Some(name) = set_name {
        sources.extend(config.source_set(name)?.iter().cloned());
    }
    if sources.is_empty() {
        return Err("no sources given; pass --source or --source-set".into());
    }

    let mut context = sources
        .iter()
        .map(|source| SourceDescriptor::parse(source))
        .fold(QueryContext::new(), QueryContext::with_descriptor);
    if let Some(ms) = args.timeout_ms.or(config.timeout_ms()) {
        context = context.with_timeout(Duration::from_millis(ms));
    }
    if let Some(limit) = args.limit {
        context = context.with_limit(limit);
    }
    if let Some(offset) = args.offset {
        context = context.with_offset(offset);
    }
    Ok((QueryEngine::with_config(engine_config), context))
}

fn read_query(raw: &str) -> Result<String, Box<dyn Error>> {
    if raw == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        Ok(text)
    } else if let Some(path) = raw.strip_prefix('@') {
        fs::read_to_string(path).map_err(|err| format!("failed to read {path}: {err}").into())
    } else {
        Ok(raw.to_string())
    }
}

fn write_results(
    mut handle: ResultHandle,
    format: OutputFormat,
    ui: &Ui,
) -> Result<(), Box<dyn Error>> {
    match handle.form() {
        QueryKind::Select => write_select(&mut handle, format, ui),
        QueryKind::Ask => {
            let answer = handle.boolean()?;
            match format {
                OutputFormat::Json => {
                    let doc = json!({ "head": {}, "boolean": answer });
                    println!("{}", serde_json::to_string_pretty(&doc)?);
                }
                _ => println!("{answer}"),
            }
            Ok(())
        }
        QueryKind::Construct | QueryKind::Describe => write_quads(&mut handle, format),
    }
}

fn write_select(
    handle: &mut ResultHandle,
    format: OutputFormat,
    ui: &Ui,
) -> Result<(), Box<dyn Error>> {
    let variables = handle.variables().to_vec();
    match format {
        OutputFormat::Json => {
            let mut rows = Vec::new();
            for row in handle.bindings()? {
                let row = row?;
                let mut object = Map::new();
                for (var, term) in row.iter() {
                    object.insert(var.as_str().to_string(), term_json(term));
                }
                rows.push(Value::Object(object));
            }
            let vars: Vec<&str> = variables.iter().map(|var| var.as_str()).collect();
            let doc = json!({ "head": { "vars": vars }, "results": { "bindings": rows } });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Tsv => {
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let header: Vec<String> = variables.iter().map(|var| var.to_string()).collect();
            writeln!(out, "{}", header.join("\t"))?;
            for row in handle.bindings()? {
                let row = match row {
                    Ok(row) => row,
                    Err(err) => {
                        out.flush()?;
                        return Err(err.into());
                    }
                };
                let cells: Vec<String> = variables
                    .iter()
                    .map(|var| row.get(var).map(Term::to_string).unwrap_or_default())
                    .collect();
                writeln!(out, "{}", cells.join("\t"))?;
            }
            out.flush()?;
        }
        OutputFormat::Table => {
            let headers: Vec<String> = variables.iter().map(|var| var.to_string()).collect();
            let mut rows = Vec::new();
            for row in handle.bindings()? {
                let row = row?;
                rows.push(
                    variables
                        .iter()
                        .map(|var| row.get(var).map(Term::to_string).unwrap_or_default())
                        .collect(),
                );
            }
            ui.table(&headers, &rows);
        }
        OutputFormat::Ntriples => {
            return Err("ntriples output needs a CONSTRUCT or DESCRIBE query".into());
        }
    }
    Ok(())
}

fn write_quads(handle: &mut ResultHandle, format: OutputFormat) -> Result<(), Box<dyn Error>> {
    if format == OutputFormat::Json {
        let mut quads = Vec::new();
        for quad in handle.quads()? {
            quads.push(quad_json(&quad?));
        }
        println!("{}", serde_json::to_string_pretty(&Value::Array(quads))?);
        return Ok(());
    }
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for quad in handle.quads()? {
        match quad {
            Ok(quad) => writeln!(out, "{quad}")?,
            Err(err) => {
                out.flush()?;
                return Err(err.into());
            }
        }
    }
    out.flush()?;
    Ok(())
}

fn term_json(term: &Term) -> Value {
    match term {
        Term::Iri(iri) => json!({ "type": "uri", "value": iri.as_str() }),
        Term::BlankNode(node) => json!({ "type": "bnode", "value": node.as_str() }),
        Term::Literal(lit) => {
            let mut object = Map::new();
            object.insert("type".into(), "literal".into());
            object.insert("value".into(), lit.value().into());
            if let Some(lang) = lit.language() {
                object.insert("xml:lang".into(), lang.into());
            } else if !lit.is_simple() {
                object.insert("datatype".into(), lit.datatype().as_str().into());
            }
            Value::Object(object)
        }
    }
}

fn quad_json(quad: &Quad) -> Value {
    json!({
        "subject": term_json(&quad.subject),
        "predicate": term_json(&quad.predicate),
        "object": term_json(&quad.object),
    })
}

fn print_explain(output: &PlannerOutput, redact: bool) {
    if redact {
        print!("{}", output.explain.redacted());
        println!("plan_hash: {:016x}", output.plan_hash);
    } else {
        println!("{}", output.explain);
    }
}

fn show_config(config: &CliConfig, ui: &Ui) -> Result<(), Box<dyn Error>> {
    let path = config
        .path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<none>".into());
    if !config.path().is_some_and(|path| path.exists()) {
        ui.warn(&format!("no config file at {path}; using built-in defaults"));
    }
    let format = config
        .format()?
        .map(|format| format!("{format:?}").to_lowercase())
        .unwrap_or_else(|| "table".into());
    let or_unset = |value: Option<String>| value.unwrap_or_else(|| "unset".into());
    ui.section(
        "Config",
        [
            ("path", path),
            ("format", format),
            ("timeout_ms", or_unset(config.timeout_ms().map(|v| v.to_string()))),
            (
                "hash_join_budget",
                or_unset(config.hash_join_budget().map(|v| v.to_string())),
            ),
            (
                "default_source_set",
                or_unset(config.default_source_set().map(str::to_string)),
            ),
        ],
    );
    for (name, sources) in config.source_sets() {
        ui.list(&format!("source set {name}"), sources.iter().cloned());
    }
    Ok(())
}
