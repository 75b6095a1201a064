use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use nso_patcher_core::{run, PatchSettings};

#[derive(Debug, Parser)]
#[command(name = "nso-patcher", version, about = "Applies asm diffs and startflags to NSO executables")]
struct Args {
    /// JSON settings file. Flags given on the command line override it.
    #[arg(long, value_name = "JSON")]
    config: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    input: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    data: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    output: Option<PathBuf>,

    /// Starting item, e.g. `--start-item "Progressive Sword=2"`.
    #[arg(long = "start-item", value_name = "NAME=COUNT", value_parser = parse_start_item)]
    start_items: Vec<(String, u32)>,

    /// World setting used by `onlyif` conditions, e.g. `--setting tunic_swap=on`.
    #[arg(long = "setting", value_name = "KEY=VALUE", value_parser = parse_setting)]
    settings: Vec<(String, String)>,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_start_item(s: &str) -> Result<(String, u32), String> {
    let (name, count) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=COUNT, got '{s}'"))?;
    let count = count
        .trim()
        .parse()
        .map_err(|e| format!("invalid count in '{s}': {e}"))?;
    Ok((name.trim().to_string(), count))
}

fn parse_setting(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn build_settings(args: Args) -> nso_patcher_core::Result<PatchSettings> {
    let mut settings = match &args.config {
        Some(path) => PatchSettings::load(path)?,
        None => PatchSettings::new(PathBuf::new(), PathBuf::new(), PathBuf::new()),
    };

    if let Some(input) = args.input {
        settings.input_path = input;
    }
    if let Some(data) = args.data {
        settings.data_path = data;
    }
    if let Some(output) = args.output {
        settings.output_path = output;
    }
    settings.starting_items.extend(args.start_items);
    settings.world_settings.extend(args.settings);
    settings.debug |= args.debug;

    Ok(settings)
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("nso_patcher_core={0},nso_patcher={0}", args.log_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = build_settings(args).and_then(run);
    if let Err(err) = result {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
