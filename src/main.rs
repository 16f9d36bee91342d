use anyhow::{bail, Result};
use clap::{Arg, ArgAction, Command};
use fabber::inference::{CancelToken, METHOD_NAMES, SPATIALVB_OPTIONS, VB_OPTIONS};
use fabber::models::{model_option_specs, MODEL_NAMES};
use fabber::noise::{NOISE_NAMES, NOISE_OPTIONS};
use fabber::options::{format_option_table, RunOptions};
use fabber::run::{run, CORE_OPTIONS};
use log::error;

/// Long option names claimed by the CLI layer; everything else in
/// `--key=value` form flows into the run-options map.
const CLAP_LONGS: &[&str] = &[
    "help",
    "version",
    "listmodels",
    "listmethods",
    "model",
    "method",
    "loadmodels",
];

fn build_cli() -> Command {
    Command::new("fabber")
        .version("0.1.0")
        .about("Variational Bayes model fitting for multi-voxel imaging timeseries")
        .disable_help_flag(true)
        .arg(
            Arg::new("help")
                .long("help")
                .action(ArgAction::SetTrue)
                .help("Print help; with --model or --method, include that plugin's options"),
        )
        .arg(
            Arg::new("listmodels")
                .long("listmodels")
                .action(ArgAction::SetTrue)
                .help("List available forward models"),
        )
        .arg(
            Arg::new("listmethods")
                .long("listmethods")
                .action(ArgAction::SetTrue)
                .help("List available inference methods"),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("NAME")
                .help("Forward model name"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .value_name("NAME")
                .help("Inference method: vb or spatialvb"),
        )
        .arg(
            Arg::new("loadmodels")
                .long("loadmodels")
                .value_name("PATH")
                .help("Load an external model library (not supported in this build)"),
        )
        .arg(
            Arg::new("paramfile")
                .short('f')
                .value_name("FILE")
                .help("Option file: one --key=value per line, # comments"),
        )
        .arg(
            Arg::new("legacyfile")
                .short('@')
                .value_name("FILE")
                .help("Legacy option file: whitespace-separated --key=value tokens"),
        )
}

/// Split argv into the arguments clap owns and the free `--key=value`
/// options destined for the run-options map.
fn partition_args(argv: &[String]) -> Result<(Vec<String>, Vec<String>)> {
    let mut clap_args = vec![argv[0].clone()];
    let mut extra = Vec::new();
    let mut iter = argv[1..].iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-f" || arg == "-@" {
            clap_args.push(arg.clone());
            if let Some(value) = iter.next() {
                clap_args.push(value.clone());
            }
            continue;
        }
        match arg.strip_prefix("--") {
            Some(body) => {
                let key = body.split('=').next().unwrap_or(body);
                if CLAP_LONGS.contains(&key) {
                    clap_args.push(arg.clone());
                } else {
                    extra.push(arg.clone());
                }
            }
            None => bail!("Malformed option argument: {:?}", arg),
        }
    }
    Ok((clap_args, extra))
}

fn print_help(matches: &clap::ArgMatches) -> Result<()> {
    let mut cmd = build_cli();
    println!("{}", cmd.render_help());
    println!("{}", format_option_table("Run options", CORE_OPTIONS));

    if let Some(method) = matches.get_one::<String>("method") {
        match method.as_str() {
            "vb" => {
                println!("{}", format_option_table("vb options", VB_OPTIONS));
                println!("{}", format_option_table("Noise options", NOISE_OPTIONS));
            }
            "spatialvb" => {
                println!("{}", format_option_table("spatialvb options", VB_OPTIONS));
                println!("{}", format_option_table("Spatial options", SPATIALVB_OPTIONS));
                println!("{}", format_option_table("Noise options", NOISE_OPTIONS));
            }
            other => bail!("Unknown method: {} (supported: {})", other, METHOD_NAMES.join(", ")),
        }
    }
    if let Some(model) = matches.get_one::<String>("model") {
        let specs = model_option_specs(model)?;
        if specs.is_empty() {
            println!("Model {} takes no options", model);
        } else {
            println!("{}", format_option_table(&format!("{} options", model), specs));
        }
    }
    Ok(())
}

fn real_main() -> Result<i32> {
    let argv: Vec<String> = std::env::args().collect();
    let (clap_args, extra) = partition_args(&argv)?;
    let matches = build_cli().try_get_matches_from(&clap_args)?;

    if matches.get_flag("listmodels") {
        for name in MODEL_NAMES {
            println!("{}", name);
        }
        return Ok(0);
    }
    if matches.get_flag("listmethods") {
        for name in METHOD_NAMES {
            println!("{}", name);
        }
        return Ok(0);
    }
    if matches.get_flag("help") {
        print_help(&matches)?;
        return Ok(0);
    }
    if matches.get_one::<String>("loadmodels").is_some() {
        bail!(
            "--loadmodels is not supported in this build; available models: {} (noise: {})",
            MODEL_NAMES.join(", "),
            NOISE_NAMES.join(", ")
        );
    }

    let mut options = RunOptions::new();
    options.parse_args(&extra)?;
    if let Some(model) = matches.get_one::<String>("model") {
        options.override_value("model", model);
    }
    if let Some(method) = matches.get_one::<String>("method") {
        options.override_value("method", method);
    }
    // Option files fill in whatever the command line left unset.
    if let Some(path) = matches.get_one::<String>("paramfile") {
        options.merge_param_file(path)?;
    }
    if let Some(path) = matches.get_one::<String>("legacyfile") {
        options.merge_legacy_file(path)?;
    }

    let summary = run(&options, &CancelToken::new())?;
    Ok(if summary.n_failed > 0 { 1 } else { 0 })
}

fn main() {
    env_logger::init();
    let code = match real_main() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
