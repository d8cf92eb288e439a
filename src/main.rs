use clap::{Arg, Command};
use serverless_runtime::PlatformConfig;

mod commands;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn cli() -> Command {
    Command::new("serverless")
        .version(VERSION)
        .about("Serverless platform: run functions in isolated sandboxes behind HTTP triggers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Path to the YAML configuration file [env: SERVERLESS_CONFIG] [default: config/config.yaml]"),
        )
        .subcommand(Command::new("run").about("Start the serverless platform server"))
        .subcommand(
            Command::new("deploy")
                .about("Register an already-built function image with a running server")
                .arg(
                    Arg::new("name")
                        .value_name("NAME")
                        .required(true)
                        .help("Unique function name"),
                )
                .arg(
                    Arg::new("image")
                        .short('i')
                        .long("image")
                        .value_name("IMAGE")
                        .help("Image reference (defaults to serverless-<name>:latest)"),
                )
                .arg(
                    Arg::new("runtime")
                        .short('r')
                        .long("runtime")
                        .value_name("RUNTIME")
                        .help("Runtime label")
                        .default_value("go"),
                ),
        )
        .subcommand(
            Command::new("invoke")
                .about("Invoke a function with a JSON event and print its output")
                .arg(
                    Arg::new("name")
                        .value_name("NAME")
                        .required(true)
                        .help("Function name"),
                )
                .arg(
                    Arg::new("event")
                        .value_name("EVENT")
                        .required(true)
                        .help("Event payload as JSON"),
                )
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .value_name("MILLIS")
                        .value_parser(clap::value_parser!(u64).range(1..))
                        .help("Per-invocation deadline in milliseconds"),
                ),
        )
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let config_path = PlatformConfig::resolve_path(
        matches.get_one::<String>("config").map(String::as_str),
    );
    // Logging is configured from the file, so where it came from is reported
    // once tracing is up
    let (config, source) = match PlatformConfig::load_with_source(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("✗ {}", e);
            std::process::exit(1);
        }
    };

    let result = match matches.subcommand() {
        Some(("run", _)) => commands::run::run(config, source).await,
        Some(("deploy", sub_matches)) => commands::deploy::run(sub_matches, &config).await,
        Some(("invoke", sub_matches)) => commands::invoke::run(sub_matches, &config).await,
        _ => {
            let _ = cli().print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }
}
