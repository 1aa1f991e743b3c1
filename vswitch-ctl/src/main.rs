use clap::Parser;
use log::LevelFilter;

use vswitch_core::config::{DEFAULT_HOST, DEFAULT_PORT};
use vswitch_core::service::send_command;

/// Send one command to a running vswitch and print the reply.
#[derive(Parser)]
#[command(name = "vsctl")]
struct Cli {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long)]
    logging_level: Option<LevelFilter>,

    /// e.g. `vswitch show`
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    env_logger::builder()
        .filter_level(cli.logging_level.unwrap_or(LevelFilter::Warn))
        .init();

    let addr = format!("{}:{}", cli.host, cli.port);
    let line = cli.command.join(" ");

    match send_command(&addr, &line) {
        Ok(out) => {
            print!("{out}");
            if out.contains(" failed: ") {
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{addr}: {e}");
            std::process::exit(1);
        }
    }
}
