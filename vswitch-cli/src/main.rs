use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use parking_lot::Mutex;

use vswitch_core::cli;
use vswitch_core::prelude::*;
use vswitch_core::service::Server;

#[derive(Parser)]
#[command(name = "vswitch", about = "software virtual switch")]
struct Cli {
    /// JSON parameter file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Command script run at start-up.
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Control service address.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    control_port: Option<u16>,

    /// Soft device port, repeat for more.
    #[arg(short = 'p', long = "port")]
    ports: Vec<String>,

    /// Number of core slots.
    #[arg(long)]
    lcores: Option<u16>,

    #[arg(long)]
    stats_file: Option<PathBuf>,

    /// Capture the first packets of every worker graph to /tmp/worker_<core>.pcap.
    #[arg(long)]
    enable_graph_pcap: bool,

    /// Read commands from stdin as well.
    #[arg(short, long)]
    interactive: bool,

    #[arg(short, long)]
    logging_level: Option<LevelFilter>,
}

impl Cli {
    fn params(&self) -> vswitch_core::Result<Params> {
        let mut params = match &self.config {
            Some(path) => Params::load(path)?,
            None => Params::default(),
        };

        if let Some(script) = &self.script {
            params.script = script.clone();
        }
        if let Some(host) = &self.host {
            params.host = host.clone();
        }
        if let Some(port) = self.control_port {
            params.port = port;
        }
        if !self.ports.is_empty() {
            params.ports = self.ports.clone();
        }
        if let Some(n) = self.lcores {
            params.nb_lcores = n;
        }
        if self.stats_file.is_some() {
            params.stats_file = self.stats_file.clone();
        }
        if self.enable_graph_pcap {
            params.enable_graph_pcap = true;
        }

        Ok(params)
    }
}

fn prompt(vs: Arc<Mutex<Vswitch>>, stop: Arc<AtomicBool>) {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("vswitch> ");
        let _ = std::io::stdout().flush();

        let Some(Ok(line)) = lines.next() else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            _ => {}
        }

        let (Ok(out) | Err(out)) = cli::execute_line(&mut vs.lock(), line);
        print!("{out}");
    }

    stop.store(true, Ordering::SeqCst);
}

fn main() {
    let args = Cli::parse();

    env_logger::builder()
        .filter_level(args.logging_level.unwrap_or(LevelFilter::Info))
        .init();

    let params = args.params().unwrap_or_else(|e| {
        log::error!("failed to load parameters: {}", e);
        std::process::exit(1);
    });
    let script = params.script.clone();
    let addr = params.control_addr();

    let eth = Arc::new(SoftEthDevice::new(&params.ports[..]));
    let vs = Vswitch::new(params, eth, Arc::new(SoftEventDevice::new())).unwrap_or_else(|e| {
        log::error!("failed to initialise vswitch: {}", e);
        std::process::exit(1);
    });
    let vs = Arc::new(Mutex::new(vs));

    if script.is_file() {
        match cli::execute_script(&mut vs.lock(), &script) {
            Ok(0) => log::info!("{} executed", script.display()),
            Ok(n) => log::warn!("{}: {} command(s) failed", script.display(), n),
            Err(e) => log::error!("{}: {}", script.display(), e),
        }
    } else {
        log::warn!("script {} not found, starting unconfigured", script.display());
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .expect("failed to set signal handler");
    }

    let mut server = Server::bind(&addr).unwrap_or_else(|e| {
        log::error!("failed to bind control service on {}: {}", addr, e);
        std::process::exit(1);
    });
    let service = {
        let vs = vs.clone();
        let stop = stop.clone();
        std::thread::Builder::new()
            .name("vswitch-ctl".to_string())
            .spawn(move || {
                if let Err(e) = server.run(&vs, &stop) {
                    log::error!("control service failed: {}", e);
                }
            })
            .expect("failed to spawn control service")
    };

    if args.interactive {
        let vs = vs.clone();
        let stop = stop.clone();
        std::thread::spawn(move || prompt(vs, stop));
    }

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down...");
    let _ = service.join();

    let mut vs = vs.lock();
    if vs.is_running() {
        if let Err(e) = vs.stop() {
            log::error!("failed to stop vswitch: {}", e);
        }
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;
