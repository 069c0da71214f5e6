use burrow::{run_broker, run_client, run_server, Config, Mode, Result};
use log::LevelFilter;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "burrow")]
struct Opt {
    /// JSON configuration file
    #[structopt(short, long, default_value = "config.json", parse(from_os_str))]
    config: PathBuf,

    /// Overrides the log level of the configuration file
    #[structopt(long = "log-level")]
    log_level: Option<LevelFilter>,
}

fn main() {
    let opt = Opt::from_args();

    let cfg = match Config::load(&opt.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("load config {} failed: {}", opt.config.display(), e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(opt.log_level.unwrap_or(cfg.log_level))
        .parse_default_env()
        .init();
    log::info!(version = env!("CARGO_PKG_VERSION"); "burrow");

    if let Err(e) = run(cfg.mode) {
        log::error!(err:% = e; "exiting");
        std::process::exit(1);
    }
}

fn run(mode: Mode) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match mode {
            Mode::Broker(opts) => {
                log::info!(role = "master", listen_at:% = opts.listen_addr; "starting");
                run_broker(opts).await
            }
            Mode::Server(opts) => {
                log::info!(role = "server", master:% = opts.broker_addr, ports = opts.ports.len(); "starting");
                run_server(opts).await
            }
            Mode::Client(opts) => {
                log::info!(role = "client", master:% = opts.broker_addr, ports = opts.ports.len(); "starting");
                run_client(opts).await
            }
        }
    })
}
