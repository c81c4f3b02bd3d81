use broker::config::BrokerConfig;
use broker::persistence::FilePersistence;
use broker::Broker;
use clap::{App, Arg};
use flux::logging;
use std::io::BufRead;

pub fn main() {
    let matches = App::new("Broker Daemon")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Runs the message broker core as a standalone process.")
        .arg(Arg::with_name("CONFIG_FILE").long("config").takes_value(true).default_value("broker_config.toml").help("Path to the broker TOML config file"))
        .arg(Arg::with_name("LOG_CONFIG").long("log-config").takes_value(true).default_value("brokerd.log.toml").help("Path to the logging sink TOML config file"))
        .arg(Arg::with_name("DATA_DIR").long("data-dir").takes_value(true).help("Enables file-backed persistence rooted at this directory"))
        .get_matches();

    let logger = logging::from_toml_file(matches.value_of("LOG_CONFIG").unwrap()).unwrap_or_else(|_| logging::terminal_default());

    let config = BrokerConfig::load(matches.value_of("CONFIG_FILE").unwrap());

    let persistence = matches.value_of("DATA_DIR").map(|dir| {
        let store: Box<dyn broker::persistence::Persistence> = Box::new(FilePersistence::new(dir));
        store
    });

    logging::info!(logger, "starting broker"; "listen_address" => config.server.address.clone().unwrap_or_default(), "shards" => config.cluster.shards);

    let broker_logger = logger.new(logging::o!("component" => "broker"));
    let broker = Broker::new(&config, persistence, broker_logger);
    broker.start().expect("failed to start broker");

    logging::info!(logger, "broker ready, type 'quit' and press enter to stop");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if line.trim() == "quit" => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    logging::info!(logger, "shutting down");
    broker.shutdown().expect("failed to shut down broker cleanly");
}
