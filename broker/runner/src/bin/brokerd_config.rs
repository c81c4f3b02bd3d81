use broker::config::BrokerConfig;
use serdeconv;

fn main() {
    let config = serdeconv::to_toml_string(&BrokerConfig::default()).expect("Failed to generate config file");
    println!("{}", config);
}
