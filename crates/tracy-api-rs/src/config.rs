use clap::Parser;

const DEFAULT_ADDR: &str = "127.0.0.1:8081";
const DEFAULT_DB_PATH: &str = "tracy.db";
const DEFAULT_LOG_DIR: &str = ".tracy/logs";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub db_path: String,
    pub debug: bool,
    pub log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "tracy-api-rs")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db_path: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve(&args.addr, "TRACY_ADDR", DEFAULT_ADDR),
        db_path: resolve(&args.db_path, "TRACY_DB_PATH", DEFAULT_DB_PATH),
        debug: args.debug || env_true("TRACY_DEBUG"),
        log_dir: resolve(&args.log_dir, "TRACY_LOG_DIR", DEFAULT_LOG_DIR),
    }
}

/// Flag first, then the environment, then the built-in default.
fn resolve(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
