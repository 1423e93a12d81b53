use std::path::PathBuf;
use std::process;

use clap::Parser;

use onesided::config::Config;
use onesided::{client, logging, net, Error};

#[derive(Debug, Clone, Parser)]
#[command(name = "onesided-client", about = "Write a string into a remote buffer and read it back")]
struct Opts {
    /// String to send
    #[arg(short = 's', long = "send")]
    send: String,
    /// Server address or hostname
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,
    /// Server port, defaults to the configured one
    #[arg(short, long)]
    port: Option<u16>,
    /// Config path
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    no_ansi: bool,
}

fn main() {
    let opts = Opts::parse();
    let config = match Config::load(opts.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let e = Error::Config(format!("{:#}", e));
            eprintln!("{}", e);
            process::exit(e.exit_code());
        }
    };
    logging::init_log(&config, logging::Role::Client, !opts.no_ansi);

    let ret = net::resolve(&opts.address, opts.port.unwrap_or(config.port))
        .and_then(|server| client::run(&config, server, opts.send.as_bytes()));
    if let Err(e) = ret {
        tracing::error!("RDMA client failed: {}", e);
        process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_string_is_required() {
        assert!(Opts::try_parse_from(["onesided-client"]).is_err());
    }

    #[test]
    fn address_defaults_to_loopback() {
        let opts = Opts::try_parse_from(["onesided-client", "-s", "hello"]).unwrap();
        assert_eq!(opts.send, "hello");
        assert_eq!(opts.address, "127.0.0.1");
        assert_eq!(opts.port, None);
        assert!(!opts.no_ansi);
    }

    #[test]
    fn short_flags() {
        let opts =
            Opts::try_parse_from(["onesided-client", "-s", "x", "-a", "10.0.0.2", "-p", "7471"])
                .unwrap();
        assert_eq!(opts.address, "10.0.0.2");
        assert_eq!(opts.port, Some(7471));
    }
}
