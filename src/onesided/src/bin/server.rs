use std::path::PathBuf;
use std::process;

use clap::Parser;

use onesided::config::Config;
use onesided::{logging, net, server, Error};

#[derive(Debug, Clone, Parser)]
#[command(name = "onesided-server", about = "Serve one client a buffer for one-sided access")]
struct Opts {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    address: String,
    /// Port to listen on, defaults to the configured one
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
    logging::init_log(&config, logging::Role::Server, !opts.no_ansi);

    let ret = net::resolve(&opts.address, opts.port.unwrap_or(config.port))
        .and_then(|bind| server::run(&config, bind));
    if let Err(e) = ret {
        tracing::error!("RDMA server failed: {}", e);
        process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listens_on_any_address_by_default() {
        let opts = Opts::try_parse_from(["onesided-server"]).unwrap();
        assert_eq!(opts.address, "0.0.0.0");
        assert_eq!(opts.port, None);
        assert_eq!(opts.config, None);
    }

    #[test]
    fn rejects_unknown_flags() {
        assert!(Opts::try_parse_from(["onesided-server", "-s", "x"]).is_err());
    }
}
