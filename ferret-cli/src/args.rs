use std::{
    net::SocketAddr,
    path::PathBuf,
};

use clap::{
    builder::{
        styling::{
            AnsiColor,
            Color,
            Style,
        },
        Styles,
    },
    Parser,
};
use ferret::config::{
    ProxyConfig,
    ProxyMode,
    StrategyKind,
};

/// ferret - an intercepting HTTP(S) proxy
#[derive(Debug, Parser)]
#[clap(styles(Args::STYLES))]
pub struct Args {
    #[clap(flatten)]
    pub options: Options,

    #[clap(subcommand)]
    pub command: Command,
}

impl Args {
    const STYLES: Styles = Styles::styled()
        .header(Style::new().bold())
        .usage(Style::new().bold())
        .literal(
            Style::new()
                .italic()
                .fg_color(Some(Color::Ansi(AnsiColor::Magenta))),
        )
        .placeholder(
            Style::new()
                .italic()
                .fg_color(Some(Color::Ansi(AnsiColor::BrightGreen))),
        )
        .valid(Style::new().italic())
        .invalid(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Red))));
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Generates key and root certificate for the certificate authority used to
    /// intercept TLS traffic.
    GenerateCa {
        /// Overwrite existing files.
        #[clap(short, long)]
        force: bool,
    },
    /// Runs the proxy and logs every flow to the console.
    Proxy(ProxyArgs),
}

#[derive(Debug, Parser)]
pub struct ProxyArgs {
    /// Address to listen on. Overrides `bind_address` from the config file.
    #[clap(short, long, value_name("ADDRESS"), env = "FERRET_BIND")]
    pub bind: Option<SocketAddr>,

    /// Proxy mode: `regular`, `transparent`, `reverse:URL` or
    /// `upstream:URL`.
    #[clap(short, long)]
    pub mode: Option<ProxyMode>,

    /// TLS interception strategy: `conservative`, `probabilistic` or
    /// `passthrough-cache`.
    #[clap(short, long, value_name("NAME"))]
    pub strategy: Option<StrategyKind>,

    /// Don't verify server certificates.
    #[clap(long)]
    pub ssl_insecure: bool,

    /// Exit immediately on Ctrl-C instead of closing connections first.
    #[clap(long)]
    pub no_graceful_shutdown: bool,
}

impl ProxyArgs {
    /// Lets command-line arguments override the config file.
    pub fn apply(&self, config: &mut ProxyConfig) {
        if let Some(mode) = &self.mode {
            config.mode = mode.clone();
        }
        if let Some(strategy) = self.strategy {
            config.strategy.kind = strategy;
        }
        if self.ssl_insecure {
            config.ssl_insecure = true;
        }
    }
}

/// Command-line options shared by all commands.
#[derive(Clone, Debug, Parser)]
pub struct Options {
    /// Path to the ferret configuration directory. Defaults to
    /// `~/.config/ferret/`.
    #[clap(short, long, env = "FERRET_CONFIG")]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use ferret::config::{
        ProxyConfig,
        ProxyMode,
        StrategyKind,
    };

    use super::{
        Args,
        Command,
    };

    #[test]
    fn it_parses_proxy_arguments() {
        let args = Args::try_parse_from([
            "ferret",
            "--config",
            "/tmp/ferret",
            "proxy",
            "--bind",
            "0.0.0.0:8081",
            "--mode",
            "transparent",
            "--strategy",
            "passthrough-cache",
            "--ssl-insecure",
        ])
        .unwrap();

        assert_eq!(args.options.config.unwrap().to_str(), Some("/tmp/ferret"));
        let Command::Proxy(proxy) = args.command
        else {
            panic!("expected the proxy command");
        };
        assert_eq!(proxy.bind, Some(([0, 0, 0, 0], 8081).into()));

        let mut config = ProxyConfig::default();
        proxy.apply(&mut config);
        assert_eq!(config.mode, ProxyMode::Transparent);
        assert_eq!(config.strategy.kind, StrategyKind::PassthroughCache);
        assert!(config.ssl_insecure);
    }

    #[test]
    fn it_parses_generate_ca() {
        let args = Args::try_parse_from(["ferret", "generate-ca", "--force"]).unwrap();
        assert!(matches!(args.command, Command::GenerateCa { force: true }));
    }
}
