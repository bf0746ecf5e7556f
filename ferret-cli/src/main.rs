mod args;
mod env;
mod log;
mod util;

use clap::Parser;
use color_eyre::eyre::{
    bail,
    Error,
};
use ferret::{
    hooks::HookChain,
    proxy::Proxy,
    server::Server,
    tls::ca::Ca,
};
use tracing_subscriber::EnvFilter;

use crate::{
    args::{
        Args,
        Command,
        ProxyArgs,
    },
    env::Environment,
    log::LogFlows,
    util::shutdown::cancel_on_ctrlc_or_sigterm,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let env = Environment::from_options(args.options)?;

    match args.command {
        Command::GenerateCa { force } => generate_ca(&env, force).await?,
        Command::Proxy(args) => proxy(&env, args).await?,
    }

    Ok(())
}

async fn generate_ca(env: &Environment, force: bool) -> Result<(), Error> {
    let key_file = env.config_relative_path(&env.config().tls.key_file);
    let cert_file = env.config_relative_path(&env.config().tls.cert_file);

    if !force && (key_file.exists() || cert_file.exists()) {
        bail!(
            "CA files already exist: {} and {}. Use --force to overwrite them.",
            key_file.display(),
            cert_file.display()
        );
    }

    let ca = Ca::generate().await?;
    ca.save(&key_file, &cert_file)?;
    tracing::info!(key = %key_file.display(), cert = %cert_file.display(), "generated CA");
    println!("{}", cert_file.display());

    Ok(())
}

async fn proxy(env: &Environment, args: ProxyArgs) -> Result<(), Error> {
    let key_file = env.config_relative_path(&env.config().tls.key_file);
    let cert_file = env.config_relative_path(&env.config().tls.cert_file);
    if !key_file.exists() || !cert_file.exists() {
        bail!("No CA found. Run `ferret generate-ca` first.");
    }
    let ca = Ca::open(&key_file, &cert_file)?;

    let mut config = env.config().proxy.clone();
    args.apply(&mut config);
    if let Some(path) = &config.strategy.passthrough_cache_file {
        config.strategy.passthrough_cache_file = Some(env.config_relative_path(path));
    }

    let bind_address = args.bind.unwrap_or(env.config().bind_address);
    let hooks = HookChain::new().with(LogFlows);
    let proxy = Proxy::new(config, hooks, ca).await?;

    let shutdown = if args.no_graceful_shutdown {
        Default::default()
    }
    else {
        cancel_on_ctrlc_or_sigterm()
    };

    Server::builder(proxy)
        .with_bind_address(bind_address)
        .with_graceful_shutdown(shutdown)
        .serve()
        .await?;

    Ok(())
}
