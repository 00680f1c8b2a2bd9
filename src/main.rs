//! Entry point: parse args, bootstrap the cluster, hand off to the
//! operator shell. Logging setup mirrors
//! `examples/nymtech-ephemera/broadcast/src/main.rs`'s use of
//! `pretty_env_logger::init()` ahead of any networking.

use generals::cli;
use generals::membership::Cluster;
use generals::shell;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let args = cli::parse_args();
    log::info!(
        "starting {} generals at {}:{}",
        args.generals,
        args.host,
        args.base_port
    );

    let cluster = Cluster::bootstrap(&args).await?;
    shell::run(cluster).await;

    Ok(())
}
