//! Process args: the initial cluster shape. Grounded in
//! `examples/nymtech-ephemera/broadcast/src/cli.rs`'s use of `clap::Parser`;
//! the teacher's `--config-file`/`--basic` pair is replaced by the
//! parameters `examples/original_source/main.py` hard-codes at the top of
//! its script (`N`, `client_port`, `process_ports`).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Byzantine Generals oral-messages agreement demo")]
pub struct Args {
    /// number of generals to start with
    #[arg(short = 'n', long = "generals", default_value_t = 3)]
    pub generals: usize,

    /// bind address shared by every local peer
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// first TCP port handed to a general; ids mint upward from G0
    #[arg(short, long, default_value_t = 10011)]
    pub base_port: u16,
}

pub fn parse_args() -> Args {
    Args::parse()
}
