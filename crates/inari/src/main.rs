use structopt::StructOpt;

use inari::{Node, OverlayKind, TableKind, TuningParams};

#[derive(Debug, StructOpt)]
#[structopt(name = "inari", about = "One-sided remote-memory key/value store node.")]
struct Opts {
    /// Interface address to bind; repeat for multiple interfaces.
    #[structopt(short, long = "interface", number_of_values = 1)]
    interface: Vec<String>,

    /// Port to listen on.
    #[structopt(short, long, default_value = "7000")]
    port: u16,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[structopt(short, parse(from_occurrences))]
    verbose: u8,

    /// host:port of a live node to join.
    #[structopt(short, long)]
    join: Option<String>,

    /// Placement algorithm: hopscotch or cuckoo.
    #[structopt(long, default_value = "hopscotch")]
    table: String,

    /// Overlay flavor: fixed or chord.
    #[structopt(long, default_value = "fixed")]
    overlay: String,

    /// Table slots at startup.
    #[structopt(long, default_value = "32")]
    table_size: usize,

    /// Receive buffers to keep posted.
    #[structopt(long, default_value = "64")]
    msg_buffers: usize,

    /// Partition count for the fixed overlay.
    #[structopt(long, default_value = "1")]
    partitions: u16,
}

fn params_from(opts: &Opts) -> anyhow::Result<TuningParams> {
    let table = match opts.table.as_str() {
        "hopscotch" => TableKind::Hopscotch,
        "cuckoo" => TableKind::Cuckoo,
        other => anyhow::bail!("unknown table kind {other:?}"),
    };
    let overlay = match opts.overlay.as_str() {
        "fixed" => OverlayKind::Fixed,
        "chord" => OverlayKind::Chord,
        other => anyhow::bail!("unknown overlay kind {other:?}"),
    };
    Ok(TuningParams {
        table,
        overlay,
        initial_table_size: opts.table_size,
        msg_buffers: opts.msg_buffers,
        fixed_partitions: opts.partitions,
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();

    if std::env::var("INARI_TRACE").is_err() {
        let level = match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("INARI_TRACE", level);
    }
    let fabric = inari::init();

    let params = params_from(&opts)?;
    let seed = match &opts.join {
        Some(addr) => {
            let (host, port) = addr
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("--join expects host:port, got {addr:?}"))?;
            Some((host.to_string(), port.to_string()))
        }
        None => None,
    };

    let hosts = if opts.interface.is_empty() {
        vec!["0.0.0.0".to_string()]
    } else {
        opts.interface.clone()
    };

    let node = Node::spawn(fabric, &hosts, opts.port, params, seed).await?;
    tracing::info!(
        host = node.host(),
        port = node.port(),
        id = %node.id(),
        "serving; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
