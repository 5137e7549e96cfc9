use clap::Parser;
use color_eyre::Result;
use ethereal::{Committee, Config, Ethereal, NodeId, PreBlock, QueueDataSource};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "In-process committee running the ordering protocol")]
struct Args {
    /// Number of processes in the committee
    #[clap(long, value_name = "INT", default_value = "4")]
    committee_size: u16,
    /// Number of epochs to run
    #[clap(long, value_name = "INT", default_value = "2")]
    epochs: u32,
    /// Highest level carrying application data in each epoch
    #[clap(long, value_name = "INT", default_value = "8")]
    last_level: i32,
    /// Payloads preloaded per process
    #[clap(long, value_name = "INT", default_value = "200")]
    messages: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let n = args.committee_size;
    info!(committee = n, epochs = args.epochs, "starting committee");

    // Index-derived keys, so every process builds the identical committee.
    let (committee, signers) = Committee::local(n);
    let committee = Arc::new(committee);

    let mut controllers = Vec::new();
    let mut unit_streams = Vec::new();
    let mut preblock_streams = Vec::new();
    for pid in 0..n {
        let mut conf = Config::deterministic(n, pid);
        conf.number_of_epochs = args.epochs;
        conf.last_level = args.last_level;
        let ethereal = Ethereal::new(conf, committee.clone(), signers[pid as usize].clone())?;

        let ds = Arc::new(QueueDataSource::new(
            (0..args.messages).map(|d| format!("pid: {pid} data: {d}").into_bytes()),
        ));
        let (pb_tx, pb_rx) = mpsc::unbounded_channel::<PreBlock>();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel();
        controllers.push(ethereal.deterministic(ds, pb_tx, unit_tx));
        unit_streams.push(unit_rx);
        preblock_streams.push(pb_rx);
    }
    let controllers = Arc::new(controllers);

    // Full-mesh dissemination: every emitted unit reaches every other
    // process, serialised through its wire form as a real transport would.
    for (pid, mut unit_rx) in unit_streams.into_iter().enumerate() {
        let controllers = controllers.clone();
        tokio::spawn(async move {
            while let Some(unit) = unit_rx.recv().await {
                let wire = ethereal::WirePreUnit::from_unit(&unit);
                for (other, controller) in controllers.iter().enumerate() {
                    if other == pid {
                        continue;
                    }
                    let algo = ethereal::DigestAlgorithm::default();
                    if let Ok(pre) = wire.clone().into_pre_unit(algo) {
                        let _ = controller
                            .input()
                            .send((pid as NodeId, vec![pre]))
                            .await;
                    }
                }
            }
        });
    }

    for controller in controllers.iter() {
        controller.start();
    }

    let expected = (args.epochs as usize) * (args.last_level as usize + 1);
    let mut produced = vec![0usize; n as usize];
    let mut payloads = 0usize;
    while produced.iter().any(|&count| count < expected) {
        for (pid, stream) in preblock_streams.iter_mut().enumerate() {
            while let Ok(pre_block) = stream.try_recv() {
                produced[pid] += 1;
                if pid == 0 {
                    payloads += pre_block.data.len();
                }
            }
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }

    info!(
        preblocks = expected,
        payloads, "every process emitted the full pre-block sequence"
    );
    for controller in controllers.iter() {
        controller.stop().await;
    }
    Ok(())
}
