use crate::committee::{Committee, Signer};
use crate::config::{Config, ConfigError};
use crate::creator::{Creator, DataSource, LastTiming, RsDataFn};
use crate::dag::{AddOutcome, Dag};
use crate::epoch::ThresholdProofBuilder;
use crate::extender::Extender;
use crate::metrics::EtherealMetrics;
use crate::rsource::{DeterministicRandomSource, RandomSource};
use crate::types::{Epoch, NodeId, PreBlock};
use crate::unit::{PreUnit, Unit};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the peer-ingest and creator belts. Producers block when a
/// belt fills; peer units are never dropped.
const BELT_CAPACITY: usize = 100;

pub type InputSender = mpsc::Sender<(NodeId, Vec<PreUnit>)>;
pub type PreBlockSink = mpsc::UnboundedSender<PreBlock>;
pub type UnitSink = mpsc::UnboundedSender<Arc<Unit>>;

type SharedDags = Arc<Mutex<BTreeMap<Epoch, Arc<Dag>>>>;

#[derive(Debug, thiserror::Error)]
pub enum EtherealError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("committee of {committee} members does not match n_proc {n_proc}")]
    CommitteeMismatch { committee: u16, n_proc: u16 },
}

/// One committee participation. Instantiated once per run; its lifetime is
/// bounded by the controller's start/stop.
pub struct Ethereal {
    conf: Config,
    committee: Arc<Committee>,
    signer: Signer,
}

impl Ethereal {
    pub fn new(
        conf: Config,
        committee: Arc<Committee>,
        signer: Signer,
    ) -> Result<Self, EtherealError> {
        conf.validate()?;
        if committee.n_proc() != conf.n_proc {
            return Err(EtherealError::CommitteeMismatch {
                committee: committee.n_proc(),
                n_proc: conf.n_proc,
            });
        }
        Ok(Self {
            conf,
            committee,
            signer,
        })
    }

    /// Wires the deterministic (coin-free) protocol instance: units out
    /// through `unit_sink` for broadcast, committed batches out through
    /// `preblock_sink`, peer units in through the controller's input belt.
    pub fn deterministic(
        &self,
        ds: Arc<dyn DataSource>,
        preblock_sink: PreBlockSink,
        unit_sink: UnitSink,
    ) -> Controller {
        let conf = self.conf.clone();
        let metrics = EtherealMetrics::new();
        let token = CancellationToken::new();
        let notify = Arc::new(Notify::new());
        let dags: SharedDags = Arc::new(Mutex::new(BTreeMap::new()));
        let frozen = Arc::new(Mutex::new(HashSet::new()));
        let last_timing: LastTiming = Arc::new(Mutex::new(Default::default()));
        let ordering_floor = Arc::new(AtomicU32::new(0));

        let (input_tx, input_rx) = mpsc::channel(BELT_CAPACITY);
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (creator_tx, belt_rx) = mpsc::channel(BELT_CAPACITY);

        let algo = conf.digest_algorithm;
        let pid = conf.pid;
        let rs_data: RsDataFn = Arc::new(move |level, epoch| {
            DeterministicRandomSource::new(epoch, algo).data_to_include(pid, level)
        });
        let proof_factory = ThresholdProofBuilder::factory(
            pid,
            conf.last_level,
            self.committee.clone(),
            self.signer.clone(),
        );
        let creator = Arc::new(Creator::new(
            conf.clone(),
            ds,
            local_tx,
            rs_data,
            proof_factory,
            frozen.clone(),
            last_timing.clone(),
        ));

        let ingest = IngestTask {
            conf: conf.clone(),
            token: token.clone(),
            input_rx,
            local_rx,
            creator_tx,
            unit_sink,
            dags: dags.clone(),
            pending: Vec::new(),
            current_epoch: 0,
            ordering_floor: ordering_floor.clone(),
            frozen,
            notify: notify.clone(),
            metrics: metrics.clone(),
        };
        let creator_task = CreatorTask {
            token: token.clone(),
            belt_rx,
            creator,
        };
        let orderer = OrdererTask {
            conf,
            token: token.clone(),
            notify,
            dags,
            last_timing,
            preblock_sink,
            ordering_floor,
            metrics: metrics.clone(),
            extenders: BTreeMap::new(),
            next_epoch: 0,
        };

        Controller {
            input_tx,
            metrics,
            token,
            inner: Mutex::new(ControllerInner {
                setup: Some(Setup {
                    ingest,
                    creator: creator_task,
                    orderer,
                }),
                handles: Vec::new(),
            }),
        }
    }
}

struct Setup {
    ingest: IngestTask,
    creator: CreatorTask,
    orderer: OrdererTask,
}

struct ControllerInner {
    setup: Option<Setup>,
    handles: Vec<JoinHandle<()>>,
}

/// The running protocol engine. `input()` hands out the belt for peer units;
/// `start` is idempotent and `stop` only returns once no sink can be invoked
/// again.
pub struct Controller {
    input_tx: InputSender,
    metrics: Arc<EtherealMetrics>,
    token: CancellationToken,
    inner: Mutex<ControllerInner>,
}

impl Controller {
    /// The peer-unit entry point; the sender id is advisory.
    pub fn input(&self) -> InputSender {
        self.input_tx.clone()
    }

    pub fn metrics(&self) -> &Arc<EtherealMetrics> {
        &self.metrics
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock();
        match inner.setup.take() {
            Some(setup) => {
                inner.handles.push(tokio::spawn(setup.creator.run()));
                inner.handles.push(tokio::spawn(setup.ingest.run()));
                inner.handles.push(tokio::spawn(setup.orderer.run()));
                info!("controller started");
            }
            None => debug!("controller already started"),
        }
    }

    /// Cancels the workers and waits them out; after return the unit and
    /// pre-block sinks are guaranteed quiet.
    pub async fn stop(&self) {
        self.token.cancel();
        let handles = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.handles)
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("controller stopped");
    }
}

/// Owns the per-epoch DAGs: inserts peer and local units, buffers units with
/// absent parents, forwards accepted units to the creator belt, and wakes
/// the orderer.
struct IngestTask {
    conf: Config,
    token: CancellationToken,
    input_rx: mpsc::Receiver<(NodeId, Vec<PreUnit>)>,
    local_rx: mpsc::UnboundedReceiver<Arc<Unit>>,
    creator_tx: mpsc::Sender<Arc<Unit>>,
    unit_sink: UnitSink,
    dags: SharedDags,
    pending: Vec<PreUnit>,
    current_epoch: Epoch,
    ordering_floor: Arc<AtomicU32>,
    frozen: Arc<Mutex<HashSet<NodeId>>>,
    notify: Arc<Notify>,
    metrics: Arc<EtherealMetrics>,
}

impl IngestTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                unit = self.local_rx.recv() => match unit {
                    Some(unit) => self.handle_local(unit).await,
                    None => break,
                },
                batch = self.input_rx.recv() => match batch {
                    Some((source, pre_units)) => self.handle_peer(source, pre_units).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_local(&mut self, unit: Arc<Unit>) {
        if unit.epoch() > self.current_epoch {
            self.current_epoch = unit.epoch();
            self.metrics.current_epoch.set(self.current_epoch as i64);
            self.prune();
        }
        let dag = self.dag_for(unit.epoch());
        match dag.insert(unit) {
            AddOutcome::Added(unit) => {
                self.after_add(&dag, &unit);
                if self.unit_sink.send(unit).is_err() {
                    debug!(pid = self.conf.pid, "unit sink closed");
                }
                self.retry_pending().await;
            }
            _ => warn!(pid = self.conf.pid, "own unit rejected by the DAG"),
        }
    }

    async fn handle_peer(&mut self, source: NodeId, pre_units: Vec<PreUnit>) {
        trace!(pid = self.conf.pid, source, count = pre_units.len(), "peer units");
        for pre in pre_units {
            self.route(pre).await;
        }
        self.retry_pending().await;
    }

    async fn route(&mut self, pre: PreUnit) {
        let epoch = pre.epoch();
        if epoch + 1 < self.current_epoch {
            debug!(pid = self.conf.pid, epoch, "dropping unit of a closed epoch");
            return;
        }
        if epoch > self.current_epoch + 1 {
            // A peer is ahead of us; park its units until we advance.
            self.pending.push(pre);
            return;
        }
        let dag = self.dag_for(epoch);
        match dag.add(pre) {
            AddOutcome::Added(unit) => {
                self.after_add(&dag, &unit);
                if self.creator_tx.send(unit).await.is_err() {
                    debug!(pid = self.conf.pid, "creator belt closed");
                }
            }
            AddOutcome::Duplicate => trace!(pid = self.conf.pid, "duplicate unit"),
            AddOutcome::MissingParents(pre, missing) => {
                trace!(
                    pid = self.conf.pid,
                    missing = missing.len(),
                    "buffering unit with absent parents"
                );
                self.pending.push(pre);
            }
            AddOutcome::Invalid(error) => {
                self.metrics.units_rejected.inc();
                warn!(pid = self.conf.pid, %error, "rejecting invalid unit");
            }
        }
    }

    /// Replays the buffer until a pass makes no progress. Runs after every
    /// acceptance, so a unit is admitted as soon as its last parent is.
    async fn retry_pending(&mut self) {
        while !self.pending.is_empty() {
            let batch = std::mem::take(&mut self.pending);
            let before = batch.len();
            for pre in batch {
                self.route(pre).await;
            }
            if self.pending.len() >= before {
                break;
            }
        }
        self.metrics.units_pending.set(self.pending.len() as i64);
    }

    fn after_add(&self, dag: &Arc<Dag>, unit: &Arc<Unit>) {
        self.metrics.units_added.inc();
        if unit.epoch() == self.current_epoch {
            self.metrics.dag_level.set(dag.max_level() as i64);
        }
        if dag.is_forker(unit.creator()) && self.frozen.lock().insert(unit.creator()) {
            self.metrics.forks_detected.inc();
            warn!(
                pid = self.conf.pid,
                forker = unit.creator(),
                "freezing forking creator"
            );
        }
    }

    fn dag_for(&mut self, epoch: Epoch) -> Arc<Dag> {
        let mut dags = self.dags.lock();
        if let Some(dag) = dags.get(&epoch) {
            return dag.clone();
        }
        debug!(pid = self.conf.pid, epoch, "opening DAG");
        let dag = Arc::new(Dag::new(
            epoch,
            self.conf.n_proc,
            self.conf.quorum(),
            self.conf.digest_algorithm,
        ));
        // The orderer is woken from inside the insert, under the DAG lock;
        // the observer only posts the wakeup and never blocks.
        let notify = self.notify.clone();
        dag.add_observer(Box::new(move |_| notify.notify_one()));
        dags.insert(epoch, dag.clone());
        dag
    }

    /// Closed epochs are kept only while insertions may still lag: one epoch
    /// behind production, and nothing the orderer has not flattened yet.
    fn prune(&mut self) {
        let floor = self
            .ordering_floor
            .load(Ordering::Relaxed)
            .min(self.current_epoch.saturating_sub(1));
        self.dags.lock().retain(|epoch, _| *epoch >= floor);
    }
}

/// Runs the creator against its belt of DAG-accepted units.
struct CreatorTask {
    token: CancellationToken,
    belt_rx: mpsc::Receiver<Arc<Unit>>,
    creator: Arc<Creator>,
}

impl CreatorTask {
    async fn run(mut self) {
        // Seed our dealing unit before any peer unit is folded in.
        self.creator.start();
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                unit = self.belt_rx.recv() => match unit {
                    Some(unit) => self.creator.consume(&[unit]),
                    None => break,
                },
            }
        }
    }
}

/// Single-threaded ordering dispatcher: one extender per epoch, epochs
/// flattened strictly in order, so pre-block emission order equals timing
/// order globally.
struct OrdererTask {
    conf: Config,
    token: CancellationToken,
    notify: Arc<Notify>,
    dags: SharedDags,
    last_timing: LastTiming,
    preblock_sink: PreBlockSink,
    ordering_floor: Arc<AtomicU32>,
    metrics: Arc<EtherealMetrics>,
    extenders: BTreeMap<Epoch, Extender>,
    next_epoch: Epoch,
}

impl OrdererTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = self.notify.notified() => {}
            }
            self.progress();
        }
    }

    fn progress(&mut self) {
        while self.next_epoch < self.conf.number_of_epochs {
            let dag = self.dags.lock().get(&self.next_epoch).cloned();
            let dag = match dag {
                Some(dag) => dag,
                None => break,
            };
            let epoch = self.next_epoch;
            let conf = self.conf.clone();
            let extender = self.extenders.entry(epoch).or_insert_with(|| {
                let rsource: Arc<dyn RandomSource> = Arc::new(DeterministicRandomSource::new(
                    epoch,
                    conf.digest_algorithm,
                ));
                Extender::new(dag, conf, rsource)
            });
            let rounds = extender.advance();
            let finished = extender.finished();
            for round in rounds {
                self.metrics.preblocks_emitted.inc();
                if round.last_of_epoch {
                    self.last_timing.lock().push_back(round.timing_unit.clone());
                }
                if self.preblock_sink.send(round.pre_block).is_err() {
                    debug!("pre-block sink closed");
                }
            }
            if finished {
                self.extenders.remove(&epoch);
                self.next_epoch += 1;
                self.ordering_floor.store(self.next_epoch, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creator::QueueDataSource;
    use crate::crown::Crown;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_assembled() {
        // A controller for process 0 receiving one dealing from each peer
        // must answer with its own dealing and then a height-1 unit built on
        // the full quorum.
        let conf = Config::deterministic(4, 0);
        let algo = conf.digest_algorithm;
        let (committee, signers) = Committee::local(4);
        let ethereal = Ethereal::new(conf, Arc::new(committee), signers[0].clone()).unwrap();

        let (pb_tx, _pb_rx) = mpsc::unbounded_channel();
        let (unit_tx, mut unit_rx) = mpsc::unbounded_channel();
        let controller = ethereal.deterministic(
            Arc::new(QueueDataSource::new(std::iter::empty())),
            pb_tx,
            unit_tx,
        );
        controller.start();

        let input = controller.input();
        for pid in 1..4u16 {
            let pre = PreUnit::new(pid, 0, 0, Crown::empty(4, algo), vec![], vec![], algo);
            input.send((pid, vec![pre])).await.unwrap();
        }

        let mut emitted = Vec::new();
        for _ in 0..200 {
            while let Ok(unit) = unit_rx.try_recv() {
                emitted.push(unit);
            }
            if emitted.len() >= 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        controller.stop().await;

        assert!(emitted.len() >= 2, "expected dealing and follow-up unit");
        assert_eq!(emitted[0].creator(), 0);
        assert_eq!(emitted[0].epoch(), 0);
        assert_eq!(emitted[0].height(), 0);
        assert_eq!(emitted[1].creator(), 0);
        assert_eq!(emitted[1].epoch(), 0);
        assert_eq!(emitted[1].height(), 1);
        assert_eq!(emitted[1].level(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_quiets_sinks() {
        let conf = Config::deterministic(4, 0);
        let (committee, signers) = Committee::local(4);
        let ethereal = Ethereal::new(conf, Arc::new(committee), signers[0].clone()).unwrap();

        let (pb_tx, _pb_rx) = mpsc::unbounded_channel();
        let (unit_tx, mut unit_rx) = mpsc::unbounded_channel();
        let controller = ethereal.deterministic(
            Arc::new(QueueDataSource::new(std::iter::empty())),
            pb_tx,
            unit_tx,
        );
        controller.start();
        controller.start();

        sleep(Duration::from_millis(50)).await;
        controller.stop().await;

        // Drain whatever was produced before the stop returned; afterwards
        // the sink must stay silent.
        while unit_rx.try_recv().is_ok() {}
        sleep(Duration::from_millis(50)).await;
        assert!(unit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_mismatched_committee() {
        let conf = Config::deterministic(4, 0);
        let (committee, signers) = Committee::local(5);
        assert!(matches!(
            Ethereal::new(conf, Arc::new(committee), signers[0].clone()),
            Err(EtherealError::CommitteeMismatch { .. })
        ));
    }
}
