use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ids::authority::IdAuthority;
use crate::ids::block::IdBlock;
use crate::ids::options::IdPoolOptions;
use crate::types::{ClaimError, IdNamespace, PartitionId, Result};

/// Ids left in the current block below which renewal always starts.
const RENEW_ID_COUNT: u64 = 100;

enum NextBlock {
    Idle,
    Pending(Receiver<Result<IdBlock>>),
    Ready(IdBlock),
}

struct PoolState {
    current: IdBlock,
    offset: u64,
    next: NextBlock,
    exhausted: bool,
}

/// Hands out single ids for one `(partition, namespace)` scope from blocks
/// obtained through an [`IdAuthority`].
///
/// When the current block runs low the next one is fetched on a background
/// thread, so callers rarely wait on the lock protocol.
pub struct StandardIdPool {
    authority: Arc<dyn IdAuthority>,
    partition: PartitionId,
    namespace: IdNamespace,
    opts: IdPoolOptions,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

impl StandardIdPool {
    pub fn new(
        authority: Arc<dyn IdAuthority>,
        partition: PartitionId,
        namespace: IdNamespace,
        opts: IdPoolOptions,
    ) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            authority,
            partition,
            namespace,
            opts,
            state: Mutex::new(PoolState {
                current: IdBlock::new(0, 0),
                offset: 0,
                next: NextBlock::Idle,
                exhausted: false,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn namespace(&self) -> IdNamespace {
        self.namespace
    }

    /// Whether the authority has reported this scope exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.state.lock().exhausted
    }

    /// Returns the next unused id of this scope.
    pub fn next_id(&self) -> Result<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClaimError::Invalid("id pool is closed"));
        }
        let mut state = self.state.lock();
        loop {
            if state.exhausted {
                return Err(ClaimError::PoolExhausted(format!(
                    "partition {} namespace {} is exhausted",
                    self.partition, self.namespace
                )));
            }
            if state.offset < state.current.len() {
                let id = state.current.get(state.offset)?;
                state.offset += 1;
                let remaining = state.current.len() - state.offset;
                if remaining < self.renew_threshold(&state.current)
                    && matches!(state.next, NextBlock::Idle)
                {
                    state.next = NextBlock::Pending(self.start_renewal());
                }
                return Ok(id);
            }
            match self.take_next_block(&mut state) {
                Ok(block) => {
                    debug!(
                        partition = self.partition,
                        namespace = self.namespace,
                        block = %block,
                        "pool.block.installed"
                    );
                    state.current = block;
                    state.offset = 0;
                }
                Err(err) if err.is_exhausted() => {
                    info!(
                        partition = self.partition,
                        namespace = self.namespace,
                        "pool.exhausted"
                    );
                    state.exhausted = true;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn renew_threshold(&self, block: &IdBlock) -> u64 {
        let pct = (block.len() as f64 * self.opts.renew_buffer_percentage) as u64;
        pct.max(RENEW_ID_COUNT)
    }

    fn take_next_block(&self, state: &mut PoolState) -> Result<IdBlock> {
        let rx = match std::mem::replace(&mut state.next, NextBlock::Idle) {
            NextBlock::Ready(block) => return Ok(block),
            NextBlock::Pending(rx) => rx,
            NextBlock::Idle => self.start_renewal(),
        };
        match rx.recv_timeout(self.opts.renew_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    partition = self.partition,
                    namespace = self.namespace,
                    timeout_ms = self.opts.renew_timeout.as_millis() as u64,
                    "pool.renewal.timeout"
                );
                Err(ClaimError::Timeout(self.opts.renew_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClaimError::Interrupted),
        }
    }

    fn start_renewal(&self) -> Receiver<Result<IdBlock>> {
        let (tx, rx) = mpsc::channel();
        let authority = self.authority.clone();
        let (partition, namespace) = (self.partition, self.namespace);
        let timeout = self.opts.renew_timeout;
        let spawned = thread::Builder::new()
            .name(format!("keyclaim-idpool-{partition}-{namespace}"))
            .spawn(move || {
                let result = authority.get_id_block(partition, namespace, timeout);
                // the pool may have stopped waiting
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "pool.renewal.spawn_failed");
            let (tx, rx) = mpsc::channel();
            let _ = tx.send(Err(ClaimError::Io(err)));
            return rx;
        }
        rx
    }

    /// Stops handing out ids. A renewal in flight finishes on its own and its
    /// block is discarded.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.state.lock().next = NextBlock::Idle;
    }
}
