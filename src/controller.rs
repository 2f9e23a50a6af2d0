//! The controller facade tying the channel and the migration engine
//! together.
//!
//! Two locks serialize all interesting state: the channel mutex covers one
//! request/response round trip, the placement mutex covers a whole
//! find→migrate window so that admin-initiated debug migrations and the
//! placement loop never stomp each other's candidates. BIND/UNBIND take
//! only the channel mutex.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    candidates::{parse_batch, parse_switch_batch},
    channel::{ChannelError, KernelChannel, PlacementMode, Request},
    migration::MigrationEngine,
};

/// Collaborator retval signalling that NVRAM holds no more useful
/// candidates.
const RETVAL_NVRAM_EXHAUSTED: i32 = -2;

pub struct Controller {
    channel: Mutex<KernelChannel>,
    placement: Mutex<()>,
    engine: MigrationEngine,
    nvram_pull_disabled: AtomicBool,
}

impl Controller {
    pub fn new(channel: KernelChannel, engine: MigrationEngine) -> Controller {
        Controller {
            channel: Mutex::new(channel),
            placement: Mutex::new(()),
            engine,
            nvram_pull_disabled: AtomicBool::new(false),
        }
    }

    /// Asks the collaborator to start tracking `pid`.
    pub fn bind(&self, pid: i32) -> Result<(), ChannelError> {
        let records = self.channel.lock().request(Request::bind(pid))?;
        let reply = parse_batch(&records);
        if reply.retval == 0 {
            Ok(())
        } else {
            Err(ChannelError::Rejected(reply.retval))
        }
    }

    /// Asks the collaborator to stop tracking `pid`.
    pub fn unbind(&self, pid: i32) -> Result<(), ChannelError> {
        let records = self.channel.lock().request(Request::unbind(pid))?;
        let reply = parse_batch(&records);
        if reply.retval == 0 {
            Ok(())
        } else {
            Err(ChannelError::Rejected(reply.retval))
        }
    }

    /// Whether the sticky NVRAM-exhausted flag is set.
    pub fn nvram_pull_disabled(&self) -> bool {
        self.nvram_pull_disabled.load(Ordering::Acquire)
    }

    /// Takes the placement mutex. The switch sequence holds it across the
    /// access-bit clear, the settle sleep and the discovery that follows.
    pub fn placement_guard(&self) -> MutexGuard<'_, ()> {
        self.placement.lock()
    }

    /// Discovery plus migration under the placement mutex.
    pub fn find_and_migrate(&self, n: usize, mode: PlacementMode) -> usize {
        let _guard = self.placement_guard();
        self.find_and_migrate_locked(n, mode)
    }

    /// Discovery plus migration; the caller already holds the placement
    /// mutex. All recoverable failures are absorbed here and reported as
    /// zero migrated pages.
    pub fn find_and_migrate_locked(&self, n: usize, mode: PlacementMode) -> usize {
        let records = match self.channel.lock().request(Request::find(n, mode)) {
            Ok(records) => records,
            Err(e) => {
                warn!("find({:?}) failed: {}", mode, e);
                return 0;
            }
        };

        match mode {
            PlacementMode::NvramClear => 0,
            PlacementMode::Switch => {
                let batch = parse_switch_batch(&records);
                self.engine.migrate_switch(&batch)
            }
            single => {
                let batch = parse_batch(&records);
                if single == PlacementMode::NvramPull && batch.retval == RETVAL_NVRAM_EXHAUSTED {
                    info!("collaborator reports NVRAM exhausted; disabling NVRAM pulls");
                    self.nvram_pull_disabled.store(true, Ordering::Release);
                }
                if batch.candidates.is_empty() {
                    return 0;
                }
                let dest = match single.destination() {
                    Some(dest) => dest,
                    None => return 0,
                };
                let migrated = self.engine.migrate(&batch.candidates, dest);
                if migrated > 0 && self.nvram_pull_disabled.swap(false, Ordering::AcqRel) {
                    info!("migration succeeded; re-enabling NVRAM pulls");
                }
                migrated
            }
        }
    }
}
