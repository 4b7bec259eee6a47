use std::sync::Arc;

use log::{debug, trace};

use crate::clock::lt_clock;
use crate::config::{MAX_OPERAND_SIZE, OPLOG_HIGH_MARK_PCT, OPLOG_LOW_MARK_PCT};
use crate::errors::{Result, ZurvanError};
use crate::nvlog::{NvEntry, NvLog};
use crate::nvm::{NvPool, SegmentInfo, SegmentKind};

/// One decoded logical operation, as replayed by recovery.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub local_clk: u64,
    pub wrt_clk: u64,
    pub op_type: u64,
    pub operand: Vec<u8>,
}

/// Per-thread durable log of logical operations. Entries exist purely so
/// recovery can replay committed transactions newer than the last
/// checkpoint; they carry no object data themselves.
pub struct OpLog {
    log: NvLog,
    high_mark: u64,
    low_mark: u64,
}

/// `reclaim` policy: normal honors the checkpoint boundary, force drains
/// everything (shutdown/zombie paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpReclaim {
    Normal,
    Force,
}

impl OpLog {
    pub fn create(pool: Arc<NvPool>, owner: u32, size: u64) -> Result<OpLog> {
        let log = NvLog::create(pool, SegmentKind::OpLog, owner, size)?;
        Ok(Self::with_log(log))
    }

    pub fn from_segment(pool: Arc<NvPool>, info: &SegmentInfo) -> OpLog {
        Self::with_log(NvLog::from_segment(pool, info))
    }

    fn with_log(log: NvLog) -> OpLog {
        let size = log.size();
        OpLog {
            log,
            high_mark: size * OPLOG_HIGH_MARK_PCT as u64 / 100,
            low_mark: size * OPLOG_LOW_MARK_PCT as u64 / 100,
        }
    }

    pub fn used(&self) -> u64 {
        self.log.used()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Appends one operation record. Not durable until `enqueue_persist`.
    pub fn enqueue(
        &mut self,
        local_clk: u64,
        wrt_clk: u64,
        op_type: u64,
        operand: &[u8],
    ) -> Result<()> {
        if operand.len() > MAX_OPERAND_SIZE {
            return Err(ZurvanError::LogCapacity(format!(
                "operand of {} bytes exceeds the {MAX_OPERAND_SIZE} byte limit",
                operand.len()
            )));
        }
        let mut payload = Vec::with_capacity(16 + operand.len());
        payload.extend_from_slice(&local_clk.to_le_bytes());
        payload.extend_from_slice(&op_type.to_le_bytes());
        payload.extend_from_slice(operand);
        self.log.enqueue(wrt_clk, &payload)?;
        Ok(())
    }

    pub fn enqueue_persist(&mut self) {
        self.log.enqueue_persist();
    }

    /// Retires entries already covered by the checkpoint at
    /// `last_ckpt_clk` (or all of them under `Force`), stopping early once
    /// usage drops under the low-water mark. Returns the bytes reclaimed.
    pub fn reclaim(&mut self, mode: OpReclaim, last_ckpt_clk: u64) -> u64 {
        let old_head_cnt = self.log.head_cnt;
        // Early-stop at the low mark only applies when reclaim started
        // above it; freeing enough is the goal, not emptying the log.
        let stop_at_low = self.used() >= self.low_mark;
        while let Some(entry) = self.log.peek_head() {
            // Entries are ordered by write clock; the first survivor ends
            // the scan.
            if mode != OpReclaim::Force && !lt_clock(entry.wrt_clk, last_ckpt_clk) {
                break;
            }
            self.log.dequeue();
            if mode != OpReclaim::Force && stop_at_low && self.used() < self.low_mark {
                trace!("oplog[{}] reached low mark: {}", self.log.slot(), self.used());
                break;
            }
        }
        let reclaimed = self.log.head_cnt - old_head_cnt;
        if reclaimed != 0 {
            self.log.dequeue_persist();
            debug!(
                "oplog[{}]: {} bytes reclaimed (h={}, t={})",
                self.log.slot(),
                reclaimed,
                self.log.head_cnt,
                self.log.tail_cnt
            );
        }
        reclaimed
    }

    /// Opportunistic reclaim when past the high-water mark. Returns true
    /// when the caller must request a transient-log checkpoint because
    /// reclamation alone could not get below the mark: operation entries
    /// cannot be freed until their effects are durably checkpointed.
    pub fn needs_checkpoint(&mut self, last_ckpt_clk: u64) -> bool {
        if self.used() >= self.high_mark {
            self.reclaim(OpReclaim::Normal, last_ckpt_clk);
            if self.used() >= self.high_mark {
                return true;
            }
        }
        false
    }

    /// Decodes every live record, oldest first. Recovery's input.
    pub fn records(&self) -> Vec<OpRecord> {
        self.log.entries().iter().map(decode).collect()
    }

    pub fn reset(&mut self) {
        self.log.reset();
    }

    pub fn destroy(self) {
        self.log.destroy();
    }
}

fn decode(entry: &NvEntry) -> OpRecord {
    let local_clk = u64::from_le_bytes(entry.payload[0..8].try_into().unwrap_or([0; 8]));
    let op_type = u64::from_le_bytes(entry.payload[8..16].try_into().unwrap_or([0; 8]));
    OpRecord {
        local_clk,
        wrt_clk: entry.wrt_clk,
        op_type,
        operand: entry.payload[16..].to_vec(),
    }
}
