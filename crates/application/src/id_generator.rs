//! 消息 ID 生成器
//!
//! 64 位结构化 ID，从高位到低位依次是：
//! 1 位符号位（恒为 0）| 41 位毫秒时间偏移 | 10 位机器号 | 12 位序列号。
//! 同一毫秒内的序列号用完时会自旋等待下一毫秒，不会产生重复 ID。

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{NaiveDate, NaiveTime};
use domain::MessageId;
use thiserror::Error;

use crate::clock::Clock;

const TIMESTAMP_BITS: u32 = 41;
const MACHINE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_MACHINE_ID: u16 = (1 << MACHINE_BITS) - 1;
const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TICK: i64 = (1 << TIMESTAMP_BITS) - 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdGeneratorError {
    #[error("invalid epoch: {0}")]
    InvalidEpoch(String),
    #[error("machine id {0} exceeds {MAX_MACHINE_ID}")]
    InvalidMachineId(u16),
    #[error("timestamp no longer fits in {TIMESTAMP_BITS} bits")]
    ClockOverflow,
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Result<MessageId, IdGeneratorError>;
}

#[derive(Debug, Default)]
struct State {
    last_tick: i64,
    sequence: u16,
}

/// 基于时间戳的 ID 生成器，进程内可并发调用。
pub struct SnowflakeGenerator {
    epoch_ms: i64,
    machine_id: u16,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    pub fn new(
        epoch: NaiveDate,
        machine_id: u16,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IdGeneratorError> {
        if machine_id > MAX_MACHINE_ID {
            return Err(IdGeneratorError::InvalidMachineId(machine_id));
        }
        let epoch_ms = epoch
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_millis();
        if epoch_ms > clock.now().timestamp_millis() {
            return Err(IdGeneratorError::InvalidEpoch(format!(
                "{epoch} is in the future"
            )));
        }
        Ok(Self {
            epoch_ms,
            machine_id,
            clock,
            state: Mutex::new(State::default()),
        })
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    fn current_tick(&self) -> i64 {
        self.clock.now().timestamp_millis() - self.epoch_ms
    }

    /// 等到时钟进入 `last` 之后的下一毫秒。
    /// 时钟落后于 `last`（被回拨）时直接借用下一毫秒。
    fn wait_next_tick(&self, last: i64) -> i64 {
        loop {
            let now = self.current_tick();
            if now > last {
                return now;
            }
            if now < last {
                return last + 1;
            }
            std::thread::yield_now();
        }
    }
}

impl IdGenerator for SnowflakeGenerator {
    fn next_id(&self) -> Result<MessageId, IdGeneratorError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // 时钟回拨时沿用上一次的毫秒数，保证单调
        let mut tick = self.current_tick().max(state.last_tick);
        if tick == state.last_tick {
            if state.sequence == MAX_SEQUENCE {
                tick = self.wait_next_tick(state.last_tick);
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }

        if tick > MAX_TICK {
            return Err(IdGeneratorError::ClockOverflow);
        }
        state.last_tick = tick;

        let id = ((tick as u64) << (MACHINE_BITS + SEQUENCE_BITS))
            | ((self.machine_id as u64) << SEQUENCE_BITS)
            | state.sequence as u64;
        Ok(MessageId(id))
    }
}

/// 拆出 ID 的 (毫秒偏移, 机器号, 序列号)
pub fn decompose(id: MessageId) -> (u64, u16, u16) {
    let raw = id.as_u64();
    let tick = raw >> (MACHINE_BITS + SEQUENCE_BITS);
    let machine = ((raw >> SEQUENCE_BITS) & MAX_MACHINE_ID as u64) as u16;
    let sequence = (raw & MAX_SEQUENCE as u64) as u16;
    (tick, machine, sequence)
}
