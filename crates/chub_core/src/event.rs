//! Event channels.
//!
//! An event is a small descriptor naming what happened plus the doorbell
//! line raised for it. The producer rotates over the event lines so several
//! events can be outstanding at once; a line that is still pending from an
//! earlier event is never reused until the peer acknowledged it.

use crate::delay::Delay;
use crate::doorbell::{Direction, Doorbell};
use crate::ring::{EventSlot, RingChannel, RingLayout, SlotState, ctrl};
use crate::sync::SpinLock;
use crate::window::SharedWindow;
use crate::{ChannelId, IpcError};
use chub_common::{irq, timing};

pub struct EventChannel {
    ring: RingChannel<EventSlot>,
    /// Direction in which events on this channel are signalled.
    direction: Direction,
    producer: SpinLock<()>,
}

impl EventChannel {
    pub fn new(id: ChannelId, window: SharedWindow, direction: Direction) -> Self {
        Self {
            ring: RingChannel::new(id, window, RingLayout::event()),
            direction,
            producer: SpinLock::new(()),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.ring.id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn ring(&self) -> &RingChannel<EventSlot> {
        &self.ring
    }

    /// Clears the ring and marks every slot consumed.
    pub fn reset(&self) {
        for index in 0..self.ring.capacity() {
            let offset = index as usize * chub_common::ipc::EVENT_SLOT_STRIDE;
            self.ring.window().write_u32(offset, 0);
            self.ring.window().write_u32(offset + 4, 0);
            self.ring.window().write_u32(offset + 8, chub_common::ipc::SLOT_DEQUEUED);
        }
        self.ring.reset();
        self.ring.write_ctrl(ctrl::LINE, 0);
    }

    /// Queues `code` and raises the next free line towards the peer.
    ///
    /// A full channel is retried with a short backoff; a still-pending line
    /// is polled the same way. Index corruption is reported before any
    /// register is touched.
    pub fn add_event(&self, code: u32, doorbell: &Doorbell, delay: &dyn Delay) -> Result<(), IpcError> {
        self.ring.indices()?;

        let mut full_tries = 0;
        let mut stale_tries = 0;
        let line = loop {
            let guard = self.producer.lock();
            if self.ring.is_full()? {
                drop(guard);
                full_tries += 1;
                if full_tries > timing::EVENT_MAX_TRIES {
                    log::warn!("{}: full, dropping event {}", self.id(), code);
                    return Err(IpcError::EventQueueFull { channel: self.id() });
                }
                delay.delay_ms(timing::EVENT_WAIT_MS);
                continue;
            }

            let line = self.ring.read_ctrl(ctrl::LINE) % irq::EVENT_LINES;
            if doorbell.is_pending(self.direction, line) {
                drop(guard);
                stale_tries += 1;
                if stale_tries > timing::EVENT_MAX_TRIES {
                    log::error!("{}: line {} never acknowledged", self.id(), line);
                    return Err(IpcError::StalePendingIrq { line });
                }
                delay.delay_ms(timing::EVENT_WAIT_MS);
                continue;
            }

            let slot = EventSlot {
                code,
                line,
                state: SlotState::Enqueued,
            };
            self.ring.enqueue(&slot).map_err(|err| match err {
                IpcError::QueueFull { channel } => IpcError::EventQueueFull { channel },
                other => other,
            })?;
            self.ring.write_ctrl(ctrl::LINE, (line + 1) % irq::EVENT_LINES);
            break line;
        };

        doorbell.write_debug_value(delay.now_ms());
        doorbell.raise(self.direction, line);
        Ok(())
    }

    /// Pops the oldest event.
    pub fn get_event(&self) -> Result<Option<EventSlot>, IpcError> {
        self.ring.dequeue()
    }
}
