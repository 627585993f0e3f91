//! The IPC map inside the IPC region.
//!
//! Both ends build an [`IpcMap`] over the same bytes; the [`Side`] decides
//! which channels it produces into and which it consumes from.

use crate::delay::Delay;
use crate::doorbell::{Direction, Doorbell};
use crate::event::EventChannel;
use crate::log_ring::LogRing;
use crate::memmap::{MemoryMap, RegionId};
use crate::ring::{DataChannel, EventSlot, RingLayout, ctrl};
use crate::window::SharedWindow;
use crate::{ChannelId, IpcError, MapFault};
use alloc::vec::Vec;
use chub_common::ipc::{self, area};
use chub_common::irq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Device,
}

/// What interrupt dispatch hands to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcEvent {
    /// The peer answered or sent an alive ping.
    Alive,
    /// An event descriptor was consumed.
    Code(u32),
}

/// Data-ready code of channel 0, the same value in both directions.
const DATA_READY: u32 = irq::HostEvent::Channel0 as u32;

mod debug_word {
    pub const EVENT: usize = 0;
    pub const VALUE_TO_HOST: usize = 4;
    pub const VALUE_TO_DEVICE: usize = 8;
}

pub struct IpcMap {
    side: Side,
    doorbell: Doorbell,
    debug: SharedWindow,
    data_tx: DataChannel,
    data_rx: DataChannel,
    events_tx: EventChannel,
    events_rx: EventChannel,
    log: LogRing,
}

impl IpcMap {
    /// Lays the channels over the IPC region of `map`. Shared memory is not
    /// modified; call [`IpcMap::init`] to zero it.
    pub fn new(map: &MemoryMap, doorbell: Doorbell, side: Side) -> Result<Self, IpcError> {
        let region = map.region(RegionId::Ipc).window();
        let sub = |offset: usize, len: usize| {
            region.slice(offset, len).ok_or(IpcError::MapInvalid(MapFault::IpcTooSmall {
                size: region.len(),
            }))
        };

        let data_to_host = DataChannel::new(
            ChannelId::DataToHost,
            sub(area::DATA_TO_HOST, ipc::DATA_CHANNEL_BYTES)?,
            RingLayout::data(),
        );
        let data_to_device = DataChannel::new(
            ChannelId::DataToDevice,
            sub(area::DATA_TO_DEVICE, ipc::DATA_CHANNEL_BYTES)?,
            RingLayout::data(),
        );
        let events_to_host = EventChannel::new(
            ChannelId::EventToHost,
            sub(area::EVENT_TO_HOST, ipc::EVENT_CHANNEL_BYTES)?,
            Direction::ToHost,
        );
        let events_to_device = EventChannel::new(
            ChannelId::EventToDevice,
            sub(area::EVENT_TO_DEVICE, ipc::EVENT_CHANNEL_BYTES)?,
            Direction::ToDevice,
        );
        let log = LogRing::new(
            sub(area::LOG, ipc::LOG_HEADER_BYTES)?,
            map.region(RegionId::Log).window().clone(),
        );
        let debug = sub(area::DEBUG, ipc::DEBUG_BYTES)?;

        let (data_tx, data_rx, events_tx, events_rx) = match side {
            Side::Host => (data_to_device, data_to_host, events_to_device, events_to_host),
            Side::Device => (data_to_host, data_to_device, events_to_host, events_to_device),
        };
        Ok(Self {
            side,
            doorbell,
            debug,
            data_tx,
            data_rx,
            events_tx,
            events_rx,
            log,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn doorbell(&self) -> &Doorbell {
        &self.doorbell
    }

    pub fn log(&self) -> &LogRing {
        &self.log
    }

    pub fn data_tx(&self) -> &DataChannel {
        &self.data_tx
    }

    pub fn data_rx(&self) -> &DataChannel {
        &self.data_rx
    }

    pub fn events_tx(&self) -> &EventChannel {
        &self.events_tx
    }

    pub fn events_rx(&self) -> &EventChannel {
        &self.events_rx
    }

    /// Direction this side raises lines in.
    pub fn tx_direction(&self) -> Direction {
        self.events_tx.direction()
    }

    /// Direction this side receives lines in.
    pub fn rx_direction(&self) -> Direction {
        self.events_rx.direction()
    }

    /// Zeroes every index, invalidates every event slot and publishes the
    /// log ring size.
    pub fn init(&self) {
        self.data_tx.reset();
        self.data_rx.reset();
        self.events_tx.reset();
        self.events_rx.reset();
        self.debug.fill(0, ipc::DEBUG_BYTES, 0);
        self.log.init();
    }

    /// Whether the map still looks the way [`IpcMap::init`] left it.
    pub fn check_reset_valid(&self) -> bool {
        let (write, read) = self.log.indices();
        self.data_tx.is_pristine()
            && self.data_rx.is_pristine()
            && self.events_tx.ring().is_pristine()
            && self.events_rx.ring().is_pristine()
            && write == 0
            && read == 0
    }

    /// Queues `payload` on the outgoing data channel and signals it.
    ///
    /// If signalling fails the payload stays queued; the peer picks it up
    /// with the next successful event.
    pub fn write_data(&self, payload: &[u8], delay: &dyn Delay) -> Result<(), IpcError> {
        self.data_tx.enqueue(payload)?;
        self.add_event(DATA_READY, delay)
    }

    pub fn read_data(&self) -> Result<Option<Vec<u8>>, IpcError> {
        self.data_rx.dequeue()
    }

    pub fn add_event(&self, code: u32, delay: &dyn Delay) -> Result<(), IpcError> {
        self.events_tx.add_event(code, &self.doorbell, delay)
    }

    pub fn get_event(&self) -> Result<Option<EventSlot>, IpcError> {
        self.events_rx.get_event()
    }

    /// Acknowledges the alive line if it is deliverable.
    pub fn take_alive(&self) -> bool {
        let rx = self.rx_direction();
        if self.doorbell.status(rx) & (1 << irq::ALIVE_LINE) == 0 {
            return false;
        }
        self.doorbell.ack(rx, irq::ALIVE_LINE);
        true
    }

    /// Consumes one event per deliverable line and hands each to `handler`.
    ///
    /// Never waits. Returns the number of events handled, or the first
    /// disagreement between the doorbell and the event channel.
    pub fn dispatch(&self, handler: &mut dyn FnMut(IpcEvent)) -> Result<usize, IpcError> {
        let rx = self.rx_direction();
        let mut pending = self.doorbell.status(rx);
        let mut handled = 0;

        let alive = 1 << irq::ALIVE_LINE;
        if pending & alive != 0 {
            self.doorbell.ack(rx, irq::ALIVE_LINE);
            pending &= !alive;
            handler(IpcEvent::Alive);
            handled += 1;
        }

        while pending != 0 {
            let Some(slot) = self.events_rx.get_event()? else {
                log::error!("{}: empty with pending {:#06x}", self.events_rx.id(), pending);
                return Err(IpcError::EventQueueEmpty { pending });
            };
            if slot.line >= irq::EVENT_LINES || pending & (1 << slot.line) == 0 {
                log::error!(
                    "{}: event {} on line {} but pending {:#06x}",
                    self.events_rx.id(),
                    slot.code,
                    slot.line,
                    pending
                );
                return Err(IpcError::EventQueueMismatch {
                    line: slot.line,
                    pending,
                });
            }
            self.doorbell.ack(rx, slot.line);
            pending &= !(1 << slot.line);
            handler(IpcEvent::Code(slot.code));
            handled += 1;
        }
        Ok(handled)
    }

    /// Posts a debug word and this side's argument, then raises a debug event.
    pub fn post_debug(&self, code: u32, arg: u32, event: u32, delay: &dyn Delay) -> Result<(), IpcError> {
        self.debug.write_u32(debug_word::EVENT, code);
        self.debug.write_u32(self.value_word(self.tx_direction()), arg);
        self.add_event(event, delay)
    }

    /// Reads the debug word and the peer's argument.
    pub fn read_debug(&self) -> (u32, u32) {
        (
            self.debug.read_u32(debug_word::EVENT),
            self.debug.read_u32(self.value_word(self.rx_direction())),
        )
    }

    fn value_word(&self, dir: Direction) -> usize {
        match dir {
            Direction::ToHost => debug_word::VALUE_TO_HOST,
            Direction::ToDevice => debug_word::VALUE_TO_DEVICE,
        }
    }

    /// Logs the state of every ring.
    pub fn dump(&self) {
        let rings = [
            (self.data_tx.id(), self.data_tx.read_ctrl(ctrl::EQ), self.data_tx.read_ctrl(ctrl::DQ)),
            (self.data_rx.id(), self.data_rx.read_ctrl(ctrl::EQ), self.data_rx.read_ctrl(ctrl::DQ)),
            (
                self.events_tx.id(),
                self.events_tx.ring().read_ctrl(ctrl::EQ),
                self.events_tx.ring().read_ctrl(ctrl::DQ),
            ),
            (
                self.events_rx.id(),
                self.events_rx.ring().read_ctrl(ctrl::EQ),
                self.events_rx.ring().read_ctrl(ctrl::DQ),
            ),
        ];
        for (id, eq, dq) in rings {
            log::info!("{:>10}: eq {:2} dq {:2}", id, eq, dq);
        }
        let (write, read) = self.log.indices();
        log::info!("{:>10}: write {} read {} size {}", "log", write, read, self.log.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::testing::StepClock;
    use crate::doorbell::LoopbackBank;
    use crate::memmap::BootDescriptor;
    use alloc::sync::Arc;
    use alloc::vec;

    struct Pair {
        host: IpcMap,
        device: IpcMap,
        clock: StepClock,
    }

    fn pair() -> Pair {
        let desc = BootDescriptor {
            version: ipc::IPC_VERSION,
            bootloader: (0, 0x1000),
            code: (0x1000, 0x2000),
            ipc: (0x2000, 0xa000),
            ram: (0xa000, 0xb000),
            shared: (0xb000, 0xc000),
            dump: (0, 0xc000),
            clock_hz: 0,
            boot_mode: 0,
            kernel_log: 0,
        };
        let window = SharedWindow::allocate(0xc000);
        window.write_bytes(ipc::MAP_INFO_OFFSET, &desc.encode());
        let map = MemoryMap::resolve(&window).unwrap();
        let doorbell = Doorbell::new(Arc::new(LoopbackBank::new()));
        let host = IpcMap::new(&map, doorbell.clone(), Side::Host).unwrap();
        let device = IpcMap::new(&map, doorbell, Side::Device).unwrap();
        host.init();
        Pair {
            host,
            device,
            clock: StepClock::default(),
        }
    }

    #[test]
    fn init_leaves_a_valid_map() {
        let p = pair();
        assert!(p.host.check_reset_valid());
        p.host.write_data(b"x", &p.clock).unwrap();
        assert!(!p.host.check_reset_valid());
        p.host.init();
        assert!(p.device.check_reset_valid());
    }

    #[test]
    fn data_reaches_the_peer_through_dispatch() {
        let p = pair();
        p.host.write_data(b"hello", &p.clock).unwrap();

        let mut seen = vec![];
        let handled = p.device.dispatch(&mut |ev| seen.push(ev)).unwrap();
        assert_eq!(handled, 1);
        assert_eq!(seen, [IpcEvent::Code(irq::HostEvent::Channel0 as u32)]);
        assert_eq!(p.device.read_data().unwrap().unwrap(), b"hello");
        assert_eq!(p.device.doorbell().raw_status(Direction::ToDevice), 0);
    }

    #[test]
    fn alive_is_handled_out_of_band() {
        let p = pair();
        p.device.doorbell().raise(Direction::ToHost, irq::ALIVE_LINE);
        let mut seen = vec![];
        assert_eq!(p.host.dispatch(&mut |ev| seen.push(ev)).unwrap(), 1);
        assert_eq!(seen, [IpcEvent::Alive]);
    }

    #[test]
    fn pending_line_without_descriptor_is_empty_queue() {
        let p = pair();
        p.device.doorbell().raise(Direction::ToHost, 2);
        assert_eq!(
            p.host.dispatch(&mut |_| {}),
            Err(IpcError::EventQueueEmpty { pending: 1 << 2 })
        );
    }

    #[test]
    fn descriptor_on_another_line_is_a_mismatch() {
        let p = pair();
        p.device.add_event(irq::DeviceEvent::WakeAssert as u32, &p.clock).unwrap();
        p.device.doorbell().clear_all(Direction::ToHost);
        p.device.doorbell().raise(Direction::ToHost, 7);
        assert_eq!(
            p.host.dispatch(&mut |_| {}),
            Err(IpcError::EventQueueMismatch {
                line: 0,
                pending: 1 << 7
            })
        );
    }

    #[test]
    fn corrupted_event_index_surfaces_from_dispatch() {
        let p = pair();
        p.host.events_rx().ring().write_ctrl(ctrl::DQ, ipc::EVENT_SLOTS);
        p.device.doorbell().raise(Direction::ToHost, 0);
        assert!(matches!(
            p.host.dispatch(&mut |_| {}),
            Err(IpcError::IndexCorruption { .. })
        ));
    }

    #[test]
    fn debug_words_cross_sides() {
        let p = pair();
        p.host
            .post_debug(10, 0x55, irq::HostEvent::Debug as u32, &p.clock)
            .unwrap();
        assert_eq!(p.device.read_debug(), (10, 0x55));
        let mut seen = vec![];
        p.device.dispatch(&mut |ev| seen.push(ev)).unwrap();
        assert_eq!(seen, [IpcEvent::Code(irq::HostEvent::Debug as u32)]);
    }

    #[test]
    fn take_alive_consumes_only_the_alive_line() {
        let p = pair();
        let db = p.host.doorbell();
        db.raise(Direction::ToHost, irq::ALIVE_LINE);
        db.raise(Direction::ToHost, 1);
        assert!(p.host.take_alive());
        assert!(!p.host.take_alive());
        assert!(db.is_pending(Direction::ToHost, 1));
    }
}
