//! Boot descriptor parsing and region lookup.
//!
//! The bootloader image carries a descriptor at [`ipc::MAP_INFO_OFFSET`]
//! listing where every region of the co-processor's memory lives. All
//! addresses are offsets from the start of the shared window.

use crate::window::SharedWindow;
use crate::{IpcError, MapFault};
use chub_common::ipc::{self, bootargs};
use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32};
use nom::sequence::{pair, tuple};

/// Named regions of the shared window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionId {
    Bootloader,
    BootArgs,
    Os,
    Ipc,
    Ram,
    Shared,
    Dump,
    /// Byte area of the log ring inside the IPC region.
    Log,
    /// Persist buffer at the tail of the IPC region.
    Persist,
}

impl RegionId {
    pub const ALL: [RegionId; 9] = [
        Self::Bootloader,
        Self::BootArgs,
        Self::Os,
        Self::Ipc,
        Self::Ram,
        Self::Shared,
        Self::Dump,
        Self::Log,
        Self::Persist,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Bootloader => "bootloader",
            Self::BootArgs => "bootargs",
            Self::Os => "os",
            Self::Ipc => "ipc",
            Self::Ram => "ram",
            Self::Shared => "shared",
            Self::Dump => "dump",
            Self::Log => "log",
            Self::Persist => "persist",
        }
    }
}

/// One resolved region.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub id: RegionId,
    /// Offset from the start of the shared window.
    pub offset: usize,
    pub size: usize,
    window: SharedWindow,
}

impl MemoryRegion {
    pub fn window(&self) -> &SharedWindow {
        &self.window
    }
}

/// Decoded boot descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDescriptor {
    pub version: u32,
    pub bootloader: (u32, u32),
    pub code: (u32, u32),
    pub ipc: (u32, u32),
    pub ram: (u32, u32),
    pub shared: (u32, u32),
    pub dump: (u32, u32),
    pub clock_hz: u32,
    pub boot_mode: u16,
    pub kernel_log: u16,
}

fn range(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    pair(le_u32, le_u32)(input)
}

fn descriptor(input: &[u8]) -> IResult<&[u8], (&[u8], BootDescriptor)> {
    let (input, magic) = take(ipc::MAGIC_LEN)(input)?;
    let (input, version) = le_u32(input)?;
    let (input, (bootloader, code, ipc, ram, shared, dump)) =
        tuple((range, range, range, range, range, range))(input)?;
    let (input, (clock_hz, boot_mode, kernel_log)) = tuple((le_u32, le_u16, le_u16))(input)?;
    Ok((
        input,
        (
            magic,
            BootDescriptor {
                version,
                bootloader,
                code,
                ipc,
                ram,
                shared,
                dump,
                clock_hz,
                boot_mode,
                kernel_log,
            },
        ),
    ))
}

impl BootDescriptor {
    /// Decodes and validates the raw descriptor bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, MapFault> {
        let (_, (magic, desc)) = descriptor(raw).map_err(|_| MapFault::Malformed)?;
        let (text, padding) = magic.split_at(ipc::MAGIC.len());
        if text != ipc::MAGIC || padding.iter().any(|&b| b != 0) {
            return Err(MapFault::BadMagic);
        }
        if desc.version != ipc::IPC_VERSION {
            return Err(MapFault::Version {
                found: desc.version,
                expected: ipc::IPC_VERSION,
            });
        }
        Ok(desc)
    }

    /// Encodes the descriptor, magic included.
    pub fn encode(&self) -> [u8; bootargs::SIZE] {
        let mut out = [0u8; bootargs::SIZE];
        out[..ipc::MAGIC.len()].copy_from_slice(ipc::MAGIC);
        let words = [
            (bootargs::VERSION, self.version),
            (bootargs::BL_START, self.bootloader.0),
            (bootargs::BL_END, self.bootloader.1),
            (bootargs::CODE_START, self.code.0),
            (bootargs::CODE_END, self.code.1),
            (bootargs::IPC_START, self.ipc.0),
            (bootargs::IPC_END, self.ipc.1),
            (bootargs::RAM_START, self.ram.0),
            (bootargs::RAM_END, self.ram.1),
            (bootargs::SHARED_START, self.shared.0),
            (bootargs::SHARED_END, self.shared.1),
            (bootargs::DUMP_START, self.dump.0),
            (bootargs::DUMP_END, self.dump.1),
            (bootargs::CLOCK_HZ, self.clock_hz),
        ];
        for (offset, value) in words {
            out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        out[bootargs::BOOT_MODE..bootargs::BOOT_MODE + 2].copy_from_slice(&self.boot_mode.to_le_bytes());
        out[bootargs::KERNEL_LOG..bootargs::KERNEL_LOG + 2].copy_from_slice(&self.kernel_log.to_le_bytes());
        out
    }
}

/// All regions of one shared window.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    window: SharedWindow,
    descriptor: BootDescriptor,
    regions: [MemoryRegion; 9],
}

impl MemoryMap {
    /// Reads the boot descriptor from `window` and resolves every region.
    ///
    /// Resolving the same window twice yields the same map.
    pub fn resolve(window: &SharedWindow) -> Result<Self, IpcError> {
        Self::resolve_inner(window).map_err(|fault| {
            log::error!("memory map: {}", fault);
            IpcError::MapInvalid(fault)
        })
    }

    fn resolve_inner(window: &SharedWindow) -> Result<Self, MapFault> {
        if window.len() < ipc::MAP_INFO_OFFSET + bootargs::SIZE {
            return Err(MapFault::Truncated);
        }
        let mut raw = [0u8; bootargs::SIZE];
        window.read_bytes(ipc::MAP_INFO_OFFSET, &mut raw);
        let desc = BootDescriptor::parse(&raw)?;

        let region = |id: RegionId, (start, end): (u32, u32)| -> Result<MemoryRegion, MapFault> {
            let fault = MapFault::Range {
                region: id.name(),
                start,
                end,
            };
            if end < start {
                return Err(fault);
            }
            let offset = start as usize;
            let size = (end - start) as usize;
            let sub = window.slice(offset, size).ok_or(fault)?;
            Ok(MemoryRegion {
                id,
                offset,
                size,
                window: sub,
            })
        };

        let bootloader = region(RegionId::Bootloader, desc.bootloader)?;
        let os = region(RegionId::Os, desc.code)?;
        let ipc_region = region(RegionId::Ipc, desc.ipc)?;
        let ram = region(RegionId::Ram, desc.ram)?;
        let shared = region(RegionId::Shared, desc.shared)?;
        let dump = region(RegionId::Dump, desc.dump)?;

        let reserved = ipc::area::MAP_BYTES + ipc::PERSIST_BUF_SIZE;
        if ipc_region.size <= reserved {
            return Err(MapFault::IpcTooSmall {
                size: ipc_region.size,
            });
        }
        let log_size = ipc_region.size - reserved;
        let log_offset = ipc_region.offset + ipc::area::LOG_DATA;
        let persist_offset = log_offset + log_size;
        let span = |id: RegionId, offset: usize, size: usize| -> Result<MemoryRegion, MapFault> {
            let fault = MapFault::Range {
                region: id.name(),
                start: offset as u32,
                end: (offset + size) as u32,
            };
            Ok(MemoryRegion {
                id,
                offset,
                size,
                window: window.slice(offset, size).ok_or(fault)?,
            })
        };
        let boot_args = span(RegionId::BootArgs, ipc::MAP_INFO_OFFSET, bootargs::SIZE)?;
        let log = span(RegionId::Log, log_offset, log_size)?;
        let persist = span(RegionId::Persist, persist_offset, ipc::PERSIST_BUF_SIZE)?;

        Ok(Self {
            window: window.clone(),
            descriptor: desc,
            regions: [bootloader, boot_args, os, ipc_region, ram, shared, dump, log, persist],
        })
    }

    pub fn region(&self, id: RegionId) -> &MemoryRegion {
        &self.regions[id as usize]
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    pub fn descriptor(&self) -> &BootDescriptor {
        &self.descriptor
    }

    pub fn window(&self) -> &SharedWindow {
        &self.window
    }

    /// Size of the log ring byte area.
    pub fn log_size(&self) -> usize {
        self.region(RegionId::Log).size
    }

    /// Updates the runtime fields of the descriptor in place.
    pub fn write_boot_args(&self, clock_hz: u32, boot_mode: u16, kernel_log: bool) {
        let args = self.region(RegionId::BootArgs).window();
        args.write_u32(bootargs::CLOCK_HZ, clock_hz);
        args.write_u16(bootargs::BOOT_MODE, boot_mode);
        args.write_u16(bootargs::KERNEL_LOG, kernel_log as u16);
    }

    /// Reads back the runtime fields: clock rate, boot mode, kernel log flag.
    pub fn read_boot_args(&self) -> (u32, u16, bool) {
        let args = self.region(RegionId::BootArgs).window();
        (
            args.read_u32(bootargs::CLOCK_HZ),
            args.read_u16(bootargs::BOOT_MODE),
            args.read_u16(bootargs::KERNEL_LOG) != 0,
        )
    }

    /// Logs every region.
    pub fn dump(&self) {
        for region in &self.regions {
            log::info!(
                "{:>10}: {:#07x}..{:#07x} ({} bytes)",
                region.id.name(),
                region.offset,
                region.offset + region.size,
                region.size
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPC_SIZE: u32 = 0x8000;

    fn descriptor() -> BootDescriptor {
        BootDescriptor {
            version: ipc::IPC_VERSION,
            bootloader: (0, 0x1000),
            code: (0x1000, 0x9000),
            ipc: (0x9000, 0x9000 + IPC_SIZE),
            ram: (0x11000, 0x19000),
            shared: (0x19000, 0x1a000),
            dump: (0, 0x1a000),
            clock_hz: 0,
            boot_mode: 0,
            kernel_log: 0,
        }
    }

    fn window_with(desc: &BootDescriptor) -> SharedWindow {
        let window = SharedWindow::allocate(0x1a000);
        window.write_bytes(ipc::MAP_INFO_OFFSET, &desc.encode());
        window
    }

    #[test]
    fn resolves_every_region() {
        let desc = descriptor();
        let map = MemoryMap::resolve(&window_with(&desc)).unwrap();
        assert_eq!(map.descriptor(), &desc);

        let ipc_region = map.region(RegionId::Ipc);
        assert_eq!((ipc_region.offset, ipc_region.size), (0x9000, IPC_SIZE as usize));
        let expected_log = IPC_SIZE as usize - ipc::area::MAP_BYTES - ipc::PERSIST_BUF_SIZE;
        assert_eq!(map.log_size(), expected_log);
        let persist = map.region(RegionId::Persist);
        assert_eq!(persist.offset + persist.size, 0x9000 + IPC_SIZE as usize);
        assert_eq!(map.region(RegionId::Os).size, 0x8000);
        for id in RegionId::ALL {
            assert_eq!(map.region(id).id, id);
        }
    }

    #[test]
    fn resolving_twice_is_idempotent() {
        let window = window_with(&descriptor());
        let first = MemoryMap::resolve(&window).unwrap();
        let second = MemoryMap::resolve(&window).unwrap();
        for id in RegionId::ALL {
            assert_eq!(first.region(id).offset, second.region(id).offset);
            assert_eq!(first.region(id).size, second.region(id).size);
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let window = window_with(&descriptor());
        window.write_bytes(ipc::MAP_INFO_OFFSET, b"Nanohub XX");
        assert_eq!(
            MemoryMap::resolve(&window).unwrap_err(),
            IpcError::MapInvalid(MapFault::BadMagic)
        );
    }

    #[test]
    fn rejects_trailing_bytes_in_the_magic_field() {
        let window = window_with(&descriptor());
        window.write_bytes(ipc::MAP_INFO_OFFSET + ipc::MAGIC_LEN - 1, b"!");
        assert_eq!(
            MemoryMap::resolve(&window).unwrap_err(),
            IpcError::MapInvalid(MapFault::BadMagic)
        );
    }

    #[test]
    fn rejects_other_versions() {
        let mut desc = descriptor();
        desc.version = 170000;
        assert_eq!(
            MemoryMap::resolve(&window_with(&desc)).unwrap_err(),
            IpcError::MapInvalid(MapFault::Version {
                found: 170000,
                expected: ipc::IPC_VERSION
            })
        );
    }

    #[test]
    fn rejects_reversed_and_oversized_ranges() {
        let mut desc = descriptor();
        desc.ram = (0x19000, 0x11000);
        assert!(matches!(
            MemoryMap::resolve(&window_with(&desc)),
            Err(IpcError::MapInvalid(MapFault::Range { region: "ram", .. }))
        ));

        let mut desc = descriptor();
        desc.dump = (0, 0x40000);
        assert!(matches!(
            MemoryMap::resolve(&window_with(&desc)),
            Err(IpcError::MapInvalid(MapFault::Range { region: "dump", .. }))
        ));
    }

    #[test]
    fn rejects_ipc_region_without_room_for_the_log() {
        let mut desc = descriptor();
        desc.ipc = (0x9000, 0x9000 + ipc::area::MAP_BYTES as u32);
        assert!(matches!(
            MemoryMap::resolve(&window_with(&desc)),
            Err(IpcError::MapInvalid(MapFault::IpcTooSmall { .. }))
        ));
    }

    #[test]
    fn rejects_truncated_window() {
        let window = SharedWindow::allocate(ipc::MAP_INFO_OFFSET + 8);
        assert_eq!(
            MemoryMap::resolve(&window).unwrap_err(),
            IpcError::MapInvalid(MapFault::Truncated)
        );
    }

    #[test]
    fn boot_args_round_trip() {
        let map = MemoryMap::resolve(&window_with(&descriptor())).unwrap();
        map.write_boot_args(24_576_000, ipc::BOOTMODE_COLD, true);
        assert_eq!(map.read_boot_args(), (24_576_000, ipc::BOOTMODE_COLD, true));
        let reparsed = MemoryMap::resolve(map.window()).unwrap();
        assert_eq!(reparsed.descriptor().clock_hz, 24_576_000);
    }
}
