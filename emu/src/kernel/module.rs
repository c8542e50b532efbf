//! # Module Loader
//!
//! Loads a static ELF32 executable into user memory and links its imports
//! against the HLE registry:
//!
//! ```text
//!   file ─┬─ ELF header ── program headers ── PT_LOAD ──▶ alloc_at + copy
//!         │                                               (bss zeroed)
//!         └─ section headers ─ ".rodata.sceModuleInfo" ──▶ name, gp, stubs
//!                                                        │
//!   stub table ── library name, NIDs, stub slots ◀───────┘
//!        │
//!        └─▶ each slot becomes `jr ra; syscall code`
//! ```
//!
//! Without a section table the module info is found through the first
//! segment's `p_paddr`, which holds its file offset.

use tracing::{debug, info, warn};

use crate::error::LoadError;
use crate::memory::Memory;

use super::Kernel;
use super::hle::syscall_instruction;
use super::object::Uid;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_MIPS: u16 = 8;
const PT_LOAD: u32 = 1;

const HEADER_SIZE: usize = 0x34;
const MODULE_INFO_SECTION: &str = ".rodata.sceModuleInfo";
const MODULE_NAME_SIZE: usize = 28;
const JR_RA: u32 = 0x03E0_0008;

/// A loaded executable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub attributes: u16,
    pub version: u16,
    pub entry: u32,
    pub gp: u32,
    /// Allocated `(address, size)` ranges, one per loaded segment.
    pub segments: Vec<(u32, u32)>,
    pub imports: Vec<Import>,
}

/// One linked import slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Import {
    pub library: String,
    pub nid: u32,
    pub stub: u32,
    pub code: u32,
}

#[derive(Debug)]
struct ElfHeader {
    kind: u16,
    entry: u32,
    phoff: usize,
    shoff: usize,
    phentsize: usize,
    phnum: usize,
    shentsize: usize,
    shnum: usize,
    shstrndx: usize,
}

#[derive(Clone, Copy, Debug)]
struct ProgramHeader {
    kind: u32,
    offset: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
}

#[derive(Clone, Copy, Debug)]
struct SectionHeader {
    name: u32,
    addr: u32,
}

fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)?.try_into().ok().map(u16::from_le_bytes)
}

fn u32_at(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset + 4)?.try_into().ok().map(u32::from_le_bytes)
}

fn parse_header(data: &[u8]) -> Result<ElfHeader, LoadError> {
    if data.len() < HEADER_SIZE {
        return Err(LoadError::TooSmall(data.len()));
    }
    if data[0..4] != ELF_MAGIC {
        return Err(LoadError::BadMagic);
    }
    let machine = u16_at(data, 18).unwrap_or_default();
    if data[4] != ELFCLASS32 || data[5] != ELFDATA2LSB || machine != EM_MIPS {
        return Err(LoadError::NotMips);
    }
    let half = |offset| usize::from(u16_at(data, offset).unwrap_or_default());
    let word = |offset| u32_at(data, offset).unwrap_or_default();
    let header = ElfHeader {
        kind: u16_at(data, 16).unwrap_or_default(),
        entry: word(24),
        phoff: word(28) as usize,
        shoff: word(32) as usize,
        phentsize: half(42),
        phnum: half(44),
        shentsize: half(46),
        shnum: half(48),
        shstrndx: half(50),
    };
    if header.kind != ET_EXEC {
        return Err(LoadError::Unsupported(header.kind));
    }
    Ok(header)
}

fn program_headers(data: &[u8], header: &ElfHeader) -> Result<Vec<ProgramHeader>, LoadError> {
    (0..header.phnum)
        .map(|index| {
            let base = header.phoff + index * header.phentsize;
            let word = |field: usize| u32_at(data, base + field).ok_or(LoadError::Segment { index });
            Ok(ProgramHeader {
                kind: word(0)?,
                offset: word(4)?,
                vaddr: word(8)?,
                paddr: word(12)?,
                filesz: word(16)?,
                memsz: word(20)?,
            })
        })
        .collect()
}

/// Address of a named section, if the file carries a usable section table.
fn section_address(data: &[u8], header: &ElfHeader, wanted: &str) -> Option<u32> {
    if header.shoff == 0 || header.shentsize == 0 {
        return None;
    }
    let section = |index: usize| {
        let base = header.shoff + index * header.shentsize;
        Some(SectionHeader {
            name: u32_at(data, base)?,
            addr: u32_at(data, base + 12)?,
        })
    };
    let strings_offset = u32_at(data, header.shoff + header.shstrndx * header.shentsize + 16)? as usize;
    (0..header.shnum).filter_map(section).find_map(|s| {
        let start = strings_offset + s.name as usize;
        let name = data.get(start..)?;
        let end = name.iter().position(|&b| b == 0)?;
        (&name[..end] == wanted.as_bytes()).then_some(s.addr)
    })
}

fn module_info_address(data: &[u8], header: &ElfHeader, segments: &[ProgramHeader]) -> Option<u32> {
    if let Some(address) = section_address(data, header, MODULE_INFO_SECTION) {
        return Some(address);
    }
    let first = segments.iter().find(|s| s.kind == PT_LOAD)?;
    let offset = first.paddr & 0x7FFF_FFFF;
    debug!("no {MODULE_INFO_SECTION} section, module info at file offset {offset:#x}");
    (first.vaddr + offset).checked_sub(first.offset)
}

impl Kernel {
    /// Loads `data` as the main executable and registers it as a module
    /// object. Segments already loaded are released again on failure.
    pub fn load_module(&mut self, memory: &mut Memory, data: &[u8]) -> Result<Uid, LoadError> {
        let header = parse_header(data)?;
        let segments = program_headers(data, &header)?;

        let mut loaded = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            if segment.kind != PT_LOAD {
                continue;
            }
            match self.load_segment(memory, data, index, segment) {
                Ok(range) => loaded.push(range),
                Err(e) => {
                    for (address, _) in loaded {
                        self.user_memory.free(address);
                    }
                    return Err(e);
                }
            }
        }

        let mut module = Module {
            name: String::from("unknown"),
            attributes: 0,
            version: 0,
            entry: header.entry,
            gp: 0,
            segments: loaded,
            imports: Vec::new(),
        };
        match module_info_address(data, &header, &segments) {
            Some(address) if memory.is_valid_address(address) => {
                self.read_module_info(memory, address, &mut module);
            }
            _ => warn!("executable has no module info, imports stay unlinked"),
        }

        info!(
            "loaded module {} entry {:#010x} gp {:#010x} with {} imports",
            module.name,
            module.entry,
            module.gp,
            module.imports.len()
        );
        self.set_module_gp(module.gp);
        let size = module.segments.iter().map(|(_, size)| *size).sum();
        let address = module.segments.first().map_or(0, |(address, _)| *address);
        self.objects
            .create(module)
            .ok_or(LoadError::NoMemory { address, size })
    }

    fn load_segment(
        &mut self,
        memory: &mut Memory,
        data: &[u8],
        index: usize,
        segment: &ProgramHeader,
    ) -> Result<(u32, u32), LoadError> {
        let start = segment.offset as usize;
        let bytes = data
            .get(start..start + segment.filesz as usize)
            .ok_or(LoadError::Segment { index })?;
        if segment.memsz < segment.filesz || memory.slice(segment.vaddr, segment.memsz as usize).is_none() {
            return Err(LoadError::Segment { index });
        }
        let address = self
            .user_memory
            .alloc_at(segment.vaddr, segment.memsz, &format!("segment/{index}"))
            .ok_or(LoadError::NoMemory {
                address: segment.vaddr,
                size: segment.memsz,
            })?;
        let size = self.user_memory.block_size_from_address(address).unwrap_or(segment.memsz);

        memory.copy_from_slice(segment.vaddr, bytes);
        memory.memset(
            segment.vaddr + segment.filesz,
            0,
            (segment.memsz - segment.filesz) as usize,
        );
        debug!(
            "segment {index}: {:#x} bytes at {:#010x}, {:#x} zeroed",
            segment.filesz,
            segment.vaddr,
            segment.memsz - segment.filesz
        );
        Ok((address, size))
    }

    /// Reads `SceModuleInfo` at `address` and links the stub libraries it
    /// points to.
    fn read_module_info(&mut self, memory: &mut Memory, address: u32, module: &mut Module) {
        module.attributes = memory.read_u16(address);
        module.version = memory.read_u16(address + 2);
        module.name = memory.read_cstring(address + 4, MODULE_NAME_SIZE);
        module.gp = memory.read_u32(address + 32);
        let stubs_start = memory.read_u32(address + 44);
        let stubs_end = memory.read_u32(address + 48);

        let mut entry = stubs_start;
        while entry < stubs_end {
            let size = u32::from(memory.read_u8(entry + 8)) * 4;
            if size == 0 {
                warn!("zero sized stub entry at {entry:#010x}");
                break;
            }
            self.link_library(memory, entry, module);
            entry += size;
        }
    }

    fn link_library(&mut self, memory: &mut Memory, entry: u32, module: &mut Module) {
        let library = memory.read_cstring(memory.read_u32(entry), 64);
        let count = u32::from(memory.read_u16(entry + 10));
        let nids = memory.read_u32(entry + 12);
        let stubs = memory.read_u32(entry + 16);
        debug!("linking {count} functions of {library}");
        for i in 0..count {
            let nid = memory.read_u32(nids + i * 4);
            let stub = stubs + i * 8;
            let code = self.hle.import(&library, nid);
            memory.write_u32(stub, JR_RA);
            memory.write_u32(stub + 4, syscall_instruction(code));
            module.imports.push(Import {
                library: library.clone(),
                nid,
                stub,
                code,
            });
        }
    }

    /// Creates and starts the main thread of `module`.
    pub fn start_module(&mut self, memory: &mut Memory, module: Uid, priority: u32, stack_size: u32) -> Result<Uid, u32> {
        let (name, entry) = self
            .objects
            .get::<Module>(module)
            .map(|m| (m.name.clone(), m.entry))
            .ok_or(super::error::UNKNOWN_UID)?;
        let thread = self.create_thread(memory, &name, entry, priority, stack_size, 0, Some(module))?;
        self.start_thread(memory, thread, 0, 0)?;
        Ok(thread)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;
    use crate::kernel::object::Uid;
    use crate::kernel::thread::Thread;
    use pretty_assertions::assert_eq;

    pub(crate) const BASE: u32 = 0x0880_4000;
    const SEGMENT_OFFSET: usize = 0x100;
    const IMAGE_SIZE: usize = 0x200;

    fn put_u16(data: &mut [u8], offset: usize, value: u16) {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// One `PT_LOAD` segment at `BASE` holding `code`, module info at +0x100
    /// and a stub table importing two `sceDisplay` functions. With
    /// `sections` the module info is found by name and `p_paddr` is zero.
    pub(crate) fn build_elf(code: &[u32], sections: bool) -> Vec<u8> {
        let mut image = vec![0u8; IMAGE_SIZE];
        for (i, word) in code.iter().enumerate() {
            put_u32(&mut image, i * 4, *word);
        }
        put_u16(&mut image, 0x102, 0x0101);
        image[0x104..0x10C].copy_from_slice(b"kumquat\0");
        put_u32(&mut image, 0x120, BASE + 0x7FF0);
        put_u32(&mut image, 0x12C, BASE + 0x140);
        put_u32(&mut image, 0x130, BASE + 0x154);
        put_u32(&mut image, 0x140, BASE + 0x160);
        image[0x148] = 5;
        put_u16(&mut image, 0x14A, 2);
        put_u32(&mut image, 0x14C, BASE + 0x170);
        put_u32(&mut image, 0x150, BASE + 0x180);
        image[0x160..0x16B].copy_from_slice(b"sceDisplay\0");
        put_u32(&mut image, 0x170, 0x984C_27E7);
        put_u32(&mut image, 0x174, 0x1234_5678);

        let mut elf = vec![0u8; SEGMENT_OFFSET];
        elf[0..4].copy_from_slice(&ELF_MAGIC);
        elf[4] = ELFCLASS32;
        elf[5] = ELFDATA2LSB;
        elf[6] = 1;
        put_u16(&mut elf, 16, ET_EXEC);
        put_u16(&mut elf, 18, EM_MIPS);
        put_u32(&mut elf, 20, 1);
        put_u32(&mut elf, 24, BASE);
        put_u32(&mut elf, 28, HEADER_SIZE as u32);
        put_u16(&mut elf, 40, HEADER_SIZE as u16);
        put_u16(&mut elf, 42, 32);
        put_u16(&mut elf, 44, 1);
        put_u16(&mut elf, 46, 40);

        let ph = HEADER_SIZE;
        put_u32(&mut elf, ph, PT_LOAD);
        put_u32(&mut elf, ph + 4, SEGMENT_OFFSET as u32);
        put_u32(&mut elf, ph + 8, BASE);
        let paddr = if sections { 0 } else { (SEGMENT_OFFSET + 0x100) as u32 };
        put_u32(&mut elf, ph + 12, paddr);
        put_u32(&mut elf, ph + 16, IMAGE_SIZE as u32);
        put_u32(&mut elf, ph + 20, 0x1000);
        elf.extend_from_slice(&image);

        if sections {
            let strings = b"\0.shstrtab\0.rodata.sceModuleInfo\0";
            let strings_offset = elf.len();
            elf.extend_from_slice(strings);
            let shoff = elf.len();
            let mut table = vec![0u8; 3 * 40];
            put_u32(&mut table, 40, 1);
            put_u32(&mut table, 40 + 4, 3);
            put_u32(&mut table, 40 + 16, strings_offset as u32);
            put_u32(&mut table, 40 + 20, strings.len() as u32);
            put_u32(&mut table, 80, 11);
            put_u32(&mut table, 80 + 4, 1);
            put_u32(&mut table, 80 + 12, BASE + 0x100);
            elf.extend_from_slice(&table);
            put_u32(&mut elf, 32, shoff as u32);
            put_u16(&mut elf, 48, 3);
            put_u16(&mut elf, 50, 1);
        }
        elf
    }

    fn load(data: &[u8]) -> (Kernel, Memory, Result<Uid, LoadError>) {
        let mut memory = Memory::new();
        let mut kernel = Kernel::new(&Config::default(), &mut memory);
        let result = kernel.load_module(&mut memory, data);
        (kernel, memory, result)
    }

    #[test]
    fn segments_are_loaded_and_stubs_patched() {
        for sections in [false, true] {
            let (mut kernel, mut memory, result) = load(&build_elf(&[0x2402_0007], sections));
            let uid = result.unwrap();
            let module = kernel.objects.get::<Module>(uid).unwrap().clone();
            assert_eq!(module.name, "kumquat");
            assert_eq!(module.gp, BASE + 0x7FF0);
            assert_eq!(kernel.module_gp(), BASE + 0x7FF0);
            assert_eq!(memory.read_u32(BASE), 0x2402_0007);
            assert_eq!(memory.read_u32(BASE + IMAGE_SIZE as u32), 0);
            assert_eq!(module.segments, vec![(BASE, 0x1000)]);

            assert_eq!(module.imports.len(), 2);
            let wait = &module.imports[0];
            assert_eq!(wait.library, "sceDisplay");
            assert_eq!(memory.read_u32(BASE + 0x180), JR_RA);
            assert_eq!(memory.read_u32(BASE + 0x184), syscall_instruction(wait.code));
            assert!(kernel.hle.entry(wait.code).unwrap().function.is_some());
            let unknown = &module.imports[1];
            assert!(kernel.hle.entry(unknown.code).unwrap().function.is_none());

            let thread = kernel.start_module(&mut memory, uid, 0x20, 0x4000).unwrap();
            let thread = kernel.objects.get::<Thread>(thread).unwrap();
            assert_eq!(thread.context.pc, BASE);
            assert_eq!(thread.module, Some(uid));
            assert_eq!(thread.gp, BASE + 0x7FF0);
        }
    }

    #[test]
    fn malformed_files_are_rejected() {
        let good = build_elf(&[], false);
        assert_eq!(load(&good[..10]).2, Err(LoadError::TooSmall(10)));

        let mut bad = good.clone();
        bad[0] = 0;
        assert_eq!(load(&bad).2, Err(LoadError::BadMagic));

        let mut bad = good.clone();
        put_u16(&mut bad, 18, 3);
        assert_eq!(load(&bad).2, Err(LoadError::NotMips));

        let mut bad = good.clone();
        put_u16(&mut bad, 16, 0xFFA0);
        assert_eq!(load(&bad).2, Err(LoadError::Unsupported(0xFFA0)));

        let truncated = &good[..SEGMENT_OFFSET + 0x10];
        assert_eq!(load(truncated).2, Err(LoadError::Segment { index: 0 }));
    }

    #[test]
    fn overlapping_loads_fail_without_leaking() {
        let elf = build_elf(&[], false);
        let (mut kernel, mut memory, first) = load(&elf);
        assert!(first.is_ok());
        let free = kernel.user_memory.total_free_bytes();
        assert_eq!(
            kernel.load_module(&mut memory, &elf),
            Err(LoadError::NoMemory {
                address: BASE,
                size: 0x1000
            })
        );
        assert_eq!(kernel.user_memory.total_free_bytes(), free);
    }
}
