//! Goblin-based loader turning an ELF or PE image into analyzable routines.

use std::fs;
use std::path::Path;

use goblin::elf::{self, section_header::SHT_NOBITS, sym::STT_FUNC};
use goblin::{pe, Object};

use crate::isil::LiteralLookup;
use crate::pipeline::Routine;
use crate::{Address, Architecture};

/// Longest string a literal lookup will return.
const MAX_LITERAL_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse binary: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported machine type: {0}")]
    UnsupportedArchitecture(String),
}

/// Read-only data sections of an image, searched for NUL-terminated
/// printable strings.
#[derive(Debug, Clone, Default)]
pub struct SectionLiterals {
    regions: Vec<(Address, Vec<u8>)>,
}

impl SectionLiterals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the bytes mapped at `address`.
    pub fn add_region(&mut self, address: Address, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.regions.push((address, bytes));
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl LiteralLookup for SectionLiterals {
    fn literal_at(&self, address: Address) -> Option<String> {
        let (start, bytes) = self
            .regions
            .iter()
            .find(|(start, bytes)| address >= *start && address - *start < bytes.len() as Address)?;
        let tail = &bytes[(address - start) as usize..];
        let len = tail.iter().take(MAX_LITERAL_LEN).position(|b| *b == 0)?;
        let text = &tail[..len];
        let printable = |b: &u8| b.is_ascii_graphic() || matches!(b, b' ' | b'\t' | b'\n' | b'\r');
        if text.is_empty() || !text.iter().all(printable) {
            return None;
        }
        String::from_utf8(text.to_vec()).ok()
    }
}

/// Loader output.
#[derive(Debug, Clone)]
pub struct LoadedBinary {
    pub architecture: Architecture,
    /// Routines ordered by address
    pub routines: Vec<Routine>,
    pub literals: SectionLiterals,
}

/// Load a binary from disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<LoadedBinary, LoadError> {
    let data = fs::read(path)?;
    load(&data)
}

/// Parse an in-memory ELF or PE image.
pub fn load(data: &[u8]) -> Result<LoadedBinary, LoadError> {
    let mut loaded = match Object::parse(data)? {
        Object::Elf(elf) => load_elf(&elf, data)?,
        Object::PE(pe) => load_pe(&pe, data)?,
        Object::Mach(_) => return Err(LoadError::UnsupportedFormat("Mach-O".into())),
        Object::Archive(_) => return Err(LoadError::UnsupportedFormat("archive".into())),
        Object::Unknown(magic) => return Err(LoadError::UnsupportedFormat(format!("magic 0x{:x}", magic))),
        _ => return Err(LoadError::UnsupportedFormat("unrecognised object".into())),
    };

    loaded.routines.sort_by_key(|r| r.address);
    loaded.routines.dedup_by_key(|r| r.address);
    log::debug!(
        "loaded {} {} routine(s), {} literal region(s)",
        loaded.routines.len(),
        loaded.architecture,
        loaded.literals.region_count()
    );
    Ok(loaded)
}

fn load_elf(elf: &elf::Elf, data: &[u8]) -> Result<LoadedBinary, LoadError> {
    let architecture = match elf.header.e_machine {
        elf::header::EM_386 => Architecture::X86_32,
        elf::header::EM_X86_64 => Architecture::X86_64,
        elf::header::EM_ARM => Architecture::ArmV7,
        elf::header::EM_AARCH64 => Architecture::ArmV8,
        other => return Err(LoadError::UnsupportedArchitecture(elf::header::machine_to_str(other).into())),
    };

    let file_bytes = |addr: Address, size: u64| {
        elf.section_headers
            .iter()
            .filter(|sh| sh.sh_type != SHT_NOBITS)
            .find(|sh| addr >= sh.sh_addr && addr - sh.sh_addr < sh.sh_size)
            .and_then(|sh| {
                let start = sh.sh_offset.checked_add(addr - sh.sh_addr)? as usize;
                let end = start.checked_add(size as usize)?;
                data.get(start..end)
            })
    };

    let mut routines = Vec::new();
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (symtab, strtab) in tables {
        for sym in symtab.iter() {
            if sym.st_type() != STT_FUNC || sym.st_size == 0 || sym.st_shndx == 0 {
                continue;
            }
            let name = strtab.get_at(sym.st_name).unwrap_or("");
            if architecture == Architecture::ArmV7 && sym.st_value & 1 == 1 {
                log::debug!("skipping Thumb routine {}", name);
                continue;
            }
            match file_bytes(sym.st_value, sym.st_size) {
                Some(bytes) => routines.push(Routine::new(name, sym.st_value, bytes)),
                None => log::warn!("{} (0x{:x}): body lies outside the file", name, sym.st_value),
            }
        }
    }

    let mut literals = SectionLiterals::new();
    for sh in &elf.section_headers {
        if sh.is_alloc() && !sh.is_writable() && !sh.is_executable() && sh.sh_type != SHT_NOBITS {
            if let Some(bytes) = sh.file_range().and_then(|range| data.get(range)) {
                literals.add_region(sh.sh_addr, bytes.to_vec());
            }
        }
    }

    Ok(LoadedBinary {
        architecture,
        routines,
        literals,
    })
}

fn load_pe(pe: &pe::PE, data: &[u8]) -> Result<LoadedBinary, LoadError> {
    let machine = pe.header.coff_header.machine;
    let architecture = match machine {
        pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
        pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
        pe::header::COFF_MACHINE_ARMNT | pe::header::COFF_MACHINE_ARM => Architecture::ArmV7,
        pe::header::COFF_MACHINE_ARM64 => Architecture::ArmV8,
        other => return Err(LoadError::UnsupportedArchitecture(format!("COFF machine 0x{:x}", other))),
    };
    let image_base = pe.image_base as Address;

    let section_of = |rva: usize| {
        pe.sections.iter().find(|s| {
            let start = s.virtual_address as usize;
            let len = s.virtual_size.max(s.size_of_raw_data) as usize;
            rva >= start && rva - start < len
        })
    };

    let mut exports: Vec<_> = pe.exports.iter().filter(|e| e.reexport.is_none()).collect();
    exports.sort_by_key(|e| e.rva);

    let mut routines = Vec::new();
    for (n, export) in exports.iter().enumerate() {
        let name = export.name.unwrap_or("");
        let Some(section) = section_of(export.rva) else {
            log::warn!("{}: rva 0x{:x} is outside every section", name, export.rva);
            continue;
        };
        if section.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE == 0 {
            continue;
        }
        let section_start = section.virtual_address as usize;
        let section_end = section_start + section.size_of_raw_data as usize;
        let end = exports
            .get(n + 1)
            .map(|next| next.rva.min(section_end))
            .unwrap_or(section_end);

        let offset = section.pointer_to_raw_data as usize + (export.rva - section_start);
        match data.get(offset..offset + end.saturating_sub(export.rva)) {
            Some(bytes) if !bytes.is_empty() => {
                routines.push(Routine::new(name, image_base + export.rva as Address, bytes));
            }
            _ => log::warn!("{}: body lies outside the file", name),
        }
    }

    let mut literals = SectionLiterals::new();
    for section in &pe.sections {
        let flags = section.characteristics;
        let readonly_data = flags & pe::section_table::IMAGE_SCN_CNT_INITIALIZED_DATA != 0
            && flags & pe::section_table::IMAGE_SCN_MEM_WRITE == 0
            && flags & pe::section_table::IMAGE_SCN_MEM_EXECUTE == 0;
        if !readonly_data {
            continue;
        }
        let start = section.pointer_to_raw_data as usize;
        if let Some(bytes) = data.get(start..start + section.size_of_raw_data as usize) {
            literals.add_region(image_base + section.virtual_address as Address, bytes.to_vec());
        }
    }

    Ok(LoadedBinary {
        architecture,
        routines,
        literals,
    })
}
