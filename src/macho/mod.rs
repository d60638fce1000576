//! Mach-O relocatable object reading.
//!
//! This module decodes 64-bit little-endian Mach-O object files (`MH_OBJECT`)
//! from an in-memory byte buffer: the header, the single `LC_SEGMENT_64`
//! section list, the symbol table, and per-section relocation records. All
//! multi-byte fields are read as explicit little-endian values with bounds
//! checks, so decoding is independent of host endianness and malformed input
//! fails cleanly instead of reading out of bounds.

use crate::{Error, Result};
use tracing::{trace, warn};

pub mod arm64;
pub mod builder;

// Mach-O magic and header fields
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_OBJECT: u32 = 0x1;
pub const CPU_TYPE_ARM64: u32 = 0x0100000c;

// Load command types
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_LINKER_OPTION: u32 = 0x2d;
pub const LC_BUILD_VERSION: u32 = 0x32;

// Section flags
pub const SECTION_TYPE: u32 = 0x000000ff;
pub const S_ZEROFILL: u32 = 0x1;

// nlist n_type fields
pub const N_STAB: u8 = 0xe0;
pub const N_TYPE: u8 = 0x0e;
pub const N_EXT: u8 = 0x01;
pub const N_UNDF: u8 = 0x0;
pub const N_ABS: u8 = 0x2;
pub const N_SECT: u8 = 0xe;

const MACH_HEADER_64_SIZE: usize = 32;
const SEGMENT_COMMAND_64_SIZE: usize = 72;
const SECTION_64_SIZE: usize = 80;
const NLIST_64_SIZE: usize = 16;
const RELOCATION_INFO_SIZE: usize = 8;

/// A section from the object's `LC_SEGMENT_64` load command.
#[derive(Debug, Clone)]
pub struct ObjSection {
    pub sectname: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    /// File offset of the section content (zero for zerofill sections).
    pub offset: u32,
    /// Alignment as a power of two.
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
}

impl ObjSection {
    pub fn is_zerofill(&self) -> bool {
        self.flags & SECTION_TYPE == S_ZEROFILL
    }
}

/// A symbol table entry (nlist_64).
#[derive(Debug, Clone, Copy)]
pub struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    /// Debugger symbol, skipped when building the graph.
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }

    pub fn is_external(&self) -> bool {
        self.n_type & N_EXT != 0
    }

    pub fn type_bits(&self) -> u8 {
        self.n_type & N_TYPE
    }
}

/// An unpacked Mach-O relocation record.
///
/// The on-disk form is eight bytes: a 32-bit `r_address` followed by a
/// packed word holding `r_symbolnum` (24 bits), `r_pcrel` (1), `r_length`
/// (2), `r_extern` (1), and `r_type` (4).
#[derive(Debug, Clone, Copy)]
pub struct RelocationInfo {
    pub r_address: u32,
    pub r_symbolnum: u32,
    pub r_pcrel: bool,
    pub r_length: u8,
    pub r_extern: bool,
    pub r_type: u8,
}

impl RelocationInfo {
    pub fn parse(data: &[u8], offset: usize) -> Result<RelocationInfo> {
        let r_address = read_u32(data, offset)?;
        let word = read_u32(data, offset + 4)?;
        Ok(RelocationInfo {
            r_address,
            r_symbolnum: word & 0x00ff_ffff,
            r_pcrel: word >> 24 & 1 != 0,
            r_length: (word >> 25 & 3) as u8,
            r_extern: word >> 27 & 1 != 0,
            r_type: (word >> 28) as u8,
        })
    }
}

/// A parsed Mach-O object file, borrowing the underlying buffer.
pub struct MachOObject<'data> {
    data: &'data [u8],
    pub sections: Vec<ObjSection>,
    pub symbols: Vec<Nlist>,
    strtab_off: usize,
    strtab_size: usize,
}

impl<'data> MachOObject<'data> {
    pub fn parse(data: &'data [u8]) -> Result<MachOObject<'data>> {
        if data.len() < MACH_HEADER_64_SIZE {
            return Err(Error::ObjectFormat("not a Mach-O file".to_string()));
        }
        let magic = read_u32(data, 0)?;
        if magic != MH_MAGIC_64 {
            return Err(Error::ObjectFormat(format!(
                "not a 64-bit Mach-O file (magic {:#010x})",
                magic
            )));
        }
        let cputype = read_u32(data, 4)?;
        if cputype != CPU_TYPE_ARM64 {
            return Err(Error::ObjectFormat(format!(
                "unsupported cputype {:#010x} (want arm64)",
                cputype
            )));
        }
        let filetype = read_u32(data, 12)?;
        if filetype != MH_OBJECT {
            return Err(Error::ObjectFormat(format!(
                "not a relocatable object (filetype {:#x})",
                filetype
            )));
        }
        let ncmds = read_u32(data, 16)?;

        let mut obj = MachOObject {
            data,
            sections: Vec::new(),
            symbols: Vec::new(),
            strtab_off: 0,
            strtab_size: 0,
        };
        obj.parse_load_cmds(ncmds)?;
        Ok(obj)
    }

    fn parse_load_cmds(&mut self, ncmds: u32) -> Result<()> {
        let mut offset = MACH_HEADER_64_SIZE;
        for _ in 0..ncmds {
            let cmd = read_u32(self.data, offset)?;
            let cmdsize = read_u32(self.data, offset + 4)? as usize;
            if cmdsize < 8 || offset + cmdsize > self.data.len() {
                return Err(Error::ObjectFormat(format!(
                    "load command at offset {:#x} has bad size {}",
                    offset, cmdsize
                )));
            }
            match cmd {
                LC_SEGMENT_64 => self.parse_segment(offset, cmdsize)?,
                LC_SYMTAB => self.parse_symtab(offset)?,
                LC_DYSYMTAB => { /* ignore */ }
                LC_BUILD_VERSION => { /* ignore */ }
                LC_DATA_IN_CODE => { /* ignore */ }
                LC_LINKER_OPTION => { /* ignore */ }
                cmd => {
                    warn!("Unknown Mach-O load command: {:x}", cmd);
                }
            }
            offset += cmdsize;
        }
        Ok(())
    }

    fn parse_segment(&mut self, offset: usize, cmdsize: usize) -> Result<()> {
        let nsects = read_u32(self.data, offset + 64)? as usize;
        if SEGMENT_COMMAND_64_SIZE + nsects * SECTION_64_SIZE > cmdsize {
            return Err(Error::ObjectFormat(format!(
                "segment command claims {} sections but is {} bytes",
                nsects, cmdsize
            )));
        }
        for i in 0..nsects {
            let s = offset + SEGMENT_COMMAND_64_SIZE + i * SECTION_64_SIZE;
            let section = ObjSection {
                sectname: read_fixed_str(self.data, s)?,
                segname: read_fixed_str(self.data, s + 16)?,
                addr: read_u64(self.data, s + 32)?,
                size: read_u64(self.data, s + 40)?,
                offset: read_u32(self.data, s + 48)?,
                align: read_u32(self.data, s + 52)?,
                reloff: read_u32(self.data, s + 56)?,
                nreloc: read_u32(self.data, s + 60)?,
                flags: read_u32(self.data, s + 64)?,
            };
            trace!(
                "Section {},{} at {:#x} ({} bytes, {} relocs)",
                section.segname,
                section.sectname,
                section.addr,
                section.size,
                section.nreloc
            );
            self.sections.push(section);
        }
        Ok(())
    }

    fn parse_symtab(&mut self, offset: usize) -> Result<()> {
        let symoff = read_u32(self.data, offset + 8)? as usize;
        let nsyms = read_u32(self.data, offset + 12)? as usize;
        let stroff = read_u32(self.data, offset + 16)? as usize;
        let strsize = read_u32(self.data, offset + 20)? as usize;
        if stroff + strsize > self.data.len() {
            return Err(Error::ObjectFormat(
                "string table extends past end of file".to_string(),
            ));
        }
        for i in 0..nsyms {
            let s = symoff + i * NLIST_64_SIZE;
            self.symbols.push(Nlist {
                n_strx: read_u32(self.data, s)?,
                n_type: read_u8(self.data, s + 4)?,
                n_sect: read_u8(self.data, s + 5)?,
                n_desc: read_u16(self.data, s + 6)?,
                n_value: read_u64(self.data, s + 8)?,
            });
        }
        self.strtab_off = stroff;
        self.strtab_size = strsize;
        Ok(())
    }

    /// The section's content bytes. Zerofill sections materialize as zeros.
    pub fn section_content(&self, section: &ObjSection) -> Result<Vec<u8>> {
        if section.is_zerofill() {
            return Ok(vec![0u8; section.size as usize]);
        }
        let start = section.offset as usize;
        let end = start + section.size as usize;
        if end > self.data.len() {
            return Err(Error::ObjectFormat(format!(
                "section {},{} content extends past end of file",
                section.segname, section.sectname
            )));
        }
        Ok(self.data[start..end].to_vec())
    }

    /// The section's relocation records, in file order.
    pub fn relocations(&self, section: &ObjSection) -> Result<Vec<RelocationInfo>> {
        let mut relocs = Vec::with_capacity(section.nreloc as usize);
        for i in 0..section.nreloc as usize {
            let off = section.reloff as usize + i * RELOCATION_INFO_SIZE;
            relocs.push(RelocationInfo::parse(self.data, off)?);
        }
        Ok(relocs)
    }

    /// Look up a symbol's name in the string table.
    pub fn symbol_name(&self, nlist: &Nlist) -> Result<&'data str> {
        let start = self.strtab_off + nlist.n_strx as usize;
        let end = self.strtab_off + self.strtab_size;
        if start > end || end > self.data.len() {
            return Err(Error::ObjectFormat(format!(
                "symbol name offset {:#x} outside string table",
                nlist.n_strx
            )));
        }
        let bytes = &self.data[start..end];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..len])
            .map_err(|_| Error::ObjectFormat(format!("symbol name at {:#x} is not UTF-8", start)))
    }
}

fn read_u8(data: &[u8], offset: usize) -> Result<u8> {
    data.get(offset).copied().ok_or_else(|| truncated(offset))
}

pub(crate) fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    match data.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(truncated(offset)),
    }
}

pub(crate) fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(truncated(offset)),
    }
}

pub(crate) fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    match data.get(offset..offset + 8) {
        Some(b) => Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ])),
        None => Err(truncated(offset)),
    }
}

/// Read a 16-byte fixed-width name field (sectname/segname).
fn read_fixed_str(data: &[u8], offset: usize) -> Result<String> {
    match data.get(offset..offset + 16) {
        Some(b) => Ok(String::from_utf8_lossy(b)
            .trim_end_matches('\0')
            .to_string()),
        None => Err(truncated(offset)),
    }
}

fn truncated(offset: usize) -> Error {
    Error::ObjectFormat(format!("file truncated at offset {:#x}", offset))
}

/// Byte-level construction of small Mach-O objects for tests.
#[cfg(test)]
pub(crate) mod testutil {
    struct SectionSpec {
        segname: String,
        sectname: String,
        addr: u64,
        align: u32,
        content: Vec<u8>,
        flags: u32,
        relocs: Vec<[u8; 8]>,
    }

    pub(crate) struct ObjBuilder {
        sections: Vec<SectionSpec>,
        symbols: Vec<(String, u8, u8, u64)>,
    }

    impl ObjBuilder {
        pub fn new() -> ObjBuilder {
            ObjBuilder {
                sections: Vec::new(),
                symbols: Vec::new(),
            }
        }

        pub fn section(
            &mut self,
            segname: &str,
            sectname: &str,
            addr: u64,
            align: u32,
            content: Vec<u8>,
        ) -> usize {
            self.sections.push(SectionSpec {
                segname: segname.to_string(),
                sectname: sectname.to_string(),
                addr,
                align,
                content,
                flags: 0,
                relocs: Vec::new(),
            });
            self.sections.len() - 1
        }

        pub fn reloc(
            &mut self,
            section: usize,
            r_address: u32,
            r_symbolnum: u32,
            r_pcrel: bool,
            r_length: u8,
            r_extern: bool,
            r_type: u8,
        ) {
            let word = r_symbolnum & 0x00ff_ffff
                | (r_pcrel as u32) << 24
                | (r_length as u32) << 25
                | (r_extern as u32) << 27
                | (r_type as u32) << 28;
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&r_address.to_le_bytes());
            bytes[4..].copy_from_slice(&word.to_le_bytes());
            self.sections[section].relocs.push(bytes);
        }

        pub fn symbol(&mut self, name: &str, n_type: u8, n_sect: u8, n_value: u64) -> u32 {
            self.symbols.push((name.to_string(), n_type, n_sect, n_value));
            (self.symbols.len() - 1) as u32
        }

        pub fn build(&self) -> Vec<u8> {
            let nsects = self.sections.len();
            let seg_cmdsize = 72 + 80 * nsects;
            let sizeofcmds = seg_cmdsize + 24;
            let header_end = 32 + sizeofcmds;

            // Payload layout: section contents, relocation tables, symbol
            // table, string table.
            let mut payload_off = header_end;
            let mut content_offsets = Vec::new();
            for s in &self.sections {
                content_offsets.push(payload_off);
                payload_off += s.content.len();
            }
            let mut reloc_offsets = Vec::new();
            for s in &self.sections {
                reloc_offsets.push(payload_off);
                payload_off += 8 * s.relocs.len();
            }
            let symoff = payload_off;
            let stroff = symoff + 16 * self.symbols.len();

            let mut strtab = vec![0u8];
            let mut strx = Vec::new();
            for (name, ..) in &self.symbols {
                strx.push(strtab.len() as u32);
                strtab.extend_from_slice(name.as_bytes());
                strtab.push(0);
            }

            let mut out = Vec::new();
            out.extend_from_slice(&super::MH_MAGIC_64.to_le_bytes());
            out.extend_from_slice(&super::CPU_TYPE_ARM64.to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // cpusubtype
            out.extend_from_slice(&super::MH_OBJECT.to_le_bytes());
            out.extend_from_slice(&2u32.to_le_bytes()); // ncmds
            out.extend_from_slice(&(sizeofcmds as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // flags
            out.extend_from_slice(&0u32.to_le_bytes()); // reserved

            let vmsize: u64 = self.sections.iter().map(|s| s.content.len() as u64).sum();
            out.extend_from_slice(&super::LC_SEGMENT_64.to_le_bytes());
            out.extend_from_slice(&(seg_cmdsize as u32).to_le_bytes());
            out.extend_from_slice(&[0u8; 16]); // segname
            out.extend_from_slice(&0u64.to_le_bytes()); // vmaddr
            out.extend_from_slice(&vmsize.to_le_bytes());
            out.extend_from_slice(&(header_end as u64).to_le_bytes()); // fileoff
            out.extend_from_slice(&vmsize.to_le_bytes()); // filesize
            out.extend_from_slice(&7u32.to_le_bytes()); // maxprot
            out.extend_from_slice(&7u32.to_le_bytes()); // initprot
            out.extend_from_slice(&(nsects as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // flags

            for (i, s) in self.sections.iter().enumerate() {
                out.extend_from_slice(&fixed16(&s.sectname));
                out.extend_from_slice(&fixed16(&s.segname));
                out.extend_from_slice(&s.addr.to_le_bytes());
                out.extend_from_slice(&(s.content.len() as u64).to_le_bytes());
                out.extend_from_slice(&(content_offsets[i] as u32).to_le_bytes());
                out.extend_from_slice(&s.align.to_le_bytes());
                out.extend_from_slice(&(reloc_offsets[i] as u32).to_le_bytes());
                out.extend_from_slice(&(s.relocs.len() as u32).to_le_bytes());
                out.extend_from_slice(&s.flags.to_le_bytes());
                out.extend_from_slice(&[0u8; 12]); // reserved1..3
            }

            out.extend_from_slice(&super::LC_SYMTAB.to_le_bytes());
            out.extend_from_slice(&24u32.to_le_bytes());
            out.extend_from_slice(&(symoff as u32).to_le_bytes());
            out.extend_from_slice(&(self.symbols.len() as u32).to_le_bytes());
            out.extend_from_slice(&(stroff as u32).to_le_bytes());
            out.extend_from_slice(&(strtab.len() as u32).to_le_bytes());

            for s in &self.sections {
                out.extend_from_slice(&s.content);
            }
            for s in &self.sections {
                for r in &s.relocs {
                    out.extend_from_slice(r);
                }
            }
            for (i, (_, n_type, n_sect, n_value)) in self.symbols.iter().enumerate() {
                out.extend_from_slice(&strx[i].to_le_bytes());
                out.push(*n_type);
                out.push(*n_sect);
                out.extend_from_slice(&0u16.to_le_bytes()); // n_desc
                out.extend_from_slice(&n_value.to_le_bytes());
            }
            out.extend_from_slice(&strtab);
            out
        }
    }

    fn fixed16(name: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..name.len()].copy_from_slice(name.as_bytes());
        out
    }
}
