//! Mach-O/arm64 backend: relocation parsing, GOT and stub synthesis, and
//! instruction fixups.
//!
//! The parser translates each section's raw relocation records into typed
//! edges on the link graph, folding the two paired encodings (ADDEND +
//! branch/page records, and SUBTRACTOR + UNSIGNED) into single edges. The
//! GOT-and-stubs pass then materializes one 8-byte GOT slot per distinct
//! GOT-referenced target and one trampoline per distinct external branch
//! target, retargeting the original edges in place. The fixup applier
//! finally resolves each edge against assigned addresses and patches the
//! instruction or data word, little-endian, with range and alignment
//! checks.

use crate::graph::{BlockId, Edge, EdgeKind, LinkGraph, SectionId, SymbolId};
use crate::macho::builder::GraphBuilder;
use crate::macho::{MachOObject, RelocationInfo};
use crate::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, trace};

// arm64 relocation types (r_type)
pub const ARM64_RELOC_UNSIGNED: u8 = 0;
pub const ARM64_RELOC_SUBTRACTOR: u8 = 1;
pub const ARM64_RELOC_BRANCH26: u8 = 2;
pub const ARM64_RELOC_PAGE21: u8 = 3;
pub const ARM64_RELOC_PAGEOFF12: u8 = 4;
pub const ARM64_RELOC_GOT_LOAD_PAGE21: u8 = 5;
pub const ARM64_RELOC_GOT_LOAD_PAGEOFF12: u8 = 6;
pub const ARM64_RELOC_POINTER_TO_GOT: u8 = 7;
pub const ARM64_RELOC_ADDEND: u8 = 10;

pub const GOT_SECTION_NAME: &str = "$__GOT";
pub const STUBS_SECTION_NAME: &str = "$__STUBS";

/// A GOT entry starts as zeros; its Pointer64 edge fills in the target
/// address at fixup time.
const NULL_GOT_ENTRY_CONTENT: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const STUB_CONTENT: [u8; 8] = [
    0x10, 0x00, 0x00, 0x58, // LDR x16, <literal>
    0x00, 0x02, 0x1f, 0xd6, // BR  x16
];

/// Classification of a raw relocation record.
///
/// This set exists only inside the parser: `PairedAddend` marks an ADDEND
/// record whose addend applies to the following branch/page record, and
/// `Delta32`/`Delta64` stand for a SUBTRACTOR whose direction is decided by
/// the paired UNSIGNED record. Neither survives onto a graph edge as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocKind {
    Branch26,
    Pointer32,
    Pointer64,
    Pointer64Anon,
    Page21,
    PageOffset12,
    GOTPage21,
    GOTPageOffset12,
    PointerToGOT,
    PairedAddend,
    Delta32,
    Delta64,
}

impl RelocKind {
    fn name(&self) -> &'static str {
        match self {
            RelocKind::Branch26 => "Branch26",
            RelocKind::Pointer32 => "Pointer32",
            RelocKind::Pointer64 => "Pointer64",
            RelocKind::Pointer64Anon => "Pointer64Anon",
            RelocKind::Page21 => "Page21",
            RelocKind::PageOffset12 => "PageOffset12",
            RelocKind::GOTPage21 => "GOTPage21",
            RelocKind::GOTPageOffset12 => "GOTPageOffset12",
            RelocKind::PointerToGOT => "PointerToGOT",
            RelocKind::PairedAddend => "PairedAddend",
            RelocKind::Delta32 => "Delta32",
            RelocKind::Delta64 => "Delta64",
        }
    }
}

/// Map `(r_type, r_pcrel, r_extern, r_length)` to a relocation kind.
/// Any combination outside the supported table is rejected.
fn classify(ri: &RelocationInfo) -> Result<RelocKind> {
    match ri.r_type {
        ARM64_RELOC_UNSIGNED if !ri.r_pcrel => match ri.r_length {
            3 if ri.r_extern => Ok(RelocKind::Pointer64),
            3 => Ok(RelocKind::Pointer64Anon),
            2 => Ok(RelocKind::Pointer32),
            _ => Err(unsupported_relocation(ri)),
        },
        ARM64_RELOC_SUBTRACTOR if !ri.r_pcrel && ri.r_extern => match ri.r_length {
            2 => Ok(RelocKind::Delta32),
            3 => Ok(RelocKind::Delta64),
            _ => Err(unsupported_relocation(ri)),
        },
        ARM64_RELOC_BRANCH26 if ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::Branch26)
        }
        ARM64_RELOC_PAGE21 if ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::Page21)
        }
        ARM64_RELOC_PAGEOFF12 if !ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::PageOffset12)
        }
        ARM64_RELOC_GOT_LOAD_PAGE21 if ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::GOTPage21)
        }
        ARM64_RELOC_GOT_LOAD_PAGEOFF12 if !ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::GOTPageOffset12)
        }
        ARM64_RELOC_POINTER_TO_GOT if ri.r_pcrel && ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::PointerToGOT)
        }
        ARM64_RELOC_ADDEND if !ri.r_pcrel && !ri.r_extern && ri.r_length == 2 => {
            Ok(RelocKind::PairedAddend)
        }
        _ => Err(unsupported_relocation(ri)),
    }
}

fn unsupported_relocation(ri: &RelocationInfo) -> Error {
    Error::BadRelocation(format!(
        "unsupported arm64 relocation: address={:#010x}, symbolnum={:#08x}, kind={:#x}, \
         pc_rel={}, extern={}, length={}",
        ri.r_address, ri.r_symbolnum, ri.r_type, ri.r_pcrel, ri.r_extern, ri.r_length
    ))
}

/// Parse every relocation record of the object into graph edges.
pub fn add_relocations(builder: &mut GraphBuilder, obj: &MachOObject) -> Result<()> {
    for section in &obj.sections {
        if section.nreloc == 0 {
            continue;
        }
        let relocs = obj.relocations(section)?;
        add_section_relocations(builder, section.addr, &relocs)?;
    }
    Ok(())
}

/// Parse one section's relocation records, in file order.
pub fn add_section_relocations(
    builder: &mut GraphBuilder,
    section_address: u64,
    relocs: &[RelocationInfo],
) -> Result<()> {
    let mut i = 0;
    while i < relocs.len() {
        let mut ri = relocs[i];
        let mut kind = classify(&ri)?;

        let fixup_address = section_address + ri.r_address as u64;
        trace!(
            "Processing {} relocation at {:#018x}",
            kind.name(),
            fixup_address
        );

        let sym_to_fix = builder.find_symbol_by_address(fixup_address)?;
        let block_to_fix = builder.graph.symbol_block(sym_to_fix).ok_or_else(|| {
            Error::MissingSymbol(format!("no block covering address {:#x}", fixup_address))
        })?;

        let block_address = builder.graph.blocks[block_to_fix].address;
        let block_end = builder.graph.blocks[block_to_fix].end_address();
        if fixup_address + (1u64 << ri.r_length) > block_end {
            return Err(Error::ExtentOverflow(format!(
                "fixup at {:#x} (width {}) extends past block {:#x}..{:#x}",
                fixup_address,
                1u64 << ri.r_length,
                block_address,
                block_end
            )));
        }
        let fixup_offset = (fixup_address - block_address) as usize;

        // An ADDEND record carries only an addend for the following
        // branch/page relocation; fold it in and continue with the pair.
        let mut addend: i64 = 0;
        if kind == RelocKind::PairedAddend {
            addend = ri.r_symbolnum as i64;
            i += 1;
            if i == relocs.len() {
                return Err(Error::BadRelocation(format!(
                    "unpaired ADDEND relocation at {:#018x}",
                    fixup_address
                )));
            }
            ri = relocs[i];
            kind = classify(&ri)?;
            if !matches!(
                kind,
                RelocKind::Branch26 | RelocKind::Page21 | RelocKind::PageOffset12
            ) {
                return Err(Error::BadRelocation(format!(
                    "invalid relocation pair: ADDEND + {}",
                    kind.name()
                )));
            }
            trace!("  pair is {}", kind.name());
            if section_address + ri.r_address as u64 != fixup_address {
                return Err(Error::BadRelocation(format!(
                    "relocation paired with ADDEND at {:#018x} points at a different target",
                    fixup_address
                )));
            }
        }

        let (edge_kind, target, addend) = match kind {
            RelocKind::Branch26 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                let instr = block_u32(&builder.graph, block_to_fix, fixup_offset);
                if instr & 0x7fff_ffff != 0x1400_0000 {
                    return Err(Error::BadInstr(format!(
                        "BRANCH26 at {:#x} is not a B or BL instruction with a zero addend \
                         ({:#010x})",
                        fixup_address, instr
                    )));
                }
                (EdgeKind::Branch26, target, addend)
            }
            RelocKind::Pointer32 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                let value = block_u32(&builder.graph, block_to_fix, fixup_offset);
                (EdgeKind::Pointer32, target, value as i64)
            }
            RelocKind::Pointer64 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                let value = block_u64(&builder.graph, block_to_fix, fixup_offset);
                (EdgeKind::Pointer64, target, value as i64)
            }
            RelocKind::Pointer64Anon => {
                let target_address = block_u64(&builder.graph, block_to_fix, fixup_offset);
                let target = builder.find_symbol_by_address(target_address)?;
                let addend = target_address.wrapping_sub(builder.graph.symbol_address(target));
                (EdgeKind::Pointer64Anon, target, addend as i64)
            }
            RelocKind::Page21 | RelocKind::GOTPage21 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                let instr = block_u32(&builder.graph, block_to_fix, fixup_offset);
                if instr & 0xffff_ffe0 != 0x9000_0000 {
                    return Err(Error::BadInstr(format!(
                        "PAGE21/GOTPAGE21 at {:#x} is not an ADRP instruction with a zero \
                         addend ({:#010x})",
                        fixup_address, instr
                    )));
                }
                let edge_kind = if kind == RelocKind::Page21 {
                    EdgeKind::Page21
                } else {
                    EdgeKind::GOTPage21
                };
                (edge_kind, target, addend)
            }
            RelocKind::PageOffset12 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                (EdgeKind::PageOffset12, target, addend)
            }
            RelocKind::GOTPageOffset12 => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                let instr = block_u32(&builder.graph, block_to_fix, fixup_offset);
                if instr & 0xffff_fc00 != 0xf940_0000 {
                    return Err(Error::BadInstr(format!(
                        "GOTPAGEOFF12 at {:#x} is not a 64-bit LDR immediate instruction \
                         with a zero addend ({:#010x})",
                        fixup_address, instr
                    )));
                }
                (EdgeKind::GOTPageOffset12, target, addend)
            }
            RelocKind::PointerToGOT => {
                let target = builder.find_symbol_by_index(ri.r_symbolnum)?;
                (EdgeKind::PointerToGOT, target, addend)
            }
            RelocKind::Delta32 | RelocKind::Delta64 => {
                // SUBTRACTOR consumes the following UNSIGNED record; the
                // pair decides between Delta and NegDelta.
                i += 1;
                parse_pair_relocation(builder, &ri, relocs.get(i), fixup_address, block_to_fix)?
            }
            RelocKind::PairedAddend => unreachable!("ADDEND is folded into its pair above"),
        };

        trace!(
            "  edge {} at offset {:#x} -> {} + {:#x}",
            edge_kind,
            fixup_offset,
            builder.graph.symbol_name(target),
            addend
        );
        builder.graph.add_edge(
            block_to_fix,
            Edge {
                kind: edge_kind,
                offset: fixup_offset as u64,
                target,
                addend,
            },
        );
        i += 1;
    }
    Ok(())
}

/// Parse a SUBTRACTOR/UNSIGNED pair into the edge kind, target, and addend
/// to use.
///
/// The pair encodes `B - A` into the data word at the shared fixup address.
/// If the fixup lies in A's block the edge is `Delta` to B; if it lies in
/// B's block the edge is `NegDelta` to A; anywhere else is an error. An
/// external A can never match the fixup block (it has no block), so such
/// pairs are rejected by the final arm rather than silently accepted.
fn parse_pair_relocation(
    builder: &GraphBuilder,
    sub_ri: &RelocationInfo,
    unsigned_ri: Option<&RelocationInfo>,
    fixup_address: u64,
    block_to_fix: BlockId,
) -> Result<(EdgeKind, SymbolId, i64)> {
    debug_assert!(sub_ri.r_extern && !sub_ri.r_pcrel);
    debug_assert!(sub_ri.r_length == 2 || sub_ri.r_length == 3);

    let unsigned_ri = unsigned_ri.ok_or_else(|| {
        Error::BadRelocation(format!(
            "SUBTRACTOR at {:#x} without paired UNSIGNED relocation",
            fixup_address
        ))
    })?;
    if sub_ri.r_address != unsigned_ri.r_address {
        return Err(Error::BadRelocation(format!(
            "SUBTRACTOR and paired UNSIGNED at {:#x} point to different addresses",
            fixup_address
        )));
    }
    if sub_ri.r_length != unsigned_ri.r_length {
        return Err(Error::BadRelocation(format!(
            "length of SUBTRACTOR and paired UNSIGNED at {:#x} must match",
            fixup_address
        )));
    }

    let g = &builder.graph;
    let from = builder.find_symbol_by_index(sub_ri.r_symbolnum)?;

    let fixup_offset = (fixup_address - g.blocks[block_to_fix].address) as usize;
    let mut fixup_value: i64 = if sub_ri.r_length == 3 {
        block_u64(g, block_to_fix, fixup_offset) as i64
    } else {
        block_u32(g, block_to_fix, fixup_offset) as i32 as i64
    };

    let to = if unsigned_ri.r_extern {
        builder.find_symbol_by_index(unsigned_ri.r_symbolnum)?
    } else {
        let to = builder.find_symbol_by_address(fixup_value as u64)?;
        fixup_value = fixup_value.wrapping_sub(g.symbol_address(to) as i64);
        to
    };

    if g.symbol_block(from) == Some(block_to_fix) {
        let kind = if sub_ri.r_length == 3 {
            EdgeKind::Delta64
        } else {
            EdgeKind::Delta32
        };
        let delta = fixup_address.wrapping_sub(g.symbol_address(from)) as i64;
        Ok((kind, to, fixup_value.wrapping_add(delta)))
    } else if g.symbol_block(to) == Some(block_to_fix) {
        let kind = if sub_ri.r_length == 3 {
            EdgeKind::NegDelta64
        } else {
            EdgeKind::NegDelta32
        };
        let delta = fixup_address.wrapping_sub(g.symbol_address(to)) as i64;
        Ok((kind, from, fixup_value.wrapping_sub(delta)))
    } else {
        Err(Error::BadRelocation(format!(
            "SUBTRACTOR at {:#x} must fix up either 'A' or 'B' (or a symbol in one of their \
             alt-entry groups)",
            fixup_address
        )))
    }
}

fn is_got_edge(kind: EdgeKind) -> bool {
    matches!(
        kind,
        EdgeKind::GOTPage21 | EdgeKind::GOTPageOffset12 | EdgeKind::PointerToGOT
    )
}

/// Run the GOT-and-stubs pass over the graph.
pub fn build_got_and_stubs(graph: &mut LinkGraph) -> Result<()> {
    GotAndStubsBuilder::new(graph).run()
}

/// Materializes GOT entries and branch stubs and retargets edges onto them.
///
/// Guarantees at most one GOT entry and at most one stub per distinct
/// target symbol. The per-target caches live only for this pass.
struct GotAndStubsBuilder<'g> {
    graph: &'g mut LinkGraph,
    got_section: Option<SectionId>,
    stubs_section: Option<SectionId>,
    got_entries: HashMap<SymbolId, SymbolId>,
    stubs: HashMap<SymbolId, SymbolId>,
}

impl<'g> GotAndStubsBuilder<'g> {
    fn new(graph: &'g mut LinkGraph) -> GotAndStubsBuilder<'g> {
        GotAndStubsBuilder {
            graph,
            got_section: None,
            stubs_section: None,
            got_entries: HashMap::new(),
            stubs: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<()> {
        // Snapshot the block list: entries and stubs created below must not
        // be rescanned (their internal edges are not GOT or branch edges
        // anyway, but the arena grows while we iterate).
        let blocks: Vec<BlockId> = self.graph.blocks.indices().collect();
        for block in blocks {
            if self.graph.blocks[block].dead {
                continue;
            }
            let edge_count = self.graph.blocks[block].edges.len();
            for i in 0..edge_count {
                let edge = self.graph.blocks[block].edges[i].clone();
                if is_got_edge(edge.kind) {
                    let entry = self.got_entry(edge.target);
                    let e = &mut self.graph.blocks[block].edges[i];
                    e.target = entry;
                    // A page/pageoff edge stays page-relative to the slot; a
                    // PointerToGOT becomes a plain 32-bit delta to it.
                    if e.kind == EdgeKind::PointerToGOT {
                        e.kind = EdgeKind::Delta32;
                    }
                } else if edge.kind == EdgeKind::Branch26
                    && !self.graph.symbol_is_defined(edge.target)
                {
                    if edge.addend != 0 {
                        return Err(Error::BadRelocation(format!(
                            "external branch to {} at block offset {:#x} has non-zero \
                             addend {:#x}",
                            self.graph.symbol_name(edge.target),
                            edge.offset,
                            edge.addend
                        )));
                    }
                    let stub = self.stub(edge.target);
                    self.graph.blocks[block].edges[i].target = stub;
                }
            }
        }
        Ok(())
    }

    /// Obtain-or-create the GOT entry for `target`.
    fn got_entry(&mut self, target: SymbolId) -> SymbolId {
        if let Some(&entry) = self.got_entries.get(&target) {
            return entry;
        }
        let section = self.got_section();
        let block =
            self.graph
                .create_content_block(section, NULL_GOT_ENTRY_CONTENT.to_vec(), 0, 8);
        self.graph.add_edge(
            block,
            Edge {
                kind: EdgeKind::Pointer64,
                offset: 0,
                target,
                addend: 0,
            },
        );
        let entry = self.graph.add_anonymous_symbol(block, 0, 8, false);
        debug!("GOT entry for {}", self.graph.symbol_name(target));
        self.got_entries.insert(target, entry);
        entry
    }

    /// Obtain-or-create the stub for `target`. Stubs load through the
    /// target's GOT entry, so the entry is shared with any GOT edges.
    fn stub(&mut self, target: SymbolId) -> SymbolId {
        if let Some(&stub) = self.stubs.get(&target) {
            return stub;
        }
        let got_entry = self.got_entry(target);
        let section = self.stubs_section();
        let block = self
            .graph
            .create_content_block(section, STUB_CONTENT.to_vec(), 0, 4);
        self.graph.add_edge(
            block,
            Edge {
                kind: EdgeKind::LDRLiteral19,
                offset: 0,
                target: got_entry,
                addend: 0,
            },
        );
        let stub = self.graph.add_anonymous_symbol(block, 0, 8, false);
        debug!("Stub for {}", self.graph.symbol_name(target));
        self.stubs.insert(target, stub);
        stub
    }

    fn got_section(&mut self) -> SectionId {
        if let Some(section) = self.got_section {
            return section;
        }
        let section = self.graph.create_section(GOT_SECTION_NAME, libc::PROT_READ);
        self.got_section = Some(section);
        section
    }

    fn stubs_section(&mut self) -> SectionId {
        if let Some(section) = self.stubs_section {
            return section;
        }
        let section = self
            .graph
            .create_section(STUBS_SECTION_NAME, libc::PROT_READ | libc::PROT_EXEC);
        self.stubs_section = Some(section);
        section
    }
}

/// The immediate scale of a PAGEOFF12-class instruction.
fn page_offset12_shift(instr: u32) -> u32 {
    const LDR_LITERAL_MASK: u32 = 0x3fff_fc00;

    // GPR LDR immediate with a zero embedded offset; the top two bits hold
    // the operand size.
    if instr & LDR_LITERAL_MASK == 0x3940_0000 {
        return instr >> 30;
    }

    // Neon LDR immediate of size 64-bit or less with a zero embedded
    // offset; the top two bits hold the size.
    if instr & LDR_LITERAL_MASK == 0x3d40_0000 {
        return instr >> 30;
    }

    // Neon LDR immediate of size 128-bit.
    if instr & 0xffff_fc00 == 0x3dc0_0000 {
        return 4;
    }

    // ADD immediate and everything else is unscaled.
    0
}

/// Resolve one edge and patch the fixup in the block's working memory.
///
/// Every symbol must have its final runtime address assigned before this is
/// called. Edges are expected in insertion order; each fixup reads and
/// writes only its own bytes.
pub fn apply_fixup(
    graph: &LinkGraph,
    block: BlockId,
    edge: &Edge,
    working_mem: &mut [u8],
) -> Result<()> {
    let offset = edge.offset as usize;
    let width = edge.kind.fixup_width() as usize;
    if offset + width > working_mem.len() {
        return Err(Error::ExtentOverflow(format!(
            "{} fixup at offset {:#x} (width {}) exceeds block of {} bytes",
            edge.kind,
            edge.offset,
            width,
            working_mem.len()
        )));
    }

    let block_address = graph.blocks[block].address;
    let fixup_address = block_address + edge.offset;
    let target_address = graph.symbol_address(edge.target);

    match edge.kind {
        EdgeKind::Branch26 => {
            debug_assert_eq!(fixup_address & 0x3, 0, "branch site is not 32-bit aligned");
            let value =
                (target_address.wrapping_sub(fixup_address) as i64).wrapping_add(edge.addend);
            if value & 0x3 != 0 {
                return Err(Error::Misalignment(format!(
                    "Branch26 target is not 32-bit aligned: {}",
                    edge_context(graph, block, edge, target_address)
                )));
            }
            if !(-(1i64 << 27)..1i64 << 27).contains(&value) {
                return Err(out_of_range(graph, block, edge, target_address, value));
            }
            let raw = read_u32_le(working_mem, offset);
            if raw & 0x7fff_ffff != 0x1400_0000 {
                return Err(bad_fixup_instr(graph, block, edge, raw, "a B or BL immediate"));
            }
            let imm = (value >> 2) as u32 & 0x03ff_ffff;
            write_u32_le(working_mem, offset, (raw & 0xfc00_0000) | imm);
        }
        EdgeKind::Pointer32 => {
            let value = target_address.wrapping_add(edge.addend as u64);
            if value > u32::MAX as u64 {
                return Err(out_of_range(graph, block, edge, target_address, value as i64));
            }
            write_u32_le(working_mem, offset, value as u32);
        }
        EdgeKind::Pointer64 | EdgeKind::Pointer64Anon => {
            let value = target_address.wrapping_add(edge.addend as u64);
            write_u64_le(working_mem, offset, value);
        }
        EdgeKind::Page21 | EdgeKind::GOTPage21 => {
            check_zero_addend(graph, block, edge, target_address)?;
            let target_page = target_address & !0xfffu64;
            let pc_page = block_address & !0xfffu64;
            let page_delta = target_page.wrapping_sub(pc_page) as i64;
            if !(-(1i64 << 30)..1i64 << 30).contains(&page_delta) {
                return Err(out_of_range(graph, block, edge, target_address, page_delta));
            }
            let raw = read_u32_le(working_mem, offset);
            if raw & 0xffff_ffe0 != 0x9000_0000 {
                return Err(bad_fixup_instr(graph, block, edge, raw, "an ADRP"));
            }
            let imm_lo = (page_delta >> 12) as u32 & 0x3;
            let imm_hi = (page_delta >> 14) as u32 & 0x7_ffff;
            write_u32_le(working_mem, offset, raw | imm_lo << 29 | imm_hi << 5);
        }
        EdgeKind::PageOffset12 => {
            check_zero_addend(graph, block, edge, target_address)?;
            let raw = read_u32_le(working_mem, offset);
            let shift = page_offset12_shift(raw);
            let target_offset = target_address & 0xfff;
            if target_offset & ((1u64 << shift) - 1) != 0 {
                return Err(Error::Misalignment(format!(
                    "PAGEOFF12 target is not {}-byte aligned: {}",
                    1u32 << shift,
                    edge_context(graph, block, edge, target_address)
                )));
            }
            let imm = (target_offset as u32 >> shift) << 10;
            write_u32_le(working_mem, offset, raw | imm);
        }
        EdgeKind::GOTPageOffset12 => {
            check_zero_addend(graph, block, edge, target_address)?;
            let raw = read_u32_le(working_mem, offset);
            if raw & 0xffff_fc00 != 0xf940_0000 {
                return Err(bad_fixup_instr(graph, block, edge, raw, "a 64-bit LDR immediate"));
            }
            let target_offset = (target_address & 0xfff) as u32;
            write_u32_le(working_mem, offset, raw | target_offset << 10);
        }
        EdgeKind::LDRLiteral19 => {
            debug_assert_eq!(fixup_address & 0x3, 0, "LDR site is not 32-bit aligned");
            check_zero_addend(graph, block, edge, target_address)?;
            let raw = read_u32_le(working_mem, offset);
            if raw != 0x5800_0010 {
                return Err(bad_fixup_instr(graph, block, edge, raw, "LDR x16, <literal>"));
            }
            let delta = target_address.wrapping_sub(fixup_address) as i64;
            if delta & 0x3 != 0 {
                return Err(Error::Misalignment(format!(
                    "LDR literal target is not 32-bit aligned: {}",
                    edge_context(graph, block, edge, target_address)
                )));
            }
            if !(-(1i64 << 20)..1i64 << 20).contains(&delta) {
                return Err(out_of_range(graph, block, edge, target_address, delta));
            }
            let imm = ((delta >> 2) as u32 & 0x7_ffff) << 5;
            write_u32_le(working_mem, offset, raw | imm);
        }
        EdgeKind::Delta32 | EdgeKind::Delta64 | EdgeKind::NegDelta32 | EdgeKind::NegDelta64 => {
            let value = match edge.kind {
                EdgeKind::Delta32 | EdgeKind::Delta64 => {
                    (target_address.wrapping_sub(fixup_address) as i64).wrapping_add(edge.addend)
                }
                _ => (fixup_address.wrapping_sub(target_address) as i64).wrapping_add(edge.addend),
            };
            match edge.kind {
                EdgeKind::Delta32 | EdgeKind::NegDelta32 => {
                    if value < i32::MIN as i64 || value > i32::MAX as i64 {
                        return Err(out_of_range(graph, block, edge, target_address, value));
                    }
                    write_u32_le(working_mem, offset, value as i32 as u32);
                }
                _ => write_u64_le(working_mem, offset, value as u64),
            }
        }
        EdgeKind::PointerToGOT => {
            // Must have been rewritten to Delta32 by the GOT pass.
            return Err(Error::BadRelocation(format!(
                "PointerToGOT edge survived the GOT pass: {}",
                edge_context(graph, block, edge, target_address)
            )));
        }
    }
    Ok(())
}

fn check_zero_addend(
    graph: &LinkGraph,
    block: BlockId,
    edge: &Edge,
    target_address: u64,
) -> Result<()> {
    if edge.addend != 0 {
        return Err(Error::BadRelocation(format!(
            "{} fixup carries unsupported non-zero addend: {}",
            edge.kind,
            edge_context(graph, block, edge, target_address)
        )));
    }
    Ok(())
}

/// Diagnostic context for fixup failures: kind, fixup address, block range,
/// and target.
fn edge_context(graph: &LinkGraph, block: BlockId, edge: &Edge, target_address: u64) -> String {
    let b = &graph.blocks[block];
    format!(
        "{} edge at {:#x} (block {:#x}..{:#x}) -> {} at {:#x}, addend {}",
        edge.kind,
        b.address + edge.offset,
        b.address,
        b.end_address(),
        graph.symbol_name(edge.target),
        target_address,
        edge.addend
    )
}

fn out_of_range(
    graph: &LinkGraph,
    block: BlockId,
    edge: &Edge,
    target_address: u64,
    value: i64,
) -> Error {
    Error::OutOfRange(format!(
        "value {} does not fit: {}",
        value,
        edge_context(graph, block, edge, target_address)
    ))
}

fn bad_fixup_instr(
    graph: &LinkGraph,
    block: BlockId,
    edge: &Edge,
    raw: u32,
    expected: &str,
) -> Error {
    let target_address = graph.symbol_address(edge.target);
    Error::BadInstr(format!(
        "{:#010x} is not {}: {}",
        raw,
        expected,
        edge_context(graph, block, edge, target_address)
    ))
}

fn block_u32(graph: &LinkGraph, block: BlockId, offset: usize) -> u32 {
    read_u32_le(&graph.blocks[block].content, offset)
}

fn block_u64(graph: &LinkGraph, block: BlockId, offset: usize) -> u64 {
    read_u64_le(&graph.blocks[block].content, offset)
}

fn read_u32_le(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_u64_le(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ])
}

fn write_u32_le(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64_le(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
