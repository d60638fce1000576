//! Generic Mach-O link-graph construction.
//!
//! Walks a parsed object's sections and symbol table and populates a
//! [`LinkGraph`]: one graph section and one content block per object
//! section, and one graph symbol per non-debug nlist entry. The builder
//! also keeps the two lookup structures the relocation parser needs:
//! symbol-table index to graph symbol, and address to covering symbol.

use crate::graph::{BlockId, LinkGraph, Scope, SymbolId};
use crate::macho::{MachOObject, N_ABS, N_SECT, N_UNDF};
use crate::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub struct GraphBuilder {
    pub graph: LinkGraph,
    /// Graph symbol per symbol-table index; `None` for skipped stab entries.
    symtab: Vec<Option<SymbolId>>,
    /// Defined symbols keyed by their (object-file) address.
    by_address: BTreeMap<u64, SymbolId>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> GraphBuilder {
        GraphBuilder {
            graph: LinkGraph::new(),
            symtab: Vec::new(),
            by_address: BTreeMap::new(),
        }
    }

    /// Build the graph skeleton (sections, blocks, symbols) from an object.
    /// Relocation parsing happens separately, through the arm64 backend.
    pub fn build_from_object(obj: &MachOObject) -> Result<GraphBuilder> {
        let mut builder = GraphBuilder::new();

        let mut section_blocks: Vec<BlockId> = Vec::with_capacity(obj.sections.len());
        for section in &obj.sections {
            // Objects carry no per-section protections; the segment name
            // decides, as when loading a linked image.
            let prot = if section.segname == "__TEXT" {
                libc::PROT_READ | libc::PROT_EXEC
            } else {
                libc::PROT_READ | libc::PROT_WRITE
            };
            let name = format!("{},{}", section.segname, section.sectname);
            let graph_section = builder.graph.create_section(&name, prot);
            let content = obj.section_content(section)?;
            let block = builder.graph.create_content_block(
                graph_section,
                content,
                section.addr,
                1u64 << section.align,
            );
            trace!(
                "Block for {} at {:#x}, {} bytes",
                name,
                section.addr,
                section.size
            );
            section_blocks.push(block);
        }

        for nlist in &obj.symbols {
            if nlist.is_stab() {
                builder.symtab.push(None);
                continue;
            }
            let name = obj.symbol_name(nlist)?;
            let sym = match nlist.type_bits() {
                N_UNDF => builder.graph.add_external_symbol(name.to_string()),
                N_ABS => builder
                    .graph
                    .add_absolute_symbol(Some(name.to_string()), nlist.n_value),
                N_SECT => {
                    let block = *section_blocks
                        .get(nlist.n_sect as usize - 1)
                        .ok_or_else(|| {
                            Error::ObjectFormat(format!(
                                "symbol {} names section {} which does not exist",
                                name, nlist.n_sect
                            ))
                        })?;
                    let block_addr = builder.graph.blocks[block].address;
                    let block_end = builder.graph.blocks[block].end_address();
                    if nlist.n_value < block_addr || nlist.n_value > block_end {
                        return Err(Error::ObjectFormat(format!(
                            "symbol {} at {:#x} lies outside its section",
                            name, nlist.n_value
                        )));
                    }
                    let scope = if nlist.is_external() {
                        Scope::Global
                    } else {
                        Scope::Local
                    };
                    let sym = builder.graph.add_defined_symbol(
                        Some(name.to_string()),
                        block,
                        nlist.n_value - block_addr,
                        0,
                        scope,
                        false,
                    );
                    builder.by_address.insert(nlist.n_value, sym);
                    sym
                }
                bits => {
                    return Err(Error::ObjectFormat(format!(
                        "symbol {} has unsupported type {:#x}",
                        name, bits
                    )))
                }
            };
            builder.symtab.push(Some(sym));
        }

        builder.assign_symbol_sizes();
        for block in section_blocks {
            builder.ensure_block_coverage(block);
        }
        debug!(
            "Graph built: {} sections, {} blocks, {} symbols",
            builder.graph.sections.len(),
            builder.graph.blocks.len(),
            builder.graph.symbols.len()
        );
        Ok(builder)
    }

    pub fn into_graph(self) -> LinkGraph {
        self.graph
    }

    /// Symbol-table index to graph symbol.
    pub fn find_symbol_by_index(&self, index: u32) -> Result<SymbolId> {
        match self.symtab.get(index as usize) {
            Some(Some(sym)) => Ok(*sym),
            _ => Err(Error::MissingSymbol(format!(
                "no symbol at index {}",
                index
            ))),
        }
    }

    /// Address to a symbol whose block covers that address.
    pub fn find_symbol_by_address(&self, addr: u64) -> Result<SymbolId> {
        if let Some((_, &sym)) = self.by_address.range(..=addr).next_back() {
            if let Some(block) = self.graph.symbol_block(sym) {
                if self.graph.blocks[block].covers(addr) {
                    return Ok(sym);
                }
            }
        }
        Err(Error::MissingSymbol(format!(
            "no symbol covering address {:#x}",
            addr
        )))
    }

    /// Record a symbol as the next symbol-table entry. Used when building
    /// graphs by hand; `build_from_object` goes through the same path.
    pub fn push_symtab_entry(&mut self, sym: Option<SymbolId>) {
        self.symtab.push(sym);
    }

    /// Index a defined symbol for address lookup.
    pub fn index_symbol_address(&mut self, sym: SymbolId) {
        let addr = self.graph.symbol_address(sym);
        self.by_address.insert(addr, sym);
    }

    /// Infer defined-symbol sizes from the distance to the next symbol in
    /// the same block (or the block end for the last one).
    fn assign_symbol_sizes(&mut self) {
        let mut per_block: BTreeMap<BlockId, Vec<(u64, SymbolId)>> = BTreeMap::new();
        for (id, sym) in self.graph.symbols.iter_enumerated() {
            if let crate::graph::Place::Defined { block, offset } = sym.place {
                per_block.entry(block).or_default().push((offset, id));
            }
        }
        for (block, mut syms) in per_block {
            let block_len = self.graph.blocks[block].content.len() as u64;
            syms.sort_by_key(|&(offset, _)| offset);
            for i in 0..syms.len() {
                let (offset, sym) = syms[i];
                let next = syms[i + 1..]
                    .iter()
                    .map(|&(o, _)| o)
                    .find(|&o| o > offset)
                    .unwrap_or(block_len);
                self.graph.symbols[sym].size = next - offset;
            }
        }
    }

    /// Guarantee the block start is covered by some symbol, so that
    /// `find_symbol_by_address` is total over block extents.
    fn ensure_block_coverage(&mut self, block: BlockId) {
        let addr = self.graph.blocks[block].address;
        let len = self.graph.blocks[block].content.len() as u64;
        if len == 0 {
            return;
        }
        let covered = self
            .by_address
            .get(&addr)
            .and_then(|&s| self.graph.symbol_block(s))
            .is_some_and(|b| b == block);
        if !covered {
            let first_sym_offset = self
                .graph
                .symbols
                .iter()
                .filter_map(|s| match s.place {
                    crate::graph::Place::Defined { block: b, offset } if b == block => Some(offset),
                    _ => None,
                })
                .filter(|&o| o > 0)
                .min()
                .unwrap_or(len);
            let sym = self
                .graph
                .add_anonymous_symbol(block, 0, first_sym_offset, false);
            self.by_address.insert(addr, sym);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Place;
    use crate::macho::testutil::ObjBuilder;
    use crate::macho::{N_EXT, N_SECT, N_UNDF};

    fn two_symbol_object() -> Vec<u8> {
        let mut obj = ObjBuilder::new();
        obj.section("__TEXT", "__text", 0x0, 2, vec![0u8; 0x20]);
        obj.symbol("_first", N_SECT | N_EXT, 1, 0x0);
        obj.symbol("_second", N_SECT | N_EXT, 1, 0x10);
        obj.symbol("_puts", N_UNDF | N_EXT, 0, 0);
        obj.build()
    }

    #[test]
    fn builds_sections_blocks_and_symbols() {
        let bytes = two_symbol_object();
        let obj = MachOObject::parse(&bytes).unwrap();
        let builder = GraphBuilder::build_from_object(&obj).unwrap();
        let g = &builder.graph;

        assert_eq!(g.sections.len(), 1);
        assert_eq!(g.blocks.len(), 1);
        assert_eq!(g.section_by_name("__TEXT,__text").is_some(), true);

        let first = builder.find_symbol_by_index(0).unwrap();
        let second = builder.find_symbol_by_index(1).unwrap();
        let puts = builder.find_symbol_by_index(2).unwrap();
        assert_eq!(g.symbol_address(first), 0x0);
        assert_eq!(g.symbol_address(second), 0x10);
        assert!(g.symbol_is_defined(first));
        assert!(!g.symbol_is_defined(puts));
    }

    #[test]
    fn symbol_sizes_from_next_symbol() {
        let bytes = two_symbol_object();
        let obj = MachOObject::parse(&bytes).unwrap();
        let builder = GraphBuilder::build_from_object(&obj).unwrap();
        let first = builder.find_symbol_by_index(0).unwrap();
        let second = builder.find_symbol_by_index(1).unwrap();
        assert_eq!(builder.graph.symbols[first].size, 0x10);
        assert_eq!(builder.graph.symbols[second].size, 0x10);
    }

    #[test]
    fn address_lookup_respects_block_extents() {
        let bytes = two_symbol_object();
        let obj = MachOObject::parse(&bytes).unwrap();
        let builder = GraphBuilder::build_from_object(&obj).unwrap();

        let sym = builder.find_symbol_by_address(0x14).unwrap();
        assert_eq!(builder.graph.symbol_address(sym), 0x10);

        // Past the end of the only block.
        assert!(builder.find_symbol_by_address(0x20).is_err());
        assert!(builder.find_symbol_by_index(7).is_err());
    }

    #[test]
    fn uncovered_block_start_gets_anonymous_symbol() {
        let mut objb = ObjBuilder::new();
        objb.section("__DATA", "__const", 0x100, 3, vec![0u8; 0x18]);
        // Only symbol sits mid-block.
        objb.symbol("_mid", N_SECT, 1, 0x108);
        let bytes = objb.build();

        let obj = MachOObject::parse(&bytes).unwrap();
        let builder = GraphBuilder::build_from_object(&obj).unwrap();
        let cover = builder.find_symbol_by_address(0x100).unwrap();
        let sym = &builder.graph.symbols[cover];
        assert!(sym.name.is_none());
        assert_eq!(sym.size, 0x8);
        match sym.place {
            Place::Defined { offset, .. } => assert_eq!(offset, 0),
            _ => panic!("coverage symbol must be defined"),
        }
    }
}
