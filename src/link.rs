//! Pass configuration and the link driver.
//!
//! A link runs as a fixed sequence over one mutable graph: build the graph
//! from the object, run the pre-prune passes (mark-live), prune, run the
//! post-prune passes (GOT and stubs), lay out final addresses, resolve
//! external symbols through the context, and apply fixups. Every phase is
//! strictly sequential and any failure aborts the whole link.

use crate::graph::{BlockId, LinkGraph, Place, SectionId, SymbolId};
use crate::macho::arm64;
use crate::macho::builder::GraphBuilder;
use crate::macho::MachOObject;
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, trace};

/// The target triple served by this linker.
pub const TRIPLE: &str = "arm64-apple-ios";

const PAGE_SIZE: u64 = 4096;

/// A graph transformation pass.
pub type Pass = Box<dyn FnMut(&mut LinkGraph) -> Result<()>>;

/// Passes to run before and after the prune phase.
#[derive(Default)]
pub struct PassConfiguration {
    pub pre_prune_passes: Vec<Pass>,
    pub post_prune_passes: Vec<Pass>,
}

/// Host environment for one link: the input object, address-space
/// decisions, external symbol resolution, and failure reporting.
pub trait JitLinkContext {
    /// The raw Mach-O object to link.
    fn object_data(&self) -> &[u8];

    /// Base address at which the linked image is laid out.
    fn base_address(&self) -> u64;

    fn should_add_default_target_passes(&self, _triple: &str) -> bool {
        true
    }

    /// Host-supplied mark-live pass. When `None`, every symbol is marked
    /// live, which makes prune a no-op.
    fn get_mark_live_pass(&self, _triple: &str) -> Option<Pass> {
        None
    }

    /// Last chance to adjust the pass pipeline before it runs.
    fn modify_pass_config(
        &mut self,
        _triple: &str,
        _config: &mut PassConfiguration,
    ) -> Result<()> {
        Ok(())
    }

    /// Resolve an external symbol to its runtime address.
    fn resolve_external(&mut self, name: &str) -> Result<u64>;

    /// Receives the terminal error when the link fails.
    fn notify_failed(&mut self, err: Error);
}

/// Link one Mach-O/arm64 object.
///
/// On success the finalized graph (with patched block content and assigned
/// addresses) is returned to the caller. On failure the error is delivered
/// through the context's `notify_failed` and `None` is returned.
pub fn jit_link_macho_arm64<C: JitLinkContext>(mut ctx: C) -> Option<LinkGraph> {
    match run_link(&mut ctx) {
        Ok(graph) => Some(graph),
        Err(err) => {
            ctx.notify_failed(err);
            None
        }
    }
}

fn run_link<C: JitLinkContext>(ctx: &mut C) -> Result<LinkGraph> {
    let obj = MachOObject::parse(ctx.object_data())?;
    let mut builder = GraphBuilder::build_from_object(&obj)?;
    arm64::add_relocations(&mut builder, &obj)?;
    let mut graph = builder.into_graph();

    let mut config = PassConfiguration::default();
    if ctx.should_add_default_target_passes(TRIPLE) {
        let mark_live = ctx
            .get_mark_live_pass(TRIPLE)
            .unwrap_or_else(|| Box::new(mark_all_symbols_live));
        config.pre_prune_passes.push(mark_live);
        config
            .post_prune_passes
            .push(Box::new(arm64::build_got_and_stubs));
    }
    ctx.modify_pass_config(TRIPLE, &mut config)?;

    for pass in &mut config.pre_prune_passes {
        pass(&mut graph)?;
    }
    prune(&mut graph);
    for pass in &mut config.post_prune_passes {
        pass(&mut graph)?;
    }

    layout(&mut graph, ctx.base_address());
    resolve_externals(ctx, &mut graph)?;
    apply_fixups(&mut graph)?;

    debug!(
        "Link complete: {} sections, {} blocks, {} symbols",
        graph.sections.len(),
        graph.blocks.len(),
        graph.symbols.len()
    );
    Ok(graph)
}

/// Fallback mark-live pass: every symbol is live.
pub fn mark_all_symbols_live(graph: &mut LinkGraph) -> Result<()> {
    for sym in graph.symbols.iter_mut() {
        sym.live = true;
    }
    Ok(())
}

/// Hide blocks unreachable from any live symbol. Dead blocks keep their
/// ids (edges stay valid) but are skipped by layout and fixup.
fn prune(graph: &mut LinkGraph) {
    let mut live_blocks: HashSet<BlockId> = HashSet::new();
    let mut worklist: Vec<BlockId> = Vec::new();
    for sym in graph.symbols.iter() {
        if sym.live {
            if let Place::Defined { block, .. } = sym.place {
                if live_blocks.insert(block) {
                    worklist.push(block);
                }
            }
        }
    }
    while let Some(block) = worklist.pop() {
        for edge in &graph.blocks[block].edges {
            if let Some(target_block) = graph.symbol_block(edge.target) {
                if live_blocks.insert(target_block) {
                    worklist.push(target_block);
                }
            }
        }
    }

    let mut pruned = 0usize;
    let ids: Vec<BlockId> = graph.blocks.indices().collect();
    for id in ids {
        if !live_blocks.contains(&id) {
            graph.blocks[id].dead = true;
            pruned += 1;
        }
    }
    if pruned > 0 {
        debug!("Pruned {} unreachable blocks", pruned);
    }
}

/// Assign final runtime addresses: sections in creation order from the
/// base address, each starting on a fresh page, blocks in section order at
/// their own alignment.
fn layout(graph: &mut LinkGraph, base_address: u64) {
    let mut addr = base_address;
    let sections: Vec<SectionId> = graph.sections.indices().collect();
    for section in sections {
        addr = align_up(addr, PAGE_SIZE);
        let start = addr;
        let blocks = graph.sections[section].blocks.clone();
        for block in blocks {
            if graph.blocks[block].dead {
                continue;
            }
            let alignment = graph.blocks[block].alignment.max(1);
            addr = align_up(addr, alignment);
            graph.blocks[block].address = addr;
            addr += graph.blocks[block].content.len() as u64;
        }
        trace!(
            "Section {} laid out at {:#x}..{:#x}",
            graph.sections[section].name,
            start,
            addr
        );
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Assign addresses to every external symbol referenced from a live block.
fn resolve_externals<C: JitLinkContext>(ctx: &mut C, graph: &mut LinkGraph) -> Result<()> {
    let mut referenced: HashSet<SymbolId> = HashSet::new();
    for block in graph.blocks.iter() {
        if block.dead {
            continue;
        }
        for edge in &block.edges {
            referenced.insert(edge.target);
        }
    }
    let mut ids: Vec<SymbolId> = referenced.into_iter().collect();
    ids.sort();
    for sym in ids {
        if matches!(graph.symbols[sym].place, Place::External { .. }) {
            let name = graph.symbols[sym].name.clone().ok_or_else(|| {
                Error::UnresolvedSymbol("external symbol has no name".to_string())
            })?;
            let address = ctx.resolve_external(&name)?;
            debug!("Resolved {} -> {:#018x}", name, address);
            graph.symbols[sym].place = Place::External { address };
        }
    }
    Ok(())
}

/// Patch every live block's content, edges in insertion order.
fn apply_fixups(graph: &mut LinkGraph) -> Result<()> {
    let blocks: Vec<BlockId> = graph.blocks.indices().collect();
    for block in blocks {
        if graph.blocks[block].dead {
            continue;
        }
        // Detach the working memory and edge list so the applier can read
        // the rest of the graph; reattach before propagating any failure.
        let mut content = std::mem::take(&mut graph.blocks[block].content);
        let edges = std::mem::take(&mut graph.blocks[block].edges);
        let mut result = Ok(());
        for edge in &edges {
            if let Err(err) = arm64::apply_fixup(graph, block, edge, &mut content) {
                result = Err(err);
                break;
            }
        }
        let b = &mut graph.blocks[block];
        b.content = content;
        b.edges = edges;
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::macho::arm64::{
        ARM64_RELOC_BRANCH26, ARM64_RELOC_GOT_LOAD_PAGE21, ARM64_RELOC_GOT_LOAD_PAGEOFF12,
        ARM64_RELOC_UNSIGNED, GOT_SECTION_NAME, STUBS_SECTION_NAME,
    };
    use crate::macho::testutil::ObjBuilder;
    use crate::macho::{N_EXT, N_SECT, N_UNDF};
    use std::collections::HashMap;

    struct TestContext {
        data: Vec<u8>,
        defines: HashMap<String, u64>,
        failed: Option<String>,
    }

    impl TestContext {
        fn new(data: Vec<u8>) -> TestContext {
            TestContext {
                data,
                defines: HashMap::new(),
                failed: None,
            }
        }

        fn define(mut self, name: &str, address: u64) -> TestContext {
            self.defines.insert(name.to_string(), address);
            self
        }
    }

    impl JitLinkContext for TestContext {
        fn object_data(&self) -> &[u8] {
            &self.data
        }

        fn base_address(&self) -> u64 {
            0x4000_0000
        }

        fn resolve_external(&mut self, name: &str) -> Result<u64> {
            self.defines
                .get(name)
                .copied()
                .ok_or_else(|| Error::UnresolvedSymbol(name.to_string()))
        }

        fn notify_failed(&mut self, err: Error) {
            self.failed = Some(err.to_string());
        }
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    /// An object with a text section calling an external function and
    /// loading an external's address through the GOT, plus a data pointer
    /// back at the entry symbol.
    fn call_and_got_object() -> Vec<u8> {
        let mut obj = ObjBuilder::new();
        let mut text = Vec::new();
        text.extend_from_slice(&0x94000000u32.to_le_bytes()); // bl _bar
        text.extend_from_slice(&0x90000000u32.to_le_bytes()); // adrp x0, _foo@GOTPAGE
        text.extend_from_slice(&0xf9400000u32.to_le_bytes()); // ldr x0, [x0, _foo@GOTPAGEOFF]
        text.extend_from_slice(&0xd65f03c0u32.to_le_bytes()); // ret
        let text_sect = obj.section("__TEXT", "__text", 0x0, 2, text);
        let data_sect = obj.section("__DATA", "__data", 0x10, 3, vec![0u8; 8]);

        obj.symbol("_main", N_SECT | N_EXT, 1, 0x0); // index 0
        obj.symbol("_foo", N_UNDF | N_EXT, 0, 0); // index 1
        obj.symbol("_bar", N_UNDF | N_EXT, 0, 0); // index 2

        obj.reloc(text_sect, 0, 2, true, 2, true, ARM64_RELOC_BRANCH26);
        obj.reloc(text_sect, 4, 1, true, 2, true, ARM64_RELOC_GOT_LOAD_PAGE21);
        obj.reloc(text_sect, 8, 1, false, 2, true, ARM64_RELOC_GOT_LOAD_PAGEOFF12);
        obj.reloc(data_sect, 0, 0, false, 3, true, ARM64_RELOC_UNSIGNED);
        obj.build()
    }

    #[test]
    fn links_calls_and_got_loads_end_to_end() {
        let ctx = TestContext::new(call_and_got_object())
            .define("_foo", 0x6000_0000)
            .define("_bar", 0x5000_0000);
        let graph = jit_link_macho_arm64(ctx).expect("link should succeed");

        let text_section = graph.section_by_name("__TEXT,__text").unwrap();
        let text_block = graph.sections[text_section].blocks[0];
        assert_eq!(graph.blocks[text_block].address, 0x4000_0000);
        let text = &graph.blocks[text_block].content;

        let got_section = graph.section_by_name(GOT_SECTION_NAME).unwrap();
        let stubs_section = graph.section_by_name(STUBS_SECTION_NAME).unwrap();
        // Sections land on fresh pages in creation order:
        // text, data, GOT, stubs.
        let got_blocks = &graph.sections[got_section].blocks;
        assert_eq!(got_blocks.len(), 2);
        assert_eq!(graph.blocks[got_blocks[0]].address, 0x4000_2000);
        assert_eq!(graph.blocks[got_blocks[1]].address, 0x4000_2008);
        let stub_block = graph.sections[stubs_section].blocks[0];
        assert_eq!(graph.blocks[stub_block].address, 0x4000_3000);

        // bl _bar goes through the stub: +0x3000 from the branch site.
        assert_eq!(u32_at(text, 0), 0x94000c00);
        // adrp x0 reaches the GOT page two pages up.
        assert_eq!(u32_at(text, 4), 0xd0000000);
        // ldr x0 uses _foo's slot offset within the page (second entry).
        assert_eq!(u32_at(text, 8), 0xf9402000);
        // ret is untouched.
        assert_eq!(u32_at(text, 12), 0xd65f03c0);

        // The stub's LDR reaches back one page to _bar's GOT entry, and
        // the BR is untouched.
        let stub = &graph.blocks[stub_block].content;
        assert_eq!(u32_at(stub, 0), 0x58ff8010);
        assert_eq!(u32_at(stub, 4), 0xd61f0200);

        // GOT entries hold the resolved addresses (creation order: the
        // stub's _bar entry first, then _foo).
        assert_eq!(
            graph.blocks[got_blocks[0]].content,
            0x5000_0000u64.to_le_bytes().to_vec()
        );
        assert_eq!(
            graph.blocks[got_blocks[1]].content,
            0x6000_0000u64.to_le_bytes().to_vec()
        );

        // The data pointer was fixed to _main's final address.
        let data_section = graph.section_by_name("__DATA,__data").unwrap();
        let data_block = graph.sections[data_section].blocks[0];
        assert_eq!(graph.blocks[data_block].address, 0x4000_1000);
        assert_eq!(
            graph.blocks[data_block].content,
            0x4000_0000u64.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn unresolved_externals_surface_through_notify_failed() {
        let mut ctx = TestContext::new(call_and_got_object()).define("_foo", 0x6000_0000);
        let result = run_link(&mut ctx);
        assert!(matches!(result, Err(Error::UnresolvedSymbol(_))));

        let ctx = TestContext::new(call_and_got_object()).define("_foo", 0x6000_0000);
        assert!(jit_link_macho_arm64(ctx).is_none());
    }

    #[test]
    fn malformed_objects_fail_the_link() {
        let ctx = TestContext::new(vec![0u8; 16]);
        assert!(jit_link_macho_arm64(ctx).is_none());
    }

    #[test]
    fn mark_all_symbols_live_makes_prune_a_noop() {
        let bytes = call_and_got_object();
        let obj = MachOObject::parse(&bytes).unwrap();
        let builder = GraphBuilder::build_from_object(&obj).unwrap();
        let mut graph = builder.into_graph();

        mark_all_symbols_live(&mut graph).unwrap();
        prune(&mut graph);
        assert!(graph.blocks.iter().all(|b| !b.dead));
    }

    #[test]
    fn prune_hides_blocks_unreachable_from_live_symbols() {
        let mut graph = LinkGraph::new();
        let section = graph.create_section("__TEXT,__text", libc::PROT_READ | libc::PROT_EXEC);
        let live_block = graph.create_content_block(section, vec![0; 4], 0x0, 4);
        let callee_block = graph.create_content_block(section, vec![0; 4], 0x4, 4);
        let dead_block = graph.create_content_block(section, vec![0; 4], 0x8, 4);

        let root = graph.add_anonymous_symbol(live_block, 0, 4, true);
        let callee = graph.add_anonymous_symbol(callee_block, 0, 4, false);
        graph.add_anonymous_symbol(dead_block, 0, 4, false);
        graph.add_edge(
            live_block,
            crate::graph::Edge {
                kind: EdgeKind::Branch26,
                offset: 0,
                target: callee,
                addend: 0,
            },
        );

        prune(&mut graph);
        assert!(!graph.blocks[live_block].dead);
        assert!(!graph.blocks[callee_block].dead);
        assert!(graph.blocks[dead_block].dead);
        let _ = root;
    }

    #[test]
    fn layout_pages_sections_and_aligns_blocks() {
        let mut graph = LinkGraph::new();
        let text = graph.create_section("__TEXT,__text", libc::PROT_READ | libc::PROT_EXEC);
        let data = graph.create_section("__DATA,__data", libc::PROT_READ | libc::PROT_WRITE);
        let a = graph.create_content_block(text, vec![0; 6], 0, 4);
        let b = graph.create_content_block(text, vec![0; 8], 0, 16);
        let c = graph.create_content_block(data, vec![0; 8], 0, 8);

        layout(&mut graph, 0x1000_0000);
        assert_eq!(graph.blocks[a].address, 0x1000_0000);
        // 6 bytes in, rounded up to the next 16-byte boundary.
        assert_eq!(graph.blocks[b].address, 0x1000_0010);
        // The next section starts on a fresh page.
        assert_eq!(graph.blocks[c].address, 0x1000_1000);
    }

    #[test]
    fn align_up_is_exact_on_boundaries() {
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 1), 1);
    }
}
