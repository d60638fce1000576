use std::collections::HashMap;
use std::{env, process::exit};
use tracing::error;
use tracing_subscriber::EnvFilter;

use stitch::graph::{LinkGraph, Place};
use stitch::{jit_link_macho_arm64, Error, JitLinkContext, MappedFile, Result};

// Default base address for the linked image, clear of typical host mappings.
const DEFAULT_BASE_ADDRESS: u64 = 0x0000000200000000;

struct Opts {
    /// Base address for the linked image.
    base_addr: u64,

    /// Whether to hex-dump the linked block contents.
    dump: bool,

    /// External symbol definitions (name -> address).
    defines: HashMap<String, u64>,

    /// The object file to link.
    object: String,
}

struct CliContext<'a> {
    data: &'a [u8],
    base_addr: u64,
    defines: HashMap<String, u64>,
}

impl JitLinkContext for CliContext<'_> {
    fn object_data(&self) -> &[u8] {
        self.data
    }

    fn base_address(&self) -> u64 {
        self.base_addr
    }

    fn resolve_external(&mut self, name: &str) -> Result<u64> {
        self.defines.get(name).copied().ok_or_else(|| {
            Error::UnresolvedSymbol(format!("{} (supply it with --define {}=ADDR)", name, name))
        })
    }

    fn notify_failed(&mut self, err: Error) {
        error!("link failed: {}", err);
        eprintln!("stitch: {}", err);
    }
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: stitch [--base-addr HEX] [--define NAME=HEX]... [--dump] <object.o>");
        exit(1);
    }
    let opts = parse_opts(&args);

    let file = match MappedFile::open(&opts.object) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("stitch: cannot open {}: {}", opts.object, err);
            exit(1);
        }
    };

    let ctx = CliContext {
        data: file.data,
        base_addr: opts.base_addr,
        defines: opts.defines,
    };
    let Some(graph) = jit_link_macho_arm64(ctx) else {
        exit(1);
    };

    print_layout(&graph);
    if opts.dump {
        dump_blocks(&graph);
    }
}

fn parse_opts(args: &[String]) -> Opts {
    let mut base_addr = DEFAULT_BASE_ADDRESS;
    let mut dump = false;
    let mut defines = HashMap::new();
    let mut object = String::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        if args[i] == "--dump" {
            dump = true;
            i += 1;
        } else if args[i] == "--base-addr" {
            if i + 1 < args.len() {
                base_addr = parse_addr(&args[i + 1]);
                i += 2;
            } else {
                eprintln!("error: --base-addr requires a value");
                exit(1);
            }
        } else if args[i] == "--define" {
            if i + 1 < args.len() {
                match args[i + 1].split_once('=') {
                    Some((name, addr)) => {
                        defines.insert(name.to_string(), parse_addr(addr));
                    }
                    None => {
                        eprintln!("error: --define expects NAME=ADDR");
                        exit(1);
                    }
                }
                i += 2;
            } else {
                eprintln!("error: --define requires a value");
                exit(1);
            }
        } else if object.is_empty() {
            object = args[i].clone();
            i += 1;
        } else {
            eprintln!("error: unexpected argument {}", args[i]);
            exit(1);
        }
    }
    if object.is_empty() {
        eprintln!("error: no object file given");
        exit(1);
    }
    Opts {
        base_addr,
        dump,
        defines,
        object,
    }
}

fn parse_addr(s: &str) -> u64 {
    let digits = s.trim_start_matches("0x");
    match u64::from_str_radix(digits, 16) {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("error: invalid address {}", s);
            exit(1);
        }
    }
}

fn print_layout(graph: &LinkGraph) {
    println!("sections:");
    for section in graph.sections.iter() {
        let mut start = u64::MAX;
        let mut end = 0u64;
        for &block in &section.blocks {
            let block = &graph.blocks[block];
            if block.dead {
                continue;
            }
            start = start.min(block.address);
            end = end.max(block.end_address());
        }
        if start > end {
            continue;
        }
        println!(
            "  {:<20} {} {:#018x}..{:#018x}",
            section.name,
            prot_str(section.prot),
            start,
            end
        );
    }

    println!("symbols:");
    for (id, sym) in graph.symbols.iter_enumerated() {
        let Some(name) = &sym.name else { continue };
        let kind = match sym.place {
            Place::Defined { .. } => "defined",
            Place::External { .. } => "external",
            Place::Absolute { .. } => "absolute",
        };
        println!(
            "  {:<24} {:<8} {:#018x}",
            name,
            kind,
            graph.symbol_address(id)
        );
    }
}

fn dump_blocks(graph: &LinkGraph) {
    for section in graph.sections.iter() {
        for &block in &section.blocks {
            let block = &graph.blocks[block];
            if block.dead {
                continue;
            }
            println!("{} at {:#x}:", section.name, block.address);
            for (i, chunk) in block.content.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                println!("  {:#010x}: {}", block.address + (i * 16) as u64, hex.join(" "));
            }
        }
    }
}

fn prot_str(prot: libc::c_int) -> String {
    format!(
        "{}{}{}",
        if prot & libc::PROT_READ != 0 { 'r' } else { '-' },
        if prot & libc::PROT_WRITE != 0 { 'w' } else { '-' },
        if prot & libc::PROT_EXEC != 0 { 'x' } else { '-' }
    )
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
