//! Stitch - a just-in-time linker for Mach-O/arm64 object files.
//!
//! Stitch takes a relocatable Mach-O object in memory, parses its relocation
//! records into a link graph of blocks and symbols connected by typed edges,
//! synthesizes Global Offset Table entries and branch stubs for external
//! references, and patches instruction and data bytes so the code is valid at
//! its assigned runtime addresses.
//!
//! # Modules
//!
//! - [`graph`] - The link graph: sections, blocks, symbols, and edges
//! - [`macho`] - Mach-O object reading, graph building, and the arm64 backend
//! - [`link`] - Pass configuration and the link driver
//! - [`mmap`] - Memory-mapped file handling for the CLI
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type. Every failure is
//! terminal to the link in flight: there is no local recovery, and the
//! offending record's address and kind are carried in the message.

pub mod graph;
pub mod link;
pub mod macho;
pub mod mmap;

/// Consolidated error type for all Stitch operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object format error: {0}")]
    ObjectFormat(String),

    #[error("bad relocation: {0}")]
    BadRelocation(String),

    #[error("missing symbol: {0}")]
    MissingSymbol(String),

    #[error("bad instruction: {0}")]
    BadInstr(String),

    #[error("relocation extends past end of fixup block: {0}")]
    ExtentOverflow(String),

    #[error("relocation target out of range: {0}")]
    OutOfRange(String),

    #[error("misaligned relocation target: {0}")]
    Misalignment(String),

    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use graph::LinkGraph;
pub use link::{jit_link_macho_arm64, JitLinkContext, PassConfiguration};
pub use mmap::MappedFile;
