//! Host consumer interface.
//!
//! The loader does not own a binary analysis engine. Everything it produces
//! (segments, sections, symbols, raw bytes, persisted metadata) is streamed
//! to a [`HostView`] implementation provided by the embedding host. A
//! complete in-memory implementation, [`CapturingHost`], is provided for
//! tests and for the command line tool.

use std::collections::BTreeMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Protection flags for a loaded memory region.
    ///
    /// The deny bits record that neither the initial nor the maximum Mach-O
    /// protections allow the access, which hosts use to pin analysis
    /// decisions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegionFlags: u64 {
        /// Region is readable
        const READABLE = 1 << 0;
        /// Region is writable
        const WRITABLE = 1 << 1;
        /// Region is executable
        const EXECUTABLE = 1 << 2;
        /// Writes can never be enabled for this region
        const DENY_WRITE = 1 << 3;
        /// Execution can never be enabled for this region
        const DENY_EXECUTE = 1 << 4;
    }
}

/// The kind of a synthesized symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Callable code
    Function,
    /// Data
    Data,
    /// Defined in another image
    External,
}

impl From<SymbolKind> for u8 {
    fn from(kind: SymbolKind) -> u8 {
        match kind {
            SymbolKind::Function => 0,
            SymbolKind::Data => 1,
            SymbolKind::External => 2,
        }
    }
}

impl TryFrom<u8> for SymbolKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            0 => Ok(SymbolKind::Function),
            1 => Ok(SymbolKind::Data),
            2 => Ok(SymbolKind::External),
            other => Err(other),
        }
    }
}

/// A symbol synthesized from the symbol table or the export trie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Symbol kind (persisted as an integer)
    #[serde(with = "crate::serialize::symbol_kind_as_u8")]
    pub kind: SymbolKind,
    /// Raw symbol name
    pub name: String,
    /// Absolute address in the cache address space
    pub address: u64,
}

impl Symbol {
    /// Creates a new symbol.
    pub fn new(kind: SymbolKind, name: impl Into<String>, address: u64) -> Self {
        Self {
            kind,
            name: name.into(),
            address,
        }
    }
}

/// Section semantics hints passed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionSemantics {
    /// No particular semantics
    Default,
    /// Read-only code
    ReadOnlyCode,
    /// Read-only data
    ReadOnlyData,
    /// Read-write data
    ReadWriteData,
}

/// Progress sentinels for the initial load, queryable per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadProgress {
    /// Nothing has happened yet
    NotStarted = 0,
    /// Enumerating backing caches
    LoadingCaches = 1,
    /// Parsing image headers
    LoadingImages = 2,
    /// Initial load complete
    Finished = 3,
}

impl From<u8> for LoadProgress {
    fn from(value: u8) -> Self {
        match value {
            1 => LoadProgress::LoadingCaches,
            2 => LoadProgress::LoadingImages,
            3 => LoadProgress::Finished,
            _ => LoadProgress::NotStarted,
        }
    }
}

// =============================================================================
// Load Settings
// =============================================================================

/// Loader options, mirroring the host's dotted setting keys.
#[derive(Debug, Clone)]
pub struct LoadSettings {
    /// `loader.dsc.autoLoadLibSystem`: load libsystem_c.dylib at the end of
    /// the initial load.
    pub auto_load_lib_system: bool,
    /// `loader.dsc.allowLoadingLinkeditSegments`: include `__LINKEDIT`
    /// regions when loading an image.
    pub allow_loading_linkedit: bool,
    /// `loader.dsc.processCFStrings`: run CFString post-processing.
    pub process_cf_strings: bool,
    /// `loader.dsc.processObjC`: run Objective-C metadata post-processing.
    pub process_objc: bool,
    /// `loader.dsc.processFunctionStarts`: register functions from
    /// `LC_FUNCTION_STARTS`.
    pub process_function_starts: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            auto_load_lib_system: true,
            allow_loading_linkedit: false,
            process_cf_strings: true,
            process_objc: true,
            process_function_starts: true,
        }
    }
}

impl LoadSettings {
    /// Applies `key=value` pairs using the dotted host setting names.
    ///
    /// Unknown keys are ignored so hosts can pass their full settings bag.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let mut settings = Self::default();
        for (key, value) in pairs {
            match key {
                "loader.dsc.autoLoadLibSystem" => settings.auto_load_lib_system = value,
                "loader.dsc.allowLoadingLinkeditSegments" => {
                    settings.allow_loading_linkedit = value
                }
                "loader.dsc.processCFStrings" => settings.process_cf_strings = value,
                "loader.dsc.processObjC" => settings.process_objc = value,
                "loader.dsc.processFunctionStarts" => settings.process_function_starts = value,
                _ => {}
            }
        }
        settings
    }
}

// =============================================================================
// Host View Trait
// =============================================================================

/// The consumer interface the loader drives.
///
/// A host is expected to model a virtual view (addressed by cache VA) on top
/// of a raw parent view that grows as region bytes are appended to it.
/// Metadata stored through [`HostView::store_metadata`] must be replicated to
/// the view's two parent views so a re-open of any of them can recover the
/// loader state.
pub trait HostView {
    /// Stable identifier of the host session, used to key the file pool and
    /// the per-view state registry.
    fn session_id(&self) -> u64;

    /// Current end offset of the parent raw view.
    fn raw_view_end(&self) -> u64;

    /// Appends bytes to the parent raw view, returning the offset at which
    /// they were placed.
    fn append_raw(&mut self, data: &[u8]) -> u64;

    /// Writes bytes at a virtual address of the view.
    fn write_virtual(&mut self, addr: u64, data: &[u8]);

    /// Reads bytes from a virtual address of the view, if mapped.
    fn read_virtual(&self, addr: u64, len: usize) -> Option<Vec<u8>>;

    /// Returns true when `addr` is a mapped virtual offset.
    fn is_valid_offset(&self, addr: u64) -> bool;

    /// Adds an analysis-created segment to the raw parent view.
    fn add_auto_segment(&mut self, start: u64, size: u64, raw_offset: u64, raw_size: u64, flags: RegionFlags);

    /// Adds a user segment mapping cache VAs onto the raw view.
    fn add_user_segment(&mut self, start: u64, size: u64, raw_offset: u64, raw_size: u64, flags: RegionFlags);

    /// Adds a named user section.
    fn add_user_section(
        &mut self,
        name: &str,
        start: u64,
        size: u64,
        semantics: SectionSemantics,
        section_type: &str,
        align: u64,
    );

    /// Defines an analysis-created symbol.
    fn define_auto_symbol(&mut self, symbol: &Symbol);

    /// Defines a user symbol.
    fn define_user_symbol(&mut self, symbol: &Symbol);

    /// Defines a typed data variable by named type.
    fn define_data_variable(&mut self, addr: u64, type_name: &str);

    /// Queues a function for analysis at `addr`.
    fn add_function_for_analysis(&mut self, addr: u64);

    /// Returns true when analysis knows a function at `addr`.
    fn has_function_at(&self, addr: u64) -> bool;

    /// Returns the symbol defined at `addr`, if any.
    fn symbol_at(&self, addr: u64) -> Option<Symbol>;

    /// Brackets a batch of symbol definitions.
    fn begin_bulk_modify_symbols(&mut self) {}
    /// See [`HostView::begin_bulk_modify_symbols`].
    fn end_bulk_modify_symbols(&mut self) {}

    /// Opens an undo grouping, returning an identifier.
    fn begin_undo_actions(&mut self) -> u64 {
        0
    }
    /// Commits an undo grouping.
    fn commit_undo_actions(&mut self, _id: u64) {}
    /// Discards an undo grouping without rollback.
    fn forget_undo_actions(&mut self, _id: u64) {}

    /// Stores a metadata string on the view and its two parent views.
    fn store_metadata(&mut self, key: &str, value: &str);

    /// Queries a previously stored metadata string.
    fn query_metadata(&self, key: &str) -> Option<String>;

    /// Imports a type for `symbol` from the type library belonging to
    /// `install_name` and applies it at `addr`. Returns false when no type
    /// library or no matching object exists.
    fn import_type_object(&mut self, _install_name: &str, _symbol: &str, _addr: u64) -> bool {
        false
    }

    /// Invokes the Objective-C metadata post-processor for an image.
    fn process_objc_image(&mut self, _install_name: &str, _process_metadata: bool, _process_cf_strings: bool) {}

    /// Enables a named analysis option.
    fn add_analysis_option(&mut self, _name: &str) {}

    /// Kicks analysis after new segments were added.
    fn update_analysis(&mut self) {}
}

// =============================================================================
// Capturing Host
// =============================================================================

/// A segment recorded by [`CapturingHost`].
#[derive(Debug, Clone)]
pub struct CapturedSegment {
    /// Virtual start address
    pub start: u64,
    /// Length in bytes
    pub size: u64,
    /// Offset into the raw view
    pub raw_offset: u64,
    /// Protection flags
    pub flags: RegionFlags,
    /// True for user segments, false for auto segments
    pub user: bool,
}

/// A section recorded by [`CapturingHost`].
#[derive(Debug, Clone)]
pub struct CapturedSection {
    /// Section name (`prefix::sectname`)
    pub name: String,
    /// Virtual start address
    pub start: u64,
    /// Length in bytes
    pub size: u64,
    /// Semantics hint
    pub semantics: SectionSemantics,
    /// Type string
    pub section_type: String,
}

/// An in-memory [`HostView`].
///
/// Captures everything the controller streams out so tests and the CLI can
/// inspect it. Virtual writes land in a sparse byte map; metadata lives in a
/// plain string map shared with the notional parent views.
#[derive(Default)]
pub struct CapturingHost {
    session: u64,
    raw: Vec<u8>,
    virtual_bytes: BTreeMap<u64, Vec<u8>>,
    /// Segments in creation order.
    pub segments: Vec<CapturedSegment>,
    /// Sections in creation order.
    pub sections: Vec<CapturedSection>,
    /// Auto symbols keyed by address.
    pub auto_symbols: BTreeMap<u64, Symbol>,
    /// User symbols keyed by address.
    pub user_symbols: BTreeMap<u64, Symbol>,
    /// Typed data variables.
    pub data_variables: BTreeMap<u64, String>,
    /// Addresses queued for function analysis.
    pub functions: Vec<u64>,
    /// Metadata mirrored across the view hierarchy.
    pub metadata: BTreeMap<String, String>,
    /// Install names handed to the ObjC post-processor.
    pub objc_processed: Vec<String>,
    next_undo_id: u64,
}

impl CapturingHost {
    /// Creates a host with the given session identifier.
    pub fn new(session: u64) -> Self {
        Self {
            session,
            ..Default::default()
        }
    }

    /// Returns the bytes of the raw parent view.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the segment covering `addr`, if any.
    pub fn segment_at(&self, addr: u64) -> Option<&CapturedSegment> {
        self.segments
            .iter()
            .find(|s| s.start <= addr && addr < s.start + s.size)
    }
}

impl HostView for CapturingHost {
    fn session_id(&self) -> u64 {
        self.session
    }

    fn raw_view_end(&self) -> u64 {
        self.raw.len() as u64
    }

    fn append_raw(&mut self, data: &[u8]) -> u64 {
        let offset = self.raw.len() as u64;
        self.raw.extend_from_slice(data);
        offset
    }

    fn write_virtual(&mut self, addr: u64, data: &[u8]) {
        self.virtual_bytes.insert(addr, data.to_vec());
    }

    fn read_virtual(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        // Find the chunk containing addr.
        let (&start, bytes) = self.virtual_bytes.range(..=addr).next_back()?;
        let offset = (addr - start) as usize;
        if offset + len > bytes.len() {
            return None;
        }
        Some(bytes[offset..offset + len].to_vec())
    }

    fn is_valid_offset(&self, addr: u64) -> bool {
        self.read_virtual(addr, 1).is_some()
    }

    fn add_auto_segment(&mut self, start: u64, size: u64, raw_offset: u64, _raw_size: u64, flags: RegionFlags) {
        self.segments.push(CapturedSegment {
            start,
            size,
            raw_offset,
            flags,
            user: false,
        });
    }

    fn add_user_segment(&mut self, start: u64, size: u64, raw_offset: u64, _raw_size: u64, flags: RegionFlags) {
        self.segments.push(CapturedSegment {
            start,
            size,
            raw_offset,
            flags,
            user: true,
        });
    }

    fn add_user_section(
        &mut self,
        name: &str,
        start: u64,
        size: u64,
        semantics: SectionSemantics,
        section_type: &str,
        _align: u64,
    ) {
        self.sections.push(CapturedSection {
            name: name.to_string(),
            start,
            size,
            semantics,
            section_type: section_type.to_string(),
        });
    }

    fn define_auto_symbol(&mut self, symbol: &Symbol) {
        self.auto_symbols.insert(symbol.address, symbol.clone());
    }

    fn define_user_symbol(&mut self, symbol: &Symbol) {
        self.user_symbols.insert(symbol.address, symbol.clone());
    }

    fn define_data_variable(&mut self, addr: u64, type_name: &str) {
        self.data_variables.insert(addr, type_name.to_string());
    }

    fn add_function_for_analysis(&mut self, addr: u64) {
        self.functions.push(addr);
    }

    fn has_function_at(&self, addr: u64) -> bool {
        self.functions.contains(&addr)
    }

    fn symbol_at(&self, addr: u64) -> Option<Symbol> {
        self.user_symbols
            .get(&addr)
            .or_else(|| self.auto_symbols.get(&addr))
            .cloned()
    }

    fn begin_undo_actions(&mut self) -> u64 {
        self.next_undo_id += 1;
        self.next_undo_id
    }

    fn store_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    fn query_metadata(&self, key: &str) -> Option<String> {
        self.metadata.get(key).cloned()
    }

    fn process_objc_image(&mut self, install_name: &str, process_metadata: bool, process_cf_strings: bool) {
        if process_metadata || process_cf_strings {
            self.objc_processed.push(install_name.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_flags_bits() {
        let rx = RegionFlags::READABLE | RegionFlags::EXECUTABLE;
        assert_eq!(rx.bits(), 0b101);
        assert_eq!(RegionFlags::from_bits_truncate(0b101), rx);
    }

    #[test]
    fn test_settings_from_pairs() {
        let settings = LoadSettings::from_pairs([
            ("loader.dsc.autoLoadLibSystem", false),
            ("loader.dsc.processObjC", false),
            ("some.other.setting", true),
        ]);
        assert!(!settings.auto_load_lib_system);
        assert!(!settings.process_objc);
        assert!(settings.process_cf_strings);
        assert!(settings.process_function_starts);
    }

    #[test]
    fn test_capturing_host_virtual_reads() {
        let mut host = CapturingHost::new(1);
        host.write_virtual(0x1000, &[1, 2, 3, 4]);
        assert_eq!(host.read_virtual(0x1001, 2), Some(vec![2, 3]));
        assert!(host.is_valid_offset(0x1003));
        assert!(!host.is_valid_offset(0x1004));
        assert!(!host.is_valid_offset(0xFFF));
    }

    #[test]
    fn test_capturing_host_raw_append() {
        let mut host = CapturingHost::new(1);
        assert_eq!(host.append_raw(&[0; 16]), 0);
        assert_eq!(host.append_raw(&[1; 4]), 16);
        assert_eq!(host.raw_view_end(), 20);
    }
}
