//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files. Commands that
//! end up in persisted image headers also derive serde.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

// =============================================================================
// Header
// =============================================================================

/// 64-bit Mach-O header.
///
/// 32-bit headers are promoted to this form during parsing; `reserved`
/// stays zero for them.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Total size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (64-bit only)
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the 64-bit header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true for a 64-bit cputype.
    #[inline]
    pub fn is_64bit(&self) -> bool {
        (self.cputype & CPU_ARCH_ABI_MASK) == CPU_ARCH_ABI64
    }
}

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Command type
    pub cmd: u32,
    /// Command size including payload
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the bare command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segments and Sections
// =============================================================================

/// 64-bit segment command. 32-bit segments are widened into this form.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Command size
    pub cmdsize: u32,
    /// Segment name, NUL-padded
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Bytes mapped from the file
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command without trailing sections.
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        let end = self.segname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.segname[..end]).unwrap_or("")
    }

    /// Sets the segment name from a string, truncating to 16 bytes.
    pub fn set_name(&mut self, name: &str) {
        self.segname = [0u8; 16];
        let bytes = name.as_bytes();
        let len = bytes.len().min(16);
        self.segname[..len].copy_from_slice(&bytes[..len]);
    }

    /// Returns true if this is the `__LINKEDIT` segment.
    #[inline]
    pub fn is_linkedit(&self) -> bool {
        &self.segname[..11] == b"__LINKEDIT\0"
    }

    /// Returns true if the segment covers the given address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr < self.vmaddr + self.vmsize
    }
}

/// 64-bit section. 32-bit sections are widened into this form.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Serialize,
    Deserialize,
)]
#[repr(C)]
pub struct Section64 {
    /// Section name, NUL-padded
    pub sectname: [u8; 16],
    /// Owning segment name, NUL-padded
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment as a power of two
    pub align: u32,
    /// Relocation table offset
    pub reloff: u32,
    /// Number of relocations
    pub nreloc: u32,
    /// Type and attribute flags
    pub flags: u32,
    /// Reserved
    pub reserved1: u32,
    /// Reserved
    pub reserved2: u32,
    /// Reserved (64-bit only)
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a 64-bit section entry.
    pub const SIZE: usize = 80;

    /// Returns the section name as a string.
    pub fn name(&self) -> &str {
        let end = self.sectname.iter().position(|&b| b == 0).unwrap_or(16);
        std::str::from_utf8(&self.sectname[..end]).unwrap_or("")
    }

    /// Returns true if the section covers the given address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.size
    }

    /// Returns true when the section is marked as holding instructions.
    #[inline]
    pub fn has_instruction_attr(&self) -> bool {
        self.flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0
    }
}

// =============================================================================
// Link-Edit Commands
// =============================================================================

/// Symbol table command.
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct SymtabCommand {
    /// File offset of the nlist array
    pub symoff: u32,
    /// Number of symbols
    pub nsyms: u32,
    /// File offset of the string table
    pub stroff: u32,
    /// Size of the string table
    pub strsize: u32,
}

/// Dynamic symbol table command.
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct DysymtabCommand {
    /// Index of the first local symbol
    pub ilocalsym: u32,
    /// Number of local symbols
    pub nlocalsym: u32,
    /// Index of the first externally defined symbol
    pub iextdefsym: u32,
    /// Number of externally defined symbols
    pub nextdefsym: u32,
    /// Index of the first undefined symbol
    pub iundefsym: u32,
    /// Number of undefined symbols
    pub nundefsym: u32,
    /// Table of contents offset
    pub tocoff: u32,
    /// Number of TOC entries
    pub ntoc: u32,
    /// Module table offset
    pub modtaboff: u32,
    /// Number of module table entries
    pub nmodtab: u32,
    /// External reference table offset
    pub extrefsymoff: u32,
    /// Number of external reference entries
    pub nextrefsyms: u32,
    /// Indirect symbol table offset
    pub indirectsymoff: u32,
    /// Number of indirect symbols
    pub nindirectsyms: u32,
    /// External relocation offset
    pub extreloff: u32,
    /// Number of external relocations
    pub nextrel: u32,
    /// Local relocation offset
    pub locreloff: u32,
    /// Number of local relocations
    pub nlocrel: u32,
}

/// Compressed dyld info command payload.
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// Rebase info offset
    pub rebase_off: u32,
    /// Rebase info size
    pub rebase_size: u32,
    /// Bind info offset
    pub bind_off: u32,
    /// Bind info size
    pub bind_size: u32,
    /// Weak bind info offset
    pub weak_bind_off: u32,
    /// Weak bind info size
    pub weak_bind_size: u32,
    /// Lazy bind info offset
    pub lazy_bind_off: u32,
    /// Lazy bind info size
    pub lazy_bind_size: u32,
    /// Export trie offset
    pub export_off: u32,
    /// Export trie size
    pub export_size: u32,
}

/// Generic link-edit data command payload (offset and size).
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// File offset of the data
    pub dataoff: u32,
    /// Size of the data
    pub datasize: u32,
}

/// 64-bit routines command payload.
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct Routines64Command {
    /// Initialization function address
    pub init_address: u64,
    /// Module index of the init function
    pub init_module: u64,
    /// Reserved
    pub reserved1: u64,
    /// Reserved
    pub reserved2: u64,
    /// Reserved
    pub reserved3: u64,
    /// Reserved
    pub reserved4: u64,
    /// Reserved
    pub reserved5: u64,
    /// Reserved
    pub reserved6: u64,
}

/// Build version command payload (without trailing tool entries).
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct BuildVersionCommand {
    /// Target platform
    pub platform: u32,
    /// Minimum OS version (x.y.z encoded)
    pub minos: u32,
    /// SDK version
    pub sdk: u32,
    /// Number of trailing tool entries
    pub ntools: u32,
}

/// One build tool version entry.
#[derive(
    Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable, Serialize, Deserialize,
)]
#[repr(C)]
pub struct BuildToolVersion {
    /// Tool identifier
    pub tool: u32,
    /// Tool version
    pub version: u32,
}

// =============================================================================
// Symbol Table Entries
// =============================================================================

/// 64-bit nlist entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// String table index
    pub n_strx: u32,
    /// Type flags
    pub n_type: u8,
    /// Section number
    pub n_sect: u8,
    /// Description field
    pub n_desc: u16,
    /// Symbol value
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an nlist_64 entry.
    pub const SIZE: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(size_of::<MachHeader64>(), MachHeader64::SIZE);
        assert_eq!(size_of::<SegmentCommand64>() , SegmentCommand64::SIZE);
        assert_eq!(size_of::<Section64>(), Section64::SIZE);
        assert_eq!(size_of::<Nlist64>(), Nlist64::SIZE);
        assert_eq!(size_of::<SymtabCommand>(), 16);
        assert_eq!(size_of::<DysymtabCommand>(), 72);
        assert_eq!(size_of::<DyldInfoCommand>(), 40);
        assert_eq!(size_of::<LinkeditDataCommand>(), 8);
        assert_eq!(size_of::<Routines64Command>(), 64);
    }

    #[test]
    fn test_segment_names() {
        let mut seg = SegmentCommand64::default();
        seg.set_name("__LINKEDIT");
        assert_eq!(seg.name(), "__LINKEDIT");
        assert!(seg.is_linkedit());

        seg.set_name("__TEXT");
        assert!(!seg.is_linkedit());
    }

    #[test]
    fn test_section_attrs() {
        let mut sect = Section64::default();
        assert!(!sect.has_instruction_attr());
        sect.flags = S_ATTR_SOME_INSTRUCTIONS;
        assert!(sect.has_instruction_attr());
        sect.flags = S_ATTR_PURE_INSTRUCTIONS;
        assert!(sect.has_instruction_attr());
    }
}
