//! Mach-O load command parsing inside the cache VM.
//!
//! Cache images are pre-linked: their bytes live scattered across backing
//! cache mappings, so the parser reads through the [`Vm`] rather than a
//! contiguous buffer. 32-bit images are promoted to the 64-bit form during
//! parsing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::base_name;
use crate::vm::{Endianness, Vm, VmReader};

/// A parsed image header: everything the controller needs to materialize an
/// image, persisted as part of the view metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageHeader {
    /// Address of the Mach-O header inside the cache
    pub text_base: u64,
    /// Address of the first load command
    pub load_command_offset: u64,
    /// The (possibly promoted) Mach-O header
    pub ident: MachHeader64,
    /// Basename of the install name, prefixed onto section names
    pub identifier_prefix: String,
    /// Install name (unique image key)
    pub install_name: String,

    /// Entry point addresses discovered in load commands
    pub entry_points: Vec<u64>,

    /// Symbol table location
    pub symtab: SymtabCommand,
    /// Dynamic symbol table location
    pub dysymtab: DysymtabCommand,
    /// Compressed dyld info locations
    pub dyld_info: DyldInfoCommand,
    /// Routines command; parsed but not persisted
    #[serde(skip)]
    pub routines64: Routines64Command,
    /// Function starts table location
    pub function_starts: LinkeditDataCommand,
    /// `__mod_init_func` sections
    pub module_init_sections: Vec<Section64>,
    /// Export trie location
    pub export_trie: LinkeditDataCommand,
    /// Chained fixups location
    pub chained_fixups: LinkeditDataCommand,

    /// Base address relocations are relative to
    pub relocation_base: u64,
    /// Segments, in command order
    pub segments: Vec<SegmentCommand64>,
    /// The `__LINKEDIT` segment when present
    pub linkedit_segment: SegmentCommand64,
    /// Sections of all VM-mapped segments
    pub sections: Vec<Section64>,
    /// Section names, `identifierPrefix::<sectname>`
    pub section_names: Vec<String>,

    /// Self-modifying stub sections
    pub symbol_stub_sections: Vec<Section64>,
    /// Lazy and non-lazy symbol pointer sections
    pub symbol_pointer_sections: Vec<Section64>,

    /// Dependent dylib install names
    pub dylibs: Vec<String>,

    /// Build version command
    pub build_version: BuildVersionCommand,
    /// Build tool entries
    pub build_tool_versions: Vec<BuildToolVersion>,

    /// Image UUID
    pub uuid: [u8; 16],

    /// Path of the backing cache containing `__LINKEDIT`
    pub export_trie_path: String,

    /// Presence flags for the optional commands above
    pub linkedit_present: bool,
    /// See [`ImageHeader::linkedit_present`]
    pub dysym_present: bool,
    /// See [`ImageHeader::linkedit_present`]
    pub dyld_info_present: bool,
    /// See [`ImageHeader::linkedit_present`]
    pub export_trie_present: bool,
    /// See [`ImageHeader::linkedit_present`]
    pub chained_fixups_present: bool,
    /// Routines presence; not persisted alongside its command
    #[serde(skip)]
    pub routines_present: bool,
    /// See [`ImageHeader::linkedit_present`]
    pub function_starts_present: bool,
}

impl ImageHeader {
    /// Returns the segment containing `addr`, if any.
    pub fn segment_containing(&self, addr: u64) -> Option<&SegmentCommand64> {
        self.segments.iter().find(|seg| seg.contains_addr(addr))
    }

    /// Returns the section containing `addr`, if any.
    pub fn section_containing(&self, addr: u64) -> Option<&Section64> {
        self.sections.iter().find(|sect| sect.contains_addr(addr))
    }

    /// Returns the flags of the last section whose range covers `addr`.
    ///
    /// Matches the symbol classification walk, which keeps the final hit.
    pub fn section_flags_at(&self, addr: u64) -> Option<u32> {
        let mut flags = None;
        for sect in &self.sections {
            if sect.contains_addr(addr) {
                flags = Some(sect.flags);
            }
        }
        flags
    }

    /// Serializes this header to its JSON metadata form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parses the Mach-O header and load commands at `address`.
///
/// Accepts 32- and 64-bit magic in either byte order; 32-bit structures are
/// widened. Unknown commands are skipped; a fileset entry or an undersized
/// command aborts the parse.
pub fn load_image_header(vm: &Vm, address: u64, install_name: &str) -> Result<ImageHeader> {
    let mut header = ImageHeader {
        text_base: address,
        install_name: install_name.to_string(),
        identifier_prefix: base_name(install_name).to_string(),
        ..ImageHeader::default()
    };

    let mut reader = VmReader::new(vm);
    reader.seek(address);

    header.ident.magic = reader.read_u32()?;
    match header.ident.magic {
        MH_MAGIC | MH_MAGIC_64 => reader.set_endianness(Endianness::Little),
        MH_CIGAM | MH_CIGAM_64 => reader.set_endianness(Endianness::Big),
        magic => {
            return Err(Error::UnknownMagic {
                addr: address,
                magic,
            })
        }
    }

    header.ident.cputype = reader.read_u32()?;
    header.ident.cpusubtype = reader.read_u32()?;
    header.ident.filetype = reader.read_u32()?;
    header.ident.ncmds = reader.read_u32()?;
    header.ident.sizeofcmds = reader.read_u32()?;
    header.ident.flags = reader.read_u32()?;
    if header.ident.is_64bit() {
        header.ident.reserved = reader.read_u32()?;
    }
    header.load_command_offset = reader.offset();

    let mut first_segment = true;

    for _ in 0..header.ident.ncmds {
        let cur_offset = reader.offset();
        let cmd = reader.read_u32()?;
        let cmdsize = reader.read_u32()?;
        if (cmdsize as usize) < LoadCommand::SIZE {
            return Err(Error::LoadCommandOverflow { offset: cur_offset });
        }
        let next_offset = cur_offset + cmdsize as u64;

        match cmd {
            LC_MAIN => {
                let entry_offset = reader.read_u64()?;
                let _stack_size = reader.read_u64()?;
                header.entry_points.push(address + entry_offset);
            }

            LC_SEGMENT | LC_SEGMENT_64 => {
                let mut segment = SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize,
                    ..SegmentCommand64::default()
                };
                reader.read_into(&mut segment.segname)?;
                if cmd == LC_SEGMENT {
                    segment.vmaddr = reader.read_u32()? as u64;
                    segment.vmsize = reader.read_u32()? as u64;
                    segment.fileoff = reader.read_u32()? as u64;
                    segment.filesize = reader.read_u32()? as u64;
                } else {
                    segment.vmaddr = reader.read_u64()?;
                    segment.vmsize = reader.read_u64()?;
                    segment.fileoff = reader.read_u64()?;
                    segment.filesize = reader.read_u64()?;
                }
                segment.maxprot = reader.read_u32()?;
                segment.initprot = reader.read_u32()?;
                segment.nsects = reader.read_u32()?;
                segment.flags = reader.read_u32()?;

                if segment.is_linkedit() {
                    header.linkedit_segment = segment;
                    header.linkedit_present = true;
                }

                if first_segment {
                    let split = header.ident.flags & MH_SPLIT_SEGS != 0
                        || header.ident.cputype == CPU_TYPE_X86_64;
                    if !split || segment.initprot & VM_PROT_WRITE != 0 {
                        header.relocation_base = segment.vmaddr;
                        first_segment = false;
                    }
                }

                for _ in 0..segment.nsects {
                    let mut sect = Section64::default();
                    reader.read_into(&mut sect.sectname)?;
                    reader.read_into(&mut sect.segname)?;
                    if cmd == LC_SEGMENT {
                        sect.addr = reader.read_u32()? as u64;
                        sect.size = reader.read_u32()? as u64;
                    } else {
                        sect.addr = reader.read_u64()?;
                        sect.size = reader.read_u64()?;
                    }
                    sect.offset = reader.read_u32()?;
                    sect.align = reader.read_u32()?;
                    sect.reloff = reader.read_u32()?;
                    sect.nreloc = reader.read_u32()?;
                    sect.flags = reader.read_u32()?;
                    sect.reserved1 = reader.read_u32()?;
                    sect.reserved2 = reader.read_u32()?;
                    if cmd == LC_SEGMENT_64 {
                        sect.reserved3 = reader.read_u32()?;
                    }

                    // Sections of segments that are not mapped into memory
                    // do not become view sections.
                    if segment.vmsize > 0 {
                        header.sections.push(sect);
                    }

                    if sect.sectname.starts_with(b"__mod_init_func") {
                        header.module_init_sections.push(sect);
                    }
                    if sect.flags & (S_ATTR_SELF_MODIFYING_CODE | S_SYMBOL_STUBS)
                        == (S_ATTR_SELF_MODIFYING_CODE | S_SYMBOL_STUBS)
                    {
                        header.symbol_stub_sections.push(sect);
                    }
                    match sect.flags & SECTION_TYPE_MASK {
                        S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS => {
                            header.symbol_pointer_sections.push(sect)
                        }
                        _ => {}
                    }
                }

                header.segments.push(segment);
            }

            LC_ROUTINES | LC_ROUTINES_64 => {
                header.routines64.init_address = if cmd == LC_ROUTINES {
                    reader.read_u32()? as u64
                } else {
                    reader.read_u64()?
                };
                header.routines64.init_module = if cmd == LC_ROUTINES {
                    reader.read_u32()? as u64
                } else {
                    reader.read_u64()?
                };
                header.routines_present = true;
            }

            LC_FUNCTION_STARTS => {
                header.function_starts.dataoff = reader.read_u32()?;
                header.function_starts.datasize = reader.read_u32()?;
                header.function_starts_present = true;
            }

            LC_SYMTAB => {
                header.symtab.symoff = reader.read_u32()?;
                header.symtab.nsyms = reader.read_u32()?;
                header.symtab.stroff = reader.read_u32()?;
                header.symtab.strsize = reader.read_u32()?;
            }

            LC_DYSYMTAB => {
                header.dysymtab.ilocalsym = reader.read_u32()?;
                header.dysymtab.nlocalsym = reader.read_u32()?;
                header.dysymtab.iextdefsym = reader.read_u32()?;
                header.dysymtab.nextdefsym = reader.read_u32()?;
                header.dysymtab.iundefsym = reader.read_u32()?;
                header.dysymtab.nundefsym = reader.read_u32()?;
                header.dysymtab.tocoff = reader.read_u32()?;
                header.dysymtab.ntoc = reader.read_u32()?;
                header.dysymtab.modtaboff = reader.read_u32()?;
                header.dysymtab.nmodtab = reader.read_u32()?;
                header.dysymtab.extrefsymoff = reader.read_u32()?;
                header.dysymtab.nextrefsyms = reader.read_u32()?;
                header.dysymtab.indirectsymoff = reader.read_u32()?;
                header.dysymtab.nindirectsyms = reader.read_u32()?;
                header.dysymtab.extreloff = reader.read_u32()?;
                header.dysymtab.nextrel = reader.read_u32()?;
                header.dysymtab.locreloff = reader.read_u32()?;
                header.dysymtab.nlocrel = reader.read_u32()?;
                header.dysym_present = true;
            }

            LC_DYLD_CHAINED_FIXUPS => {
                header.chained_fixups.dataoff = reader.read_u32()?;
                header.chained_fixups.datasize = reader.read_u32()?;
                header.chained_fixups_present = true;
            }

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                header.dyld_info.rebase_off = reader.read_u32()?;
                header.dyld_info.rebase_size = reader.read_u32()?;
                header.dyld_info.bind_off = reader.read_u32()?;
                header.dyld_info.bind_size = reader.read_u32()?;
                header.dyld_info.weak_bind_off = reader.read_u32()?;
                header.dyld_info.weak_bind_size = reader.read_u32()?;
                header.dyld_info.lazy_bind_off = reader.read_u32()?;
                header.dyld_info.lazy_bind_size = reader.read_u32()?;
                header.dyld_info.export_off = reader.read_u32()?;
                header.dyld_info.export_size = reader.read_u32()?;
                header.export_trie.dataoff = header.dyld_info.export_off;
                header.export_trie.datasize = header.dyld_info.export_size;
                header.export_trie_present = true;
                header.dyld_info_present = true;
            }

            LC_DYLD_EXPORTS_TRIE => {
                header.export_trie.dataoff = reader.read_u32()?;
                header.export_trie.datasize = reader.read_u32()?;
                header.export_trie_present = true;
            }

            LC_LOAD_DYLIB => {
                let name_offset = reader.read_u32()? as u64;
                if cur_offset + name_offset < next_offset {
                    let name = reader.read_cstring(cur_offset + name_offset)?;
                    header.dylibs.push(name);
                }
            }

            LC_BUILD_VERSION => {
                header.build_version.platform = reader.read_u32()?;
                header.build_version.minos = reader.read_u32()?;
                header.build_version.sdk = reader.read_u32()?;
                header.build_version.ntools = reader.read_u32()?;
                let ntools = header.build_version.ntools.min(10);
                for _ in 0..ntools {
                    let tool = reader.read_u32()?;
                    let version = reader.read_u32()?;
                    header.build_tool_versions.push(BuildToolVersion { tool, version });
                }
            }

            LC_UUID => {
                reader.read_into(&mut header.uuid)?;
            }

            LC_FILESET_ENTRY => {
                return Err(Error::UnsupportedCommand {
                    cmd,
                    offset: cur_offset,
                });
            }

            other => {
                debug!(cmd = format_args!("{other:#x}"), offset = cur_offset, "skipping load command");
            }
        }

        reader.seek(next_offset);
    }

    for section in &header.sections {
        let end = section.sectname.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&section.sectname[..end]);
        if header.identifier_prefix.is_empty() {
            header.section_names.push(name.into_owned());
        } else {
            header
                .section_names
                .push(format!("{}::{}", header.identifier_prefix, name));
        }
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_flags_at_keeps_last_hit() {
        let mut header = ImageHeader::default();
        let mut outer = Section64 {
            addr: 0x1000,
            size: 0x1000,
            flags: 1,
            ..Section64::default()
        };
        outer.sectname[..6].copy_from_slice(b"__text");
        let mut inner = outer;
        inner.addr = 0x1800;
        inner.size = 0x100;
        inner.flags = 2;
        header.sections = vec![outer, inner];

        assert_eq!(header.section_flags_at(0x1810), Some(2));
        assert_eq!(header.section_flags_at(0x1100), Some(1));
        assert_eq!(header.section_flags_at(0x3000), None);
    }

    #[test]
    fn test_serde_round_trip_skips_runtime_fields() {
        let mut header = ImageHeader {
            text_base: 0x1_8000_0000,
            install_name: "/usr/lib/libtest.dylib".into(),
            identifier_prefix: "libtest.dylib".into(),
            routines_present: true,
            ..ImageHeader::default()
        };
        header.routines64.init_address = 0x1234;

        let json = header.to_json().unwrap();
        let back: ImageHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back.text_base, header.text_base);
        assert_eq!(back.install_name, header.install_name);
        // Runtime-only fields reset on load.
        assert!(!back.routines_present);
        assert_eq!(back.routines64.init_address, 0);
    }
}
