//! Export trie traversal.
//!
//! The export trie is a compressed prefix tree mapping symbol names to
//! image-relative addresses. Tries in system caches can be deep enough to
//! threaten the stack, so the walk uses an explicit work stack of
//! `(node offset, accumulated prefix)` frames instead of recursion.

use tracing::error;

use crate::error::{Error, Result};
use crate::host::{HostView, Symbol, SymbolKind};
use crate::macho::constants::{
    EXPORT_SYMBOL_FLAGS_REEXPORT, S_ATTR_PURE_INSTRUCTIONS, S_ATTR_SOME_INSTRUCTIONS,
};
use crate::macho::ImageHeader;
use crate::pool::MappedFile;

fn read_uleb(buffer: &[u8], cursor: &mut usize) -> Result<u64> {
    let (value, consumed) = crate::util::read_uleb128(&buffer[(*cursor).min(buffer.len())..])
        .ok_or(Error::InvalidUleb128 {
            offset: *cursor as u64,
        })?;
    *cursor += consumed;
    Ok(value)
}

/// Classifies an exported address as code or data.
///
/// Code when the host already analyzes a function there, or when the
/// containing section is attributed as holding instructions.
fn classify(header: &ImageHeader, host: &dyn HostView, addr: u64) -> SymbolKind {
    if host.has_function_at(addr) {
        return SymbolKind::Function;
    }
    match header.section_flags_at(addr) {
        Some(flags) if flags & (S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS) != 0 => {
            SymbolKind::Function
        }
        _ => SymbolKind::Data,
    }
}

/// Walks an export trie held in `buffer`, yielding `(name, address, kind)`
/// symbols with `address = text_base + image offset`.
///
/// Re-exports carry no address and are skipped. A cursor escaping the
/// buffer or a zero child offset aborts the walk with `TrieRead`.
pub fn walk_export_trie(
    buffer: &[u8],
    header: &ImageHeader,
    host: &dyn HostView,
) -> Result<Vec<Symbol>> {
    let mut symbols = Vec::new();
    if buffer.is_empty() {
        return Ok(symbols);
    }

    let end_guard = buffer.len();
    let mut stack: Vec<(usize, String)> = vec![(0, String::new())];

    while let Some((node_offset, prefix)) = stack.pop() {
        if node_offset > end_guard {
            return Err(Error::TrieRead {
                offset: node_offset as u64,
            });
        }

        let mut cursor = node_offset;
        let terminal_size = read_uleb(buffer, &mut cursor)? as usize;
        let child_offset = cursor + terminal_size;

        if terminal_size != 0 {
            let flags = read_uleb(buffer, &mut cursor)?;
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT == 0 {
                let image_offset = read_uleb(buffer, &mut cursor)?;
                let addr = header.text_base + image_offset;
                if !prefix.is_empty() && addr != 0 {
                    symbols.push(Symbol::new(classify(header, host, addr), prefix.clone(), addr));
                }
            }
        }

        cursor = child_offset;
        let child_count = *buffer.get(cursor).ok_or(Error::TrieRead {
            offset: cursor as u64,
        })?;
        cursor += 1;
        if cursor > end_guard {
            return Err(Error::TrieRead {
                offset: cursor as u64,
            });
        }

        // Children are pushed in reverse so they pop in on-disk order.
        let mut children = Vec::with_capacity(child_count as usize);
        for _ in 0..child_count {
            let label_start = cursor;
            while cursor <= end_guard && *buffer.get(cursor).unwrap_or(&0) != 0 {
                cursor += 1;
            }
            let label = String::from_utf8_lossy(&buffer[label_start..cursor.min(end_guard)]);
            cursor += 1;
            if cursor > end_guard {
                return Err(Error::TrieRead {
                    offset: cursor as u64,
                });
            }

            let next = read_uleb(buffer, &mut cursor)?;
            if next == 0 {
                return Err(Error::TrieRead {
                    offset: cursor as u64,
                });
            }
            children.push((next as usize, format!("{prefix}{label}")));
        }
        stack.extend(children.into_iter().rev());
    }

    Ok(symbols)
}

/// Reads an image's export trie out of its link-edit backing file and walks
/// it.
///
/// Failures are logged and yield an empty list; a torn trie must not fail
/// the surrounding load.
pub fn parse_export_trie(
    linkedit_file: &MappedFile,
    header: &ImageHeader,
    host: &dyn HostView,
) -> Vec<Symbol> {
    let buffer = match linkedit_file.read_buffer(
        header.export_trie.dataoff as u64,
        header.export_trie.datasize as u64,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            error!(
                install_name = %header.install_name,
                error = %e,
                "failed to read export trie"
            );
            return Vec::new();
        }
    };

    match walk_export_trie(&buffer, header, host) {
        Ok(symbols) => symbols,
        Err(e) => {
            error!(
                install_name = %header.install_name,
                error = %e,
                "failed to walk export trie"
            );
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CapturingHost;
    use crate::macho::structs::Section64;

    /// `_a`, `_ab`, `_abc` at image offsets 0x10, 0x20, 0x30.
    fn three_symbol_trie() -> Vec<u8> {
        vec![
            // root: no terminal, one child "_a" -> 6
            0x00, 0x01, b'_', b'a', 0x00, 6,
            // node "_a": flags 0, offset 0x10; child "b" -> 13
            0x02, 0x00, 0x10, 0x01, b'b', 0x00, 13,
            // node "_ab": flags 0, offset 0x20; child "c" -> 20
            0x02, 0x00, 0x20, 0x01, b'c', 0x00, 20,
            // node "_abc": flags 0, offset 0x30; no children
            0x02, 0x00, 0x30, 0x00,
        ]
    }

    fn text_header() -> ImageHeader {
        ImageHeader {
            text_base: 0x1_0000_0000,
            ..ImageHeader::default()
        }
    }

    #[test]
    fn test_three_symbols() {
        let host = CapturingHost::new(1);
        let symbols = walk_export_trie(&three_symbol_trie(), &text_header(), &host).unwrap();

        let pairs: Vec<(&str, u64)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.address))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("_a", 0x1_0000_0010),
                ("_ab", 0x1_0000_0020),
                ("_abc", 0x1_0000_0030),
            ]
        );
        assert!(symbols.iter().all(|s| s.kind == SymbolKind::Data));
    }

    #[test]
    fn test_function_classification() {
        let mut header = text_header();
        let mut text = Section64 {
            addr: 0x1_0000_0000,
            size: 0x100,
            flags: S_ATTR_PURE_INSTRUCTIONS,
            ..Section64::default()
        };
        text.sectname[..6].copy_from_slice(b"__text");
        header.sections.push(text);

        let host = CapturingHost::new(1);
        let symbols = walk_export_trie(&three_symbol_trie(), &header, &host).unwrap();
        assert!(symbols.iter().all(|s| s.kind == SymbolKind::Function));
    }

    #[test]
    fn test_host_function_classification() {
        let mut host = CapturingHost::new(1);
        host.add_function_for_analysis(0x1_0000_0020);

        let symbols = walk_export_trie(&three_symbol_trie(), &text_header(), &host).unwrap();
        assert_eq!(symbols[0].kind, SymbolKind::Data);
        assert_eq!(symbols[1].kind, SymbolKind::Function);
        assert_eq!(symbols[2].kind, SymbolKind::Data);
    }

    #[test]
    fn test_reexport_skipped() {
        // terminal: flags = REEXPORT, ordinal 1, no import name
        let trie = vec![
            0x00, 0x01, b'_', b'x', 0x00, 6, // root, child "_x" -> 6
            0x03, 0x08, 0x01, 0x00, 0x00, // "_x": reexport of ordinal 1
        ];
        let host = CapturingHost::new(1);
        let symbols = walk_export_trie(&trie, &text_header(), &host).unwrap();
        assert!(symbols.is_empty());
    }

    #[test]
    fn test_zero_child_offset_fails() {
        let trie = vec![0x00, 0x01, b'_', b'a', 0x00, 0x00];
        let host = CapturingHost::new(1);
        let err = walk_export_trie(&trie, &text_header(), &host).unwrap_err();
        assert!(matches!(err, Error::TrieRead { .. }));
    }

    #[test]
    fn test_truncated_trie_fails() {
        let trie = vec![0x00, 0x01, b'_', b'a', 0x00, 60];
        let host = CapturingHost::new(1);
        assert!(walk_export_trie(&trie, &text_header(), &host).is_err());
    }
}
